//! RTSP-side capability descriptors.
//!
//! `wfd_video_formats` and `wfd_audio_codecs` header values parse into
//! typed descriptors and encode back to the exact wire layout; `none`
//! means absent. The CEA/VESA/HH resolution tables map bitmask indices
//! to concrete display modes.

use std::fmt;
use std::str::FromStr;

use crate::wfd::wfd_error::WfdError;

/// One H.264 codec descriptor inside `wfd_video_formats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct H264Codec {
    pub profile: u8,
    pub level: u8,
    pub cea_sup: u32,
    pub vesa_sup: u32,
    pub hh_sup: u32,
    pub latency: u8,
    pub min_slice_size: u16,
    pub slice_enc_params: u16,
    pub frame_rate_ctrl_sup: u8,
    /// 0 encodes as `none`.
    pub max_hres: u16,
    pub max_vres: u16,
}

impl H264Codec {
    fn parse(s: &str) -> Result<Self, WfdError> {
        let t: Vec<&str> = s.split_whitespace().collect();
        if t.len() != 11 {
            return Err(WfdError::Protocol("malformed wfd_video_formats codec"));
        }
        Ok(Self {
            profile: hex(t[0])?,
            level: hex(t[1])?,
            cea_sup: hex32(t[2])?,
            vesa_sup: hex32(t[3])?,
            hh_sup: hex32(t[4])?,
            latency: hex(t[5])?,
            min_slice_size: hex16(t[6])?,
            slice_enc_params: hex16(t[7])?,
            frame_rate_ctrl_sup: hex(t[8])?,
            max_hres: res16(t[9])?,
            max_vres: res16(t[10])?,
        })
    }
}

impl fmt::Display for H264Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X} {:02X} {:08X} {:08X} {:08X} {:02X} {:04X} {:04X} {:02X} {} {}",
            self.profile,
            self.level,
            self.cea_sup,
            self.vesa_sup,
            self.hh_sup,
            self.latency,
            self.min_slice_size,
            self.slice_enc_params,
            self.frame_rate_ctrl_sup,
            Res(self.max_hres),
            Res(self.max_vres),
        )
    }
}

/// Parsed `wfd_video_formats` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFormats {
    pub native: u8,
    pub pref_disp_mode_sup: u8,
    pub h264_codecs: Vec<H264Codec>,
}

impl VideoFormats {
    /// `None` for the literal `none` value.
    ///
    /// # Errors
    /// Malformed descriptor text.
    pub fn parse(value: &str) -> Result<Option<Self>, WfdError> {
        let value = value.trim();
        if value.starts_with("none") {
            return Ok(None);
        }
        value.parse().map(Some)
    }
}

impl FromStr for VideoFormats {
    type Err = WfdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (head, rest) = split_n_tokens(s, 2)
            .ok_or(WfdError::Protocol("malformed wfd_video_formats header"))?;
        let native = hex(head[0])?;
        let pref_disp_mode_sup = hex(head[1])?;

        let mut h264_codecs = Vec::new();
        if rest.trim() != "none" {
            for codec in rest.split(',') {
                h264_codecs.push(H264Codec::parse(codec)?);
            }
        }

        Ok(Self {
            native,
            pref_disp_mode_sup,
            h264_codecs,
        })
    }
}

impl fmt::Display for VideoFormats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X} {:02X} ", self.native, self.pref_disp_mode_sup)?;
        if self.h264_codecs.is_empty() {
            return f.write_str(" none");
        }
        for (i, c) in self.h264_codecs.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Lpcm,
    Aac,
    Ac3,
}

impl FromStr for AudioFormat {
    type Err = WfdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LPCM" => Ok(Self::Lpcm),
            "AAC" => Ok(Self::Aac),
            "AC3" => Ok(Self::Ac3),
            _ => Err(WfdError::Protocol("unknown audio format")),
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Lpcm => "LPCM",
            Self::Aac => "AAC",
            Self::Ac3 => "AC3",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioCodec {
    pub format: AudioFormat,
    pub modes: u32,
    pub latency: u8,
}

impl FromStr for AudioCodec {
    type Err = WfdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t: Vec<&str> = s.split_whitespace().collect();
        if t.len() != 3 {
            return Err(WfdError::Protocol("malformed wfd_audio_codecs entry"));
        }
        Ok(Self {
            format: t[0].parse()?,
            modes: hex32(t[1])?,
            latency: hex(t[2])?,
        })
    }
}

impl fmt::Display for AudioCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:08X} {:02X}", self.format, self.modes, self.latency)
    }
}

/// Parsed `wfd_audio_codecs` value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AudioCodecs(pub Vec<AudioCodec>);

impl AudioCodecs {
    /// `None` for the literal `none` value.
    ///
    /// # Errors
    /// Malformed descriptor text.
    pub fn parse(value: &str) -> Result<Option<Self>, WfdError> {
        let value = value.trim();
        if value.starts_with("none") {
            return Ok(None);
        }
        value.parse().map(Some)
    }
}

impl FromStr for AudioCodecs {
    type Err = WfdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut codecs = Vec::new();
        for part in s.split(',') {
            codecs.push(part.trim().parse()?);
        }
        Ok(Self(codecs))
    }
}

impl fmt::Display for AudioCodecs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, c) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

// ---- Resolution tables -----------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStandard {
    Cea,
    Vesa,
    Hh,
}

/// One display mode of a resolution table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub index: u8,
    pub hres: u16,
    pub vres: u16,
    pub fps: u16,
    pub progressive: bool,
}

const fn res(index: u8, hres: u16, vres: u16, fps: u16, progressive: bool) -> Resolution {
    Resolution {
        index,
        hres,
        vres,
        fps,
        progressive,
    }
}

pub const RESOLUTIONS_CEA: &[Resolution] = &[
    res(0, 640, 480, 60, true),
    res(1, 720, 480, 60, true),
    res(2, 720, 480, 60, false),
    res(3, 720, 576, 50, true),
    res(4, 720, 576, 50, false),
    res(5, 1280, 720, 30, true),
    res(6, 1280, 720, 60, true),
    res(7, 1920, 1080, 30, true),
    res(8, 1920, 1080, 60, true),
    res(9, 1920, 1080, 60, false),
    res(10, 1280, 720, 25, true),
    res(11, 1280, 720, 50, true),
    res(12, 1920, 1080, 25, true),
    res(13, 1920, 1080, 50, true),
    res(14, 1920, 1080, 50, false),
    res(15, 1280, 720, 24, true),
    res(16, 1920, 1080, 24, true),
];

pub const RESOLUTIONS_VESA: &[Resolution] = &[
    res(0, 800, 600, 30, true),
    res(1, 800, 600, 60, true),
    res(2, 1024, 768, 30, true),
    res(3, 1024, 768, 60, true),
    res(4, 1152, 854, 30, true),
    res(5, 1152, 854, 60, true),
    res(6, 1280, 768, 30, true),
    res(7, 1280, 768, 60, true),
    res(8, 1280, 800, 30, true),
    res(9, 1280, 800, 60, true),
    res(10, 1360, 768, 30, true),
    res(11, 1360, 768, 60, true),
    res(12, 1366, 768, 30, true),
    res(13, 1366, 768, 60, true),
    res(14, 1280, 1024, 30, true),
    res(15, 1280, 1024, 60, true),
    res(16, 1440, 1050, 30, true),
    res(17, 1440, 1050, 60, true),
    res(18, 1440, 900, 30, true),
    res(19, 1440, 900, 60, true),
    res(20, 1600, 900, 30, true),
    res(21, 1600, 900, 60, true),
    res(22, 1600, 1200, 30, true),
    res(23, 1600, 1200, 60, true),
    res(24, 1680, 1024, 30, true),
    res(25, 1680, 1024, 60, true),
    res(26, 1680, 1050, 30, true),
    res(27, 1680, 1050, 60, true),
    res(28, 1920, 1200, 30, true),
];

pub const RESOLUTIONS_HH: &[Resolution] = &[
    res(0, 800, 480, 30, true),
    res(1, 800, 480, 60, true),
    res(2, 854, 480, 30, true),
    res(3, 854, 480, 60, true),
    res(4, 864, 480, 30, true),
    res(5, 864, 480, 60, true),
    res(6, 640, 360, 30, true),
    res(7, 640, 360, 60, true),
    res(8, 960, 540, 30, true),
    res(9, 960, 540, 60, true),
    res(10, 848, 480, 30, true),
    res(11, 848, 480, 60, true),
];

#[must_use]
pub fn resolutions(std: ResolutionStandard) -> &'static [Resolution] {
    match std {
        ResolutionStandard::Cea => RESOLUTIONS_CEA,
        ResolutionStandard::Vesa => RESOLUTIONS_VESA,
        ResolutionStandard::Hh => RESOLUTIONS_HH,
    }
}

/// A mask covering every table index up to `index`, inclusive.
#[must_use]
pub fn resolution_mask_up_to(index: u8) -> u32 {
    (1u32 << (u32::from(index) + 1)) - 1
}

/// The best (highest-index) mode selected by `mask`.
#[must_use]
pub fn highest_resolution(std: ResolutionStandard, mask: u32) -> Option<Resolution> {
    resolutions(std)
        .iter()
        .rev()
        .find(|r| mask & (1 << r.index) != 0)
        .copied()
}

// ---- Helpers ---------------------------------------------------------

struct Res(u16);

impl fmt::Display for Res {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            f.write_str("none")
        } else {
            write!(f, "{:04X}", self.0)
        }
    }
}

fn hex(s: &str) -> Result<u8, WfdError> {
    u8::from_str_radix(s, 16).map_err(|_| WfdError::Protocol("bad hex field"))
}

fn hex16(s: &str) -> Result<u16, WfdError> {
    u16::from_str_radix(s, 16).map_err(|_| WfdError::Protocol("bad hex field"))
}

fn hex32(s: &str) -> Result<u32, WfdError> {
    u32::from_str_radix(s, 16).map_err(|_| WfdError::Protocol("bad hex field"))
}

fn res16(s: &str) -> Result<u16, WfdError> {
    if s == "none" {
        Ok(0)
    } else {
        hex16(s)
    }
}

/// First `n` whitespace tokens and the untouched remainder.
fn split_n_tokens(s: &str, n: usize) -> Option<(Vec<&str>, &str)> {
    let mut tokens = Vec::with_capacity(n);
    let mut rest = s;
    for _ in 0..n {
        rest = rest.trim_start();
        let end = rest.find(char::is_whitespace)?;
        tokens.push(&rest[..end]);
        rest = &rest[end..];
    }
    Some((tokens, rest.trim_start()))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    use super::*;

    #[test]
    fn video_formats_round_trip() {
        let s = "00 00 02 10 00000080 00000000 00000000 00 0000 0000 00 none none";
        let v: VideoFormats = s.parse().expect("parses");
        assert_eq!(v.native, 0);
        assert_eq!(v.h264_codecs.len(), 1);
        assert_eq!(v.h264_codecs[0].profile, 0x02);
        assert_eq!(v.h264_codecs[0].level, 0x10);
        assert_eq!(v.h264_codecs[0].cea_sup, 0x80);
        assert_eq!(v.h264_codecs[0].max_hres, 0);

        assert_eq!(v.to_string(), s);
    }

    #[test]
    fn video_formats_none_and_multi_codec() {
        assert_eq!(VideoFormats::parse("none").expect("parses"), None);

        let s = "40 01 01 08 00000001 00000000 00000000 00 0000 0000 00 0400 0300, \
                 02 04 0001DEFF 1FFFFFFF 00000FFF 00 0000 0000 11 none none";
        let v: VideoFormats = s.parse().expect("parses");
        assert_eq!(v.native, 0x40);
        assert_eq!(v.pref_disp_mode_sup, 0x01);
        assert_eq!(v.h264_codecs.len(), 2);
        assert_eq!(v.h264_codecs[0].max_hres, 0x0400);
        assert_eq!(v.h264_codecs[1].cea_sup, 0x0001_DEFF);
    }

    #[test]
    fn audio_codecs_round_trip() {
        let s = "LPCM 00000003 00, AAC 00000001 00";
        let a: AudioCodecs = s.parse().expect("parses");
        assert_eq!(a.0.len(), 2);
        assert_eq!(a.0[0].format, AudioFormat::Lpcm);
        assert_eq!(a.0[0].modes, 3);
        assert_eq!(a.0[1].format, AudioFormat::Aac);
        assert_eq!(a.to_string(), s);

        assert_eq!(AudioCodecs::parse("none").expect("parses"), None);
        assert!("NOISE 00000001 00".parse::<AudioCodecs>().is_err());
    }

    #[test]
    fn resolution_lookup_picks_highest_mode() {
        let r = highest_resolution(ResolutionStandard::Cea, 0x80).expect("mode");
        assert_eq!((r.hres, r.vres, r.fps), (1920, 1080, 30));

        let r = highest_resolution(ResolutionStandard::Cea, 0x3).expect("mode");
        assert_eq!((r.hres, r.vres), (720, 480));

        assert!(highest_resolution(ResolutionStandard::Hh, 0).is_none());
    }

    #[test]
    fn resolution_mask_covers_lower_indices() {
        assert_eq!(resolution_mask_up_to(0), 0x1);
        assert_eq!(resolution_mask_up_to(7), 0xFF);
    }
}
