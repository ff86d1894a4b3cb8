//! Wi-Fi Display sub-element TLVs.
//!
//! Peers advertise a concatenation of TLVs as one hex string
//! (`wfd_subelems` in supplicant reports). Each TLV is a 1-byte id, a
//! 2-byte big-endian payload length and the payload itself, all hex
//! encoded: `IIDDDD<payload>`. Unknown ids are skipped when scanning.

use crate::wfd::wfd_error::WfdError;

pub const SUBE_ID_DEVICE_INFO: u8 = 0;
pub const SUBE_ID_AUDIO_FORMATS: u8 = 1;
pub const SUBE_ID_VIDEO_FORMATS: u8 = 2;
pub const SUBE_ID_EXTENDED_CAPS: u8 = 7;

/// WFD session role advertised in the Device Info bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRole {
    Source,
    PrimarySink,
    SecondarySink,
    DualRole,
}

/// Device Info sub-element (id 0, 6 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub dev_info: u16,
    pub rtsp_port: u16,
    pub max_throughput: u16,
}

impl DeviceInfo {
    #[must_use]
    pub fn role(&self) -> DeviceRole {
        match self.dev_info & 0x3 {
            0 => DeviceRole::Source,
            1 => DeviceRole::PrimarySink,
            2 => DeviceRole::SecondarySink,
            _ => DeviceRole::DualRole,
        }
    }

    /// The peer can render a stream we send.
    #[must_use]
    pub fn is_sink(&self) -> bool {
        !matches!(self.role(), DeviceRole::Source)
    }

    /// Hex encoding as advertised over WPS, including the TLV envelope.
    #[must_use]
    pub fn to_sube_string(&self) -> String {
        format!(
            "{:02x}{:04x}{:04x}{:04x}{:04x}",
            SUBE_ID_DEVICE_INFO, 6, self.dev_info, self.rtsp_port, self.max_throughput
        )
    }
}

/// Audio Formats sub-element (id 1, 15 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioCaps {
    pub lpcm_modes: u32,
    pub lpcm_latency: u8,
    pub aac_modes: u32,
    pub aac_latency: u8,
    pub ac3_modes: u32,
    pub ac3_latency: u8,
}

/// Video Formats sub-element (id 2, 21 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoCaps {
    pub cea: u32,
    pub vesa: u32,
    pub hh: u32,
    /// Native display mode: table index plus standard selector bits.
    pub native: u8,
    pub profiles: u8,
    pub levels: u8,
    pub latency: u8,
    pub min_slice_size: u16,
    pub slice_enc_params: u16,
    pub frame_rate_ctl: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sube {
    DeviceInfo(DeviceInfo),
    Audio(AudioCaps),
    Video(VideoCaps),
    ExtendedCaps(u16),
}

impl Sube {
    #[must_use]
    pub fn id(&self) -> u8 {
        match self {
            Self::DeviceInfo(_) => SUBE_ID_DEVICE_INFO,
            Self::Audio(_) => SUBE_ID_AUDIO_FORMATS,
            Self::Video(_) => SUBE_ID_VIDEO_FORMATS,
            Self::ExtendedCaps(_) => SUBE_ID_EXTENDED_CAPS,
        }
    }

    /// Parse every known TLV out of a concatenated hex string.
    ///
    /// # Errors
    /// Truncated or non-hex input. Unknown ids are skipped, not errors.
    pub fn parse_all(s: &str) -> Result<Vec<Self>, WfdError> {
        let s = s.trim();
        let mut out = Vec::new();
        let mut pos = 0;

        while pos < s.len() {
            let id = hex_u8(s, pos)?;
            let len = hex_u16(s, pos + 2)? as usize;
            let payload_at = pos + 6;
            let payload_end = payload_at + len * 2;
            if payload_end > s.len() {
                return Err(WfdError::Sube("truncated sub-element payload"));
            }

            if let Some(sube) = Self::parse_payload(id, len, s, payload_at)? {
                out.push(sube);
            }
            pos = payload_end;
        }

        Ok(out)
    }

    /// Parse a single TLV of a known id, envelope included.
    ///
    /// # Errors
    /// Wrong id, wrong length, truncated or non-hex input.
    pub fn parse_with_id(id: u8, s: &str) -> Result<Self, WfdError> {
        let s = s.trim();
        let got = hex_u8(s, 0)?;
        if got != id {
            return Err(WfdError::Sube("unexpected sub-element id"));
        }
        let len = hex_u16(s, 2)? as usize;
        Self::parse_payload(id, len, s, 6)?.ok_or(WfdError::Sube("unsupported sub-element id"))
    }

    fn parse_payload(id: u8, len: usize, s: &str, at: usize) -> Result<Option<Self>, WfdError> {
        let expect = |want: usize| {
            if len == want {
                Ok(())
            } else {
                Err(WfdError::Sube("sub-element length mismatch"))
            }
        };

        match id {
            SUBE_ID_DEVICE_INFO => {
                expect(6)?;
                Ok(Some(Self::DeviceInfo(DeviceInfo {
                    dev_info: hex_u16(s, at)?,
                    rtsp_port: hex_u16(s, at + 4)?,
                    max_throughput: hex_u16(s, at + 8)?,
                })))
            }
            SUBE_ID_AUDIO_FORMATS => {
                expect(15)?;
                Ok(Some(Self::Audio(AudioCaps {
                    lpcm_modes: hex_u32(s, at)?,
                    lpcm_latency: hex_u8(s, at + 8)?,
                    aac_modes: hex_u32(s, at + 10)?,
                    aac_latency: hex_u8(s, at + 18)?,
                    ac3_modes: hex_u32(s, at + 20)?,
                    ac3_latency: hex_u8(s, at + 28)?,
                })))
            }
            SUBE_ID_VIDEO_FORMATS => {
                expect(21)?;
                Ok(Some(Self::Video(VideoCaps {
                    cea: hex_u32(s, at)?,
                    vesa: hex_u32(s, at + 8)?,
                    hh: hex_u32(s, at + 16)?,
                    native: hex_u8(s, at + 24)?,
                    profiles: hex_u8(s, at + 26)?,
                    levels: hex_u8(s, at + 28)?,
                    latency: hex_u8(s, at + 30)?,
                    min_slice_size: hex_u16(s, at + 32)?,
                    slice_enc_params: hex_u16(s, at + 36)?,
                    frame_rate_ctl: hex_u8(s, at + 40)?,
                })))
            }
            SUBE_ID_EXTENDED_CAPS => {
                expect(2)?;
                Ok(Some(Self::ExtendedCaps(hex_u16(s, at)?)))
            }
            _ => Ok(None),
        }
    }
}

/// Device Info of a peer, from its concatenated sub-element string.
///
/// # Errors
/// Propagates TLV parse failures; `Sube` when no Device Info is present.
pub fn find_device_info(subelements: &str) -> Result<DeviceInfo, WfdError> {
    Sube::parse_all(subelements)?
        .into_iter()
        .find_map(|s| match s {
            Sube::DeviceInfo(d) => Some(d),
            _ => None,
        })
        .ok_or(WfdError::Sube("no device-info sub-element"))
}

fn hex_slice(s: &str, at: usize, len: usize) -> Result<&str, WfdError> {
    s.get(at..at + len)
        .ok_or(WfdError::Sube("truncated sub-element"))
}

fn hex_u8(s: &str, at: usize) -> Result<u8, WfdError> {
    u8::from_str_radix(hex_slice(s, at, 2)?, 16).map_err(|_| WfdError::Sube("bad hex digit"))
}

fn hex_u16(s: &str, at: usize) -> Result<u16, WfdError> {
    u16::from_str_radix(hex_slice(s, at, 4)?, 16).map_err(|_| WfdError::Sube("bad hex digit"))
}

fn hex_u32(s: &str, at: usize) -> Result<u32, WfdError> {
    u32::from_str_radix(hex_slice(s, at, 8)?, 16).map_err(|_| WfdError::Sube("bad hex digit"))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    use super::*;

    #[test]
    fn device_info_from_seed_scenario() {
        // 0006 1C44 00C8 after the id/len envelope: a primary sink
        // listening on RTSP port 7236.
        let d = find_device_info("00000600061c4400c8").expect("device info");
        assert_eq!(d.dev_info, 0x0006);
        assert_eq!(d.rtsp_port, 0x1c44);
        assert_eq!(d.rtsp_port, 7236);
        assert_eq!(d.max_throughput, 0x00c8);
        assert_eq!(d.role(), DeviceRole::SecondarySink);
        assert!(d.is_sink());
    }

    #[test]
    fn roles_decode_from_low_bits() {
        let mk = |bits: u16| DeviceInfo {
            dev_info: bits,
            rtsp_port: 7236,
            max_throughput: 0,
        };
        assert_eq!(mk(0).role(), DeviceRole::Source);
        assert_eq!(mk(1).role(), DeviceRole::PrimarySink);
        assert_eq!(mk(2).role(), DeviceRole::SecondarySink);
        assert_eq!(mk(3).role(), DeviceRole::DualRole);
        assert!(!mk(0).is_sink());
    }

    #[test]
    fn concatenation_skips_unknown_ids() {
        // id 6 (unknown, 1 byte), then device info, then ext caps.
        let s = ["060001aa", "000006", "01111c44012c", "070002", "0003"].concat();
        let all = Sube::parse_all(&s).expect("parses");
        assert_eq!(all.len(), 2);
        match all[0] {
            Sube::DeviceInfo(d) => {
                assert_eq!(d.dev_info, 0x0111);
                assert_eq!(d.rtsp_port, 7236);
            }
            _ => panic!("expected device info"),
        }
        assert!(matches!(all[1], Sube::ExtendedCaps(0x0003)));
    }

    #[test]
    fn parse_with_id_checks_envelope() {
        let d = Sube::parse_with_id(SUBE_ID_DEVICE_INFO, "000006000111c4012c").expect("parses");
        assert!(matches!(d, Sube::DeviceInfo(_)));

        assert!(Sube::parse_with_id(SUBE_ID_AUDIO_FORMATS, "000006000111c4012c").is_err());
        assert!(Sube::parse_with_id(SUBE_ID_DEVICE_INFO, "00000500011c44012c").is_err());
        assert!(Sube::parse_with_id(SUBE_ID_DEVICE_INFO, "0000060001").is_err());
    }

    #[test]
    fn audio_and_video_caps_parse() {
        // Audio: lpcm 00000003/00, aac 00000001/00, ac3 00000000/00.
        let audio = [
            "01000f", "00000003", "00", "00000001", "00", "00000000", "00",
        ]
        .concat();
        let all = Sube::parse_all(&audio).expect("audio parses");
        match all[0] {
            Sube::Audio(a) => {
                assert_eq!(a.lpcm_modes, 3);
                assert_eq!(a.aac_modes, 1);
                assert_eq!(a.ac3_modes, 0);
            }
            _ => panic!("expected audio caps"),
        }

        let video = [
            "020015", "000000ff", "00000000", "00000000", "00", "02", "10", "00", "0000",
            "0000", "00",
        ]
        .concat();
        let all = Sube::parse_all(&video).expect("video parses");
        match all[0] {
            Sube::Video(v) => {
                assert_eq!(v.cea, 0xff);
                assert_eq!(v.native, 0);
                assert_eq!(v.profiles, 0x02);
                assert_eq!(v.levels, 0x10);
            }
            _ => panic!("expected video caps"),
        }
    }

    #[test]
    fn device_info_round_trips_through_sube_string() {
        let d = DeviceInfo {
            dev_info: 0x0111,
            rtsp_port: 7236,
            max_throughput: 300,
        };
        let s = d.to_sube_string();
        let back = find_device_info(&s).expect("round trip");
        assert_eq!(back, d);
    }
}
