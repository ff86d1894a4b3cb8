use std::collections::HashMap;
use std::fs;

/// INI-style daemon configuration: `[section]` blocks of `key=value` pairs
/// plus bare globals before the first section header.
#[derive(Debug, Default)]
pub struct Config {
    pub globals: HashMap<String, String>,
    pub sections: HashMap<String, HashMap<String, String>>,
}

impl Config {
    /// # Errors
    /// Returns a message naming the unreadable file.
    pub fn load(path: &str) -> Result<Self, String> {
        let content =
            fs::read_to_string(path).map_err(|e| format!("Error reading file {path}: {e}"))?;
        Ok(Self::from_str_lossy(&content))
    }

    /// Try a chain of candidate paths, first readable wins.
    ///
    /// # Errors
    /// Returns the last load error when none of the paths is readable.
    pub fn load_first(paths: &[&str]) -> Result<Self, String> {
        let mut last = String::from("no config paths given");
        for path in paths {
            match Self::load(path) {
                Ok(c) => return Ok(c),
                Err(e) => last = e,
            }
        }
        Err(last)
    }

    /// Parse from an in-memory string. Unparseable lines are skipped, the
    /// way the daemon tolerates hand-edited config files.
    #[must_use]
    pub fn from_str_lossy(content: &str) -> Self {
        let mut globals = HashMap::new();
        let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut current_section: Option<String> = None;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                let name = &line[1..line.len() - 1];
                current_section = Some(name.to_string());
                continue;
            }

            if let Some(pos) = line.find('=') {
                let key = line[..pos].trim().to_string();
                let value = line[pos + 1..].trim().trim_matches('"').to_string();

                match &current_section {
                    None => {
                        globals.insert(key, value);
                    }
                    Some(sec) => {
                        sections.entry(sec.clone()).or_default().insert(key, value);
                    }
                }
            }
        }
        Config { globals, sections }
    }

    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|sec| sec.get(key))
            .map(String::as_str)
    }

    #[must_use]
    pub fn get_non_empty(&self, section: &str, key: &str) -> Option<&str> {
        self.get(section, key).filter(|s| !s.is_empty())
    }

    #[must_use]
    pub fn get_global(&self, key: &str) -> Option<&str> {
        self.globals.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn get_or_default<'a>(&'a self, section: &str, key: &str, default: &'a str) -> &'a str {
        self.get(section, key)
            .or_else(|| self.get_global(key))
            .unwrap_or(default)
    }

    /// Numeric lookup with fallback; unparseable values fall back too.
    #[must_use]
    pub fn get_u16(&self, section: &str, key: &str, default: u16) -> u16 {
        self.get(section, key)
            .and_then(|s| s.parse().ok())
            .unwrap_or(default)
    }

    #[must_use]
    pub fn get_u64(&self, section: &str, key: &str, default: u64) -> u64 {
        self.get(section, key)
            .and_then(|s| s.parse().ok())
            .unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sections_and_globals() {
        let c = Config::from_str_lossy(
            "log_level=debug\n\
             # comment\n\
             [Wifi]\n\
             ctrl_dir=/run/miracle/wifi\n\
             config_methods = \"pbc\"\n\
             [Wfd]\n\
             rtsp_port=7236\n",
        );

        assert_eq!(c.get_global("log_level"), Some("debug"));
        assert_eq!(c.get("Wifi", "ctrl_dir"), Some("/run/miracle/wifi"));
        assert_eq!(c.get("Wifi", "config_methods"), Some("pbc"));
        assert_eq!(c.get_u16("Wfd", "rtsp_port", 0), 7236);
        assert_eq!(c.get("Wfd", "missing"), None);
    }

    #[test]
    fn defaults_and_global_fallback() {
        let c = Config::from_str_lossy("friendly_name=TestCast\n[Wfd]\n");
        assert_eq!(
            c.get_or_default("Wfd", "friendly_name", "Miracle"),
            "TestCast"
        );
        assert_eq!(c.get_or_default("Wfd", "nothing", "fallback"), "fallback");
        assert_eq!(c.get_u16("Wfd", "rtsp_port", 7236), 7236);
    }

    #[test]
    fn skips_malformed_lines() {
        let c = Config::from_str_lossy("[Wifi]\nno equals sign here\nkey=value\n");
        assert_eq!(c.get("Wifi", "key"), Some("value"));
        assert_eq!(c.sections.get("Wifi").map(HashMap::len), Some(1));
    }
}
