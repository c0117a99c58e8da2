use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::parse::DEFAULT_MAX_LINE_BYTES;
use crate::protocol::{CHUNK_SIZE, MAX_DATA_POINTS};

/// Client tunables.
///
/// Every field has a default, so a config file only needs the keys it
/// changes:
///
/// ```
/// let cfg: ledsense_rs::ClientConfig =
///     serde_json::from_str(r#"{ "scan_timeout_secs": 8 }"#).unwrap();
/// assert_eq!(cfg.scan_timeout_secs, 8);
/// assert_eq!(cfg.chunk_size, 20);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// How long a discovery scan listens for advertisements.
    pub scan_timeout_secs: u64,
    /// Upper bound on establishing a link.
    pub connect_timeout_secs: u64,
    /// Upper bound on a single chunk write.
    pub write_timeout_ms: u64,
    /// Outbound chunk size in bytes.
    pub chunk_size: usize,
    /// Records kept per channel.
    pub buffer_capacity: usize,
    /// Largest partial line the decoder buffers before discarding it.
    pub max_line_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            scan_timeout_secs: 5,
            connect_timeout_secs: 10,
            write_timeout_ms: 2000,
            chunk_size: CHUNK_SIZE,
            buffer_capacity: MAX_DATA_POINTS,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

impl ClientConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(Error::Config)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_object_gives_defaults() {
        let cfg: ClientConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, ClientConfig::default());
        assert_eq!(cfg.connect_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.write_timeout(), Duration::from_millis(2000));
    }

    #[test]
    fn loads_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"buffer_capacity": 250, "chunk_size": 64}}"#).unwrap();
        let cfg = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.buffer_capacity, 250);
        assert_eq!(cfg.chunk_size, 64);
        assert_eq!(cfg.scan_timeout_secs, 5);
    }

    #[test]
    fn bad_file_is_a_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "scan_timeout_secs = 3").unwrap();
        assert!(matches!(
            ClientConfig::from_file(file.path()),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            ClientConfig::from_file("/nonexistent/ledsense.json"),
            Err(Error::Io(_))
        ));
    }
}
