use serde::{Deserialize, Serialize};

use proxmox_human_byte::HumanByte;

/// Which direction of a stream is throttled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThrottleMode {
    /// Only data read from the stream.
    Read,
    /// Only data written to the stream.
    Write,
    /// Both directions, sharing one bucket.
    #[default]
    Both,
}

serde_plain::derive_display_from_serialize!(ThrottleMode);
serde_plain::derive_fromstr_from_deserialize!(ThrottleMode);

impl ThrottleMode {
    pub fn throttles_read(self) -> bool {
        matches!(self, ThrottleMode::Read | ThrottleMode::Both)
    }

    pub fn throttles_write(self) -> bool {
        matches!(self, ThrottleMode::Write | ThrottleMode::Both)
    }
}

/// Throttle settings, e.g. from a configuration file.
///
/// ```
/// # use proxmox_bandwidth_throttle::{ThrottleConfig, ThrottleMode};
/// let config: ThrottleConfig = serde_json::from_str(
///     r#"{ "rate": "100 KiB", "burst": "1 MiB", "mode": "write" }"#,
/// ).unwrap();
/// assert_eq!(config.mode, ThrottleMode::Write);
/// ```
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ThrottleConfig {
    /// Bytes per second.
    pub rate: HumanByte,

    /// Burst capacity, defaults to one second worth of data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst: Option<HumanByte>,

    /// Bytes which can pass instantly after the throttle was attached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_burst: Option<HumanByte>,

    #[serde(default)]
    pub mode: ThrottleMode,

    /// Storage key, only relevant for shared storages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl ThrottleConfig {
    pub fn new(rate: HumanByte) -> Self {
        Self {
            rate,
            burst: None,
            initial_burst: None,
            mode: ThrottleMode::default(),
            key: None,
        }
    }
}
