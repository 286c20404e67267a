use proxmox_human_byte::HumanByte;

use crate::Error;

/// Units accepted by the [`BandwidthThrottle`](crate::BandwidthThrottle)
/// setters. Parsing and formatting of sizes is left to [`HumanByte`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ByteUnit {
    Bytes,
    /// 1000 bytes
    Kilobytes,
    /// 1024 bytes
    Kibibytes,
    /// 1000 kilobytes
    Megabytes,
    /// 1024 kibibytes
    Mebibytes,
}

impl ByteUnit {
    pub const fn factor(self) -> u64 {
        match self {
            ByteUnit::Bytes => 1,
            ByteUnit::Kilobytes => 1_000,
            ByteUnit::Kibibytes => 1_024,
            ByteUnit::Megabytes => 1_000_000,
            ByteUnit::Mebibytes => 1_048_576,
        }
    }

    /// Converts `amount` of this unit into bytes.
    pub fn to_bytes(self, amount: u64) -> Result<u64, Error> {
        amount.checked_mul(self.factor()).ok_or_else(|| {
            Error::InvalidConfiguration(format!("{amount} x {} bytes overflow", self.factor()))
        })
    }
}

/// Whole bytes of a configured size.
pub(crate) fn human_bytes(size: &HumanByte) -> Result<u64, Error> {
    let bytes = size.as_f64();
    if !bytes.is_finite() || bytes < 0.0 || bytes >= u64::MAX as f64 {
        return Err(Error::InvalidConfiguration(format!(
            "byte size '{size}' out of range"
        )));
    }
    Ok(bytes as u64)
}
