use anyhow::{anyhow, Result};

mod fjall;

pub use self::fjall::FjallStore;

/// Big-endian so that keys sort by height
pub(crate) fn height_key(height: u64) -> [u8; 8] {
    height.to_be_bytes()
}

pub(crate) fn height_from_key(key: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = key.try_into().map_err(|_| anyhow!("bad height key of {} bytes", key.len()))?;
    Ok(u64::from_be_bytes(bytes))
}
