//! Utility functions for blockorc

use chrono::{DateTime, SecondsFormat, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;

const BLOCK_SIZE: u64 = 4096;

/// RFC3339 UTC timestamp with a `Z` suffix and second precision
pub fn format_time_z(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Short random identifier for instance and snapshot names (lowercase alphanumeric)
pub fn random_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect()
}

/// Round a volume size up to a whole block; zero becomes one block.
/// `None` when the rounded size does not fit in a `u64`.
pub fn round_up_size(size: u64) -> Option<u64> {
    if size == 0 {
        return Some(BLOCK_SIZE);
    }
    size.div_ceil(BLOCK_SIZE).checked_mul(BLOCK_SIZE)
}

/// Validate a volume name (non-empty, DNS-label friendly)
pub fn validate_name(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(crate::Error::InvalidArgument("name cannot be empty".into()));
    }

    if name.len() > 63 {
        return Err(crate::Error::InvalidArgument(
            "name too long (max 63 chars)".into(),
        ));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(crate::Error::InvalidArgument(format!(
            "name contains invalid characters: '{}'",
            name
        )));
    }

    Ok(())
}
