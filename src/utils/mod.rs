pub mod hash;

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in whole seconds. All expiry, lock, and age
/// arithmetic in the engine runs on this clock.
#[inline]
pub fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
