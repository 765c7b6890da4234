//! Retry backoff: `min(base * 2^attempts, cap)` plus uniform jitter in
//! `[0, base)`.

use rand::Rng;
use std::time::Duration;

pub fn backoff_delay(attempts: i32, base_secs: u64, cap_secs: u64) -> Duration {
    let attempts = attempts.clamp(0, 30) as u32;
    let exp = base_secs.saturating_mul(1u64 << attempts.min(20));
    let capped = exp.min(cap_secs);

    let jitter_ms = if base_secs == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..base_secs * 1000)
    };

    Duration::from_secs(capped) + Duration::from_millis(jitter_ms)
}
