//! TTL jitter.
//!
//! Entries written at the same moment with the same TTL expire at the same
//! moment and reload together. Every fresh write therefore stretches its TTL
//! by a random factor; short TTLs get proportionally more slack than long
//! ones so a 5 minute entry may double while a week-long entry barely moves.

use rand::Rng;
use std::time::Duration;

const MINUTE: u64 = 60;
const HOUR: u64 = 3600;

/// Upper bound of the random stretch for a given base duration. The jittered
/// duration lands in `[d, d * (1 + upper))`.
fn upper_factor(d: Duration) -> f64 {
    let secs = d.as_secs();
    if secs <= MINUTE {
        0.0
    } else if secs <= 15 * MINUTE {
        1.2
    } else if secs <= HOUR {
        1.15
    } else if secs <= 6 * HOUR {
        1.10
    } else if secs <= 24 * HOUR {
        1.05
    } else {
        1.025
    }
}

/// Stretch `d` by a random multiplier in `[1, 1 + upper(d))`.
///
/// Drawn once per logical write; the coordinator hands the same jittered
/// duration to every tier so absolute expiries stay ordered L1 <= L2 <= L3.
pub fn jitter_ttl<R: Rng + ?Sized>(rng: &mut R, d: Duration) -> Duration {
    let upper = upper_factor(d);
    if upper == 0.0 {
        return d;
    }
    let multiplier = 1.0 + rng.r#gen::<f64>() * upper;
    d.mul_f64(multiplier)
}
