use rand::Rng;

/// Deterministic envelope of the capped exponential: `min * 2^n` clamped
/// to `[min, max]`. The jittered delay is drawn from the half-open band
/// below this value, so the envelope is what grows monotonically with the
/// failure count until it saturates at `max`.
pub fn backoff_envelope(failure_count: u32, min_secs: u64, max_secs: u64) -> f64 {
    let min = min_secs as f64;
    let max = max_secs as f64;
    (min * 2f64.powi(failure_count.min(63) as i32)).clamp(min, max)
}

/// Capped exponential backoff with jitter.
///
/// Returns a delay in `[min_secs, max_secs)`: uniformly drawn from
/// `[envelope/2, envelope)` and floored at `min_secs`, so a fleet of
/// agents failing in lockstep does not re-synchronize its retries.
pub fn retry_backoff(failure_count: u32, min_secs: u64, max_secs: u64) -> u64 {
    backoff_with_rng(failure_count, min_secs, max_secs, &mut rand::thread_rng())
}

/// Same as [`retry_backoff`] with a caller-supplied RNG.
pub fn backoff_with_rng<R: Rng>(
    failure_count: u32,
    min_secs: u64,
    max_secs: u64,
    rng: &mut R,
) -> u64 {
    let envelope = backoff_envelope(failure_count, min_secs, max_secs);
    let lo = (envelope / 2.0).max(min_secs as f64);
    if envelope <= lo {
        return lo as u64;
    }
    rng.gen_range(lo..envelope) as u64
}
