use rand::Rng;
use std::time::Duration;

/// Reconnect delay for the given attempt: exponential from `min_ms`, capped at
/// `max_ms`, with up to 50% random jitter added on top of half the base.
pub fn reconnect_delay(attempt: u32, min_ms: u64, max_ms: u64) -> Duration {
    let base = min_ms
        .saturating_mul(1u64 << attempt.min(16))
        .min(max_ms)
        .max(1);
    let mut rng = rand::thread_rng();
    let delay_ms = rng.gen_range(base / 2..=base);
    Duration::from_millis(delay_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_stays_near_minimum() {
        for _ in 0..100 {
            let d = reconnect_delay(0, 200, 10_000);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(200));
        }
    }

    #[test]
    fn delay_is_capped() {
        for attempt in [10, 20, 60] {
            let d = reconnect_delay(attempt, 200, 1_000);
            assert!(d <= Duration::from_millis(1_000));
            assert!(d >= Duration::from_millis(500));
        }
    }
}
