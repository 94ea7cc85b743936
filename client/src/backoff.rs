//! Reconnect delay schedule: exponential doubling with an upper clamp,
//! plus additive jitter so a fleet of dashboards does not reconnect in
//! lockstep after a server restart.

use std::time::Duration;

use rand::Rng;

/// Delay before reconnect attempt number `attempt` (1-based). Doubles each
/// attempt starting from `base`, clamped to `max`. Saturates instead of
/// overflowing for absurd attempt numbers.
pub fn delay_for(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp = attempt.saturating_sub(1);
    let factor = if exp >= 63 { u64::MAX } else { 1u64 << exp };
    let millis = u64::try_from(base.as_millis())
        .unwrap_or(u64::MAX)
        .saturating_mul(factor);
    let max_millis = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(millis.min(max_millis))
}

/// Add up to 30% random jitter on top of `delay`.
pub fn jittered(delay: Duration, rng: &mut impl Rng) -> Duration {
    let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    let spread = millis / 10 * 3;
    let extra = if spread == 0 {
        0
    } else {
        rng.gen_range(0..=spread)
    };
    Duration::from_millis(millis.saturating_add(extra))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const BASE: Duration = Duration::from_millis(1000);
    const MAX: Duration = Duration::from_millis(30_000);

    #[test]
    fn doubles_then_clamps() {
        let delays: Vec<u64> = (1..=7)
            .map(|attempt| delay_for(attempt, BASE, MAX).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16_000, 30_000, 30_000]);
    }

    #[test]
    fn huge_attempt_numbers_saturate_at_max() {
        assert_eq!(delay_for(64, BASE, MAX), MAX);
        assert_eq!(delay_for(u32::MAX, BASE, MAX), MAX);
    }

    #[test]
    fn jitter_stays_within_thirty_percent() {
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 1..=6 {
            let delay = delay_for(attempt, BASE, MAX);
            for _ in 0..100 {
                let j = jittered(delay, &mut rng);
                assert!(j >= delay);
                assert!(j <= delay + delay * 3 / 10);
            }
        }
    }

    #[test]
    fn jitter_of_zero_delay_is_zero() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(jittered(Duration::ZERO, &mut rng), Duration::ZERO);
    }
}
