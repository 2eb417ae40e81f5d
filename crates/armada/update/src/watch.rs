//! Watch schedule for instances coming up after an update

use std::time::Duration;

/// Number of polls spread over a watch window
pub const WATCH_INTERVALS: u32 = 10;

/// Shortest gap between two polls, in milliseconds
const MIN_STEP_MS: f64 = 1000.0;

/// Delays between `get_state` polls for a `[min_ms, max_ms]` window
///
/// The first delay is `min_ms`; the rest of the window is split into
/// `intervals` equal steps, none shorter than one second. The delays never
/// add up to more than `max_ms`.
pub fn watch_schedule(min_ms: u64, max_ms: u64, intervals: u32) -> Vec<Duration> {
    let delta = max_ms.saturating_sub(min_ms) as f64;
    let step = (delta / f64::from(intervals.max(1))).max(MIN_STEP_MS);
    let steps = (delta / step).floor() as usize;

    let mut schedule = Vec::with_capacity(steps + 1);
    schedule.push(Duration::from_millis(min_ms));
    schedule.extend(std::iter::repeat(Duration::from_secs_f64(step / 1000.0)).take(steps));
    schedule
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_window_split_into_intervals() {
        let schedule = watch_schedule(1000, 11_000, WATCH_INTERVALS);
        assert_eq!(schedule.len(), 11);
        assert_eq!(schedule[0], Duration::from_millis(1000));
        assert!(schedule[1..].iter().all(|step| *step == Duration::from_millis(1000)));
    }

    #[test]
    fn test_steps_never_shorter_than_a_second() {
        let schedule = watch_schedule(1000, 5000, WATCH_INTERVALS);
        assert_eq!(schedule.len(), 5);
        assert!(schedule[1..].iter().all(|step| *step == Duration::from_secs(1)));

        let schedule = watch_schedule(3000, 3500, WATCH_INTERVALS);
        assert_eq!(schedule, vec![Duration::from_millis(3000)]);
    }

    #[test]
    fn test_fixed_window_polls_once() {
        assert_eq!(watch_schedule(0, 0, WATCH_INTERVALS), vec![Duration::ZERO]);
    }

    proptest! {
        #[test]
        fn prop_schedule_stays_inside_window(
            min in 0u64..120_000,
            extra in 0u64..600_000,
            intervals in 1u32..30,
        ) {
            let max = min + extra;
            let schedule = watch_schedule(min, max, intervals);
            let total: f64 = schedule.iter().map(Duration::as_secs_f64).sum::<f64>() * 1000.0;

            prop_assert_eq!(schedule[0], Duration::from_millis(min));
            prop_assert!(total <= max as f64 + 1.0);
            prop_assert!(schedule.len() <= intervals as usize + 1);
            for step in &schedule[1..] {
                prop_assert!(step.as_secs_f64() >= 0.999);
            }
        }
    }
}
