use std::time::Instant;

/// Turns cumulative counters into per-second rates.
///
/// Holds the previous snapshot of `N` counters together with its capture
/// instant. The first update has no baseline and yields zeros. A counter that
/// went backwards (reset, wraparound, exited processes) contributes a zero
/// delta instead of a negative rate.
#[derive(Debug, Clone, Default)]
pub struct RateComputer<const N: usize> {
    previous: Option<([u64; N], Instant)>,
}

impl<const N: usize> RateComputer<N> {
    pub fn new() -> Self {
        Self { previous: None }
    }

    pub fn update(&mut self, current: [u64; N], at: Instant) -> [f64; N] {
        let Some((prev_counters, prev_at)) = self.previous else {
            self.previous = Some((current, at));
            return [0.0; N];
        };

        // A snapshot older than the baseline never becomes the baseline.
        let Some(elapsed) = at.checked_duration_since(prev_at) else {
            return [0.0; N];
        };
        self.previous = Some((current, at));

        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return [0.0; N];
        }

        let mut rates = [0.0; N];
        for (i, rate) in rates.iter_mut().enumerate() {
            *rate = current[i].saturating_sub(prev_counters[i]) as f64 / secs;
        }
        rates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn first_update_yields_zero() {
        let mut rate = RateComputer::<2>::new();
        assert_eq!(rate.update([5_000, 9_000], Instant::now()), [0.0, 0.0]);
    }

    #[test]
    fn rate_is_delta_over_elapsed() {
        let t0 = Instant::now();
        let mut rate = RateComputer::<2>::new();
        rate.update([1_000, 2_000], t0);
        let rates = rate.update([3_000, 2_500], t0 + Duration::from_secs(2));
        assert_eq!(rates, [1_000.0, 250.0]);

        let rates = rate.update([3_600, 2_500], t0 + Duration::from_millis(2_500));
        assert_eq!(rates, [1_200.0, 0.0]);
    }

    #[test]
    fn counter_reset_clamps_to_zero() {
        let t0 = Instant::now();
        let mut rate = RateComputer::<1>::new();
        rate.update([10_000], t0);
        assert_eq!(rate.update([400], t0 + Duration::from_secs(1)), [0.0]);
        // The reset value is the new baseline.
        assert_eq!(rate.update([1_400], t0 + Duration::from_secs(2)), [1_000.0]);
    }

    #[test]
    fn zero_elapsed_yields_zero() {
        let t0 = Instant::now();
        let mut rate = RateComputer::<1>::new();
        rate.update([0], t0);
        assert_eq!(rate.update([500], t0), [0.0]);
    }

    #[test]
    fn out_of_order_snapshot_is_ignored() {
        let t0 = Instant::now();
        let mut rate = RateComputer::<1>::new();
        rate.update([100], t0 + Duration::from_secs(5));
        assert_eq!(rate.update([50], t0), [0.0]);
        assert_eq!(rate.update([300], t0 + Duration::from_secs(7)), [100.0]);
    }
}
