//! Incremental quality aggregates shared by templates and reports.

/// Folds one outcome into a success rate.
///
/// `usage_count` already includes this outcome. Prior successes are
/// reconstructed as `round(old_rate * (n - 1))` rather than kept as a
/// separate counter, so very long histories may drift slightly.
pub fn update_success_rate(usage_count: i64, old_rate: f64, is_success: bool) -> f64 {
    let n = usage_count.max(1);
    let prev_successes = (old_rate * (n - 1) as f64).round();
    let successes = if is_success {
        prev_successes + 1.0
    } else {
        prev_successes
    };
    (successes / n as f64).clamp(0.0, 1.0)
}

/// Reclassifies one success among `usage_count` uses as a failure, using the
/// same reconstruction of prior successes. Never drops below zero.
pub fn retract_success(usage_count: i64, old_rate: f64) -> f64 {
    let n = usage_count.max(1);
    let successes = (old_rate * n as f64).round();
    ((successes - 1.0).max(0.0) / n as f64).clamp(0.0, 1.0)
}

/// Folds one observed execution time into a running mean.
///
/// `usage_count` already includes this observation; the first one is taken
/// as is.
pub fn update_avg_execution_time(usage_count: i64, old_avg: f64, observed_ms: f64) -> f64 {
    if usage_count <= 1 {
        return observed_ms;
    }
    let n = usage_count as f64;
    (old_avg * (n - 1.0) + observed_ms) / n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_mean_is_exact() {
        let mut avg = 0.0;
        for (i, t) in [100.0, 200.0, 300.0].into_iter().enumerate() {
            avg = update_avg_execution_time(i as i64 + 1, avg, t);
        }
        assert_eq!(avg, 200.0);
    }

    #[test]
    fn success_rate_counts_successes() {
        let mut rate = 0.0;
        let outcomes = [true, false, true, true];
        for (i, ok) in outcomes.into_iter().enumerate() {
            rate = update_success_rate(i as i64 + 1, rate, ok);
        }
        assert_eq!(rate, 0.75);
    }

    #[test]
    fn retraction_removes_one_success() {
        assert_eq!(retract_success(4, 0.75), 0.5);
        assert_eq!(retract_success(1, 1.0), 0.0);
        assert_eq!(retract_success(3, 0.0), 0.0);
        assert_eq!(retract_success(0, 0.0), 0.0);
    }

    #[test]
    fn zero_usage_is_treated_as_first_use() {
        assert_eq!(update_success_rate(0, 0.0, true), 1.0);
        assert_eq!(update_success_rate(0, 0.0, false), 0.0);
        assert_eq!(update_avg_execution_time(0, 0.0, 42.0), 42.0);
    }

    #[test]
    fn reconstruction_rounds_prior_successes() {
        // 0.34 * 2 = 0.68 rounds to one prior success
        assert_eq!(update_success_rate(3, 0.34, false), 1.0 / 3.0);
    }
}
