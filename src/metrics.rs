use crate::model::SeriesStats;

/// Compute latest/min/max/mean for one value series (in arrival order).
pub fn compute_series_stats(values: &[f64]) -> Option<SeriesStats> {
    let latest = *values.last()?;
    let (min, max) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(*v), hi.max(*v))
        });
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    Some(SeriesStats {
        latest,
        min,
        max,
        mean,
    })
}

/// Map a series into [0, 1] using its own range, so series of very different
/// magnitudes can share one chart. A flat series sits at 0.5.
pub fn normalize(points: &[(f64, f64)], min: f64, max: f64) -> Vec<(f64, f64)> {
    let span = max - min;
    points
        .iter()
        .map(|(x, y)| {
            let n = if span.abs() < f64::EPSILON || !span.is_finite() {
                0.5
            } else {
                (y - min) / span
            };
            (*x, n)
        })
        .collect()
}

/// Y bounds with a little headroom; flat series get a unit-wide band.
pub fn padded_bounds(min: f64, max: f64) -> [f64; 2] {
    if !min.is_finite() || !max.is_finite() {
        return [0.0, 1.0];
    }
    let span = max - min;
    if span.abs() < f64::EPSILON {
        return [min - 0.5, max + 0.5];
    }
    let pad = span * 0.05;
    [min - pad, max + pad]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_of_empty_series() {
        assert!(compute_series_stats(&[]).is_none());
    }

    #[test]
    fn stats_follow_arrival_order_for_latest() {
        let s = compute_series_stats(&[3.0, -1.0, 4.0, 2.0]).unwrap();
        assert_eq!(s.latest, 2.0);
        assert_eq!(s.min, -1.0);
        assert_eq!(s.max, 4.0);
        assert!((s.mean - 2.0).abs() < 1e-12);
    }

    #[test]
    fn normalize_uses_own_range() {
        let pts = [(0.0, 100_000.0), (1.0, 100_010.0), (2.0, 100_005.0)];
        let n = normalize(&pts, 100_000.0, 100_010.0);
        assert_eq!(n, vec![(0.0, 0.0), (1.0, 1.0), (2.0, 0.5)]);
    }

    #[test]
    fn flat_series_is_centered() {
        let n = normalize(&[(0.0, 7.0), (1.0, 7.0)], 7.0, 7.0);
        assert!(n.iter().all(|(_, y)| *y == 0.5));
        assert_eq!(padded_bounds(7.0, 7.0), [6.5, 7.5]);
    }

    #[test]
    fn bounds_have_headroom() {
        let [lo, hi] = padded_bounds(0.0, 100.0);
        assert!(lo < 0.0 && hi > 100.0);
    }
}
