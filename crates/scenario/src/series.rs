//! Time series assembly.

use std::collections::BTreeMap;

/// One named sequence of `(virtual time, value)` points.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Series {
    pub name: String,
    pub points: Vec<(u64, f64)>,
}

impl Series {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            points: Vec::new(),
        }
    }

    pub fn add(&mut self, time: u64, value: f64) {
        self.points.push((time, value));
    }
}

/// Min/max/avg envelope of a set of per-round series.
#[derive(Debug, Clone)]
pub struct StatSeries {
    pub min: Series,
    pub max: Series,
    pub avg: Series,
}

/// Fold per-round series into their min/max/avg envelope, aligned by
/// sample time. Rounds of different lengths contribute to the times they
/// reached.
pub fn stat_series(field: &str, rounds: &[Series]) -> StatSeries {
    let mut by_time: BTreeMap<u64, Vec<f64>> = BTreeMap::new();
    for round in rounds {
        for &(t, v) in &round.points {
            by_time.entry(t).or_default().push(v);
        }
    }

    let mut out = StatSeries {
        min: Series::new(format!("{field} - min")),
        max: Series::new(format!("{field} - max")),
        avg: Series::new(format!("{field} - avg")),
    };
    for (t, values) in by_time {
        let s = crate::stats::SimpleStats::over(values.iter().copied());
        out.min.add(t, s.min);
        out.max.add(t, s.max);
        out.avg.add(t, s.avg);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_aligns_by_time() {
        let mut a = Series::new("a");
        a.add(10, 1.0);
        a.add(20, 4.0);
        let mut b = Series::new("b");
        b.add(10, 3.0);
        b.add(20, 2.0);
        b.add(30, 5.0);

        let env = stat_series("f", &[a, b]);
        assert_eq!(env.min.points, vec![(10, 1.0), (20, 2.0), (30, 5.0)]);
        assert_eq!(env.max.points, vec![(10, 3.0), (20, 4.0), (30, 5.0)]);
        assert_eq!(env.avg.points, vec![(10, 2.0), (20, 3.0), (30, 5.0)]);
    }
}
