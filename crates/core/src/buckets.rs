//! Quantile estimation from cumulative histogram buckets.
//! A `Bucket` is an upper bound with the number of observations at or below it;
//! `BucketsExt` interpolates quantiles over a sorted list of them.

/// Upper bounds (seconds) shared by the latency histogram and the run report.
pub const LATENCY_BUCKETS: [f64; 14] = [
    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    pub upper_bound: f64,
    pub cumulative_count: u64,
}

impl Bucket {
    fn new(upper_bound: f64, cumulative_count: u64) -> Self {
        Self {
            upper_bound,
            cumulative_count,
        }
    }

    /// Builds cumulative buckets over `bounds` from raw observations.
    /// Observations above the last bound land in a trailing `+Inf`-like bucket
    /// whose upper bound is the largest observation.
    pub fn cumulative(observations: &[f64], bounds: &[f64]) -> Vec<Bucket> {
        let mut buckets = bounds
            .iter()
            .map(|bound| {
                let count = observations.iter().filter(|o| **o <= *bound).count();
                Bucket::new(*bound, count as u64)
            })
            .collect::<Vec<_>>();
        let overflow_max = observations
            .iter()
            .copied()
            .filter(|o| bounds.last().is_none_or(|last| o > last))
            .fold(None, |max: Option<f64>, o| Some(max.map_or(o, |m| m.max(o))));
        if let Some(max) = overflow_max {
            buckets.push(Bucket::new(max, observations.len() as u64));
        }
        buckets
    }
}

impl From<(f64, u64)> for Bucket {
    fn from((upper_bound, cumulative_count): (f64, u64)) -> Self {
        Self::new(upper_bound, cumulative_count)
    }
}

pub trait BucketsExt {
    fn estimate_quantile(&self, quantile: f64) -> f64;
}

impl BucketsExt for Vec<Bucket> {
    fn estimate_quantile(&self, quantile: f64) -> f64 {
        let Some(last) = self.last() else {
            return 0.0;
        };

        let total = last.cumulative_count;
        let target = (quantile * total as f64).ceil() as u64;

        for i in 0..self.len() {
            if self[i].cumulative_count >= target {
                let lower_bound = if i == 0 { 0.0 } else { self[i - 1].upper_bound };
                let lower_count = if i == 0 {
                    0
                } else {
                    self[i - 1].cumulative_count
                };
                let upper_bound = self[i].upper_bound;
                let upper_count = self[i].cumulative_count;

                let range = (upper_count - lower_count).max(1);
                let position = (target - lower_count) as f64 / range as f64;
                return lower_bound + (upper_bound - lower_bound) * position;
            }
        }

        last.upper_bound
    }
}
