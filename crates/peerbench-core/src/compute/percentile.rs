//! Grouped percentile aggregation for peer benchmarks.
//!
//! One fixed method everywhere: continuous (linear-interpolation)
//! percentiles at rank `p/100 * (n - 1)`. Each partition is sorted exactly
//! once; p25, median, and p75 all read the same sorted buffer.

use std::collections::BTreeMap;

use crate::models::BenchmarkStat;

/// Linear-interpolation percentile of an ascending-sorted, non-empty slice.
pub fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    debug_assert!(!sorted.is_empty());
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = (p / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        return sorted[lo];
    }
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Summarize one partition's samples.
///
/// Returns `None` for an empty sample set: empty partitions are omitted
/// from output, never zero-filled. A single sample yields
/// `p25 = median = p75 = that value`.
pub fn summarize(mut samples: Vec<f64>) -> Option<BenchmarkStat> {
    if samples.is_empty() {
        return None;
    }
    samples.sort_by(f64::total_cmp);
    let count = samples.len();
    let mean = samples.iter().sum::<f64>() / count as f64;
    Some(BenchmarkStat {
        p25: percentile_sorted(&samples, 25.0),
        median: percentile_sorted(&samples, 50.0),
        p75: percentile_sorted(&samples, 75.0),
        mean,
        sample_count: count as i64,
    })
}

/// Group values by scope key and summarize each non-empty group.
///
/// Null values never contribute; a scope key whose values are all null is
/// absent from the output map entirely.
pub fn aggregate<I>(values: I) -> BTreeMap<String, BenchmarkStat>
where
    I: IntoIterator<Item = (String, Option<f64>)>,
{
    let mut groups: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for (scope_key, value) in values {
        if let Some(v) = value {
            groups.entry(scope_key).or_default().push(v);
        }
    }

    let mut stats = BTreeMap::new();
    for (scope_key, samples) in groups {
        if let Some(stat) = summarize(samples) {
            stats.insert(scope_key, stat);
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_partition_is_omitted() {
        assert!(summarize(vec![]).is_none());
        let stats = aggregate(vec![("eu".to_string(), None), ("us".to_string(), Some(1.0))]);
        assert!(!stats.contains_key("eu"));
        assert!(stats.contains_key("us"));
    }

    /// A single sample collapses all three percentiles onto the value.
    #[test]
    fn single_sample_collapses() {
        let stat = summarize(vec![12.5]).unwrap();
        assert_eq!(stat.p25, 12.5);
        assert_eq!(stat.median, 12.5);
        assert_eq!(stat.p75, 12.5);
        assert_eq!(stat.mean, 12.5);
        assert_eq!(stat.sample_count, 1);
    }

    #[test]
    fn two_samples_interpolate() {
        let stat = summarize(vec![3.0, 7.0]).unwrap();
        assert!((stat.p25 - 4.0).abs() < 1e-12);
        assert!((stat.median - 5.0).abs() < 1e-12);
        assert!((stat.p75 - 6.0).abs() < 1e-12);
        assert_eq!(stat.mean, 5.0);
        assert_eq!(stat.sample_count, 2);
    }

    #[test]
    fn known_quartiles_on_1_to_100() {
        let samples: Vec<f64> = (1..=100).map(f64::from).collect();
        let stat = summarize(samples).unwrap();
        assert!((stat.p25 - 25.75).abs() < 1e-9);
        assert!((stat.median - 50.5).abs() < 1e-9);
        assert!((stat.p75 - 75.25).abs() < 1e-9);
        assert!((stat.mean - 50.5).abs() < 1e-9);
        assert_eq!(stat.sample_count, 100);
    }

    /// Ordering invariant: p25 <= median <= p75 on arbitrary inputs.
    #[test]
    fn quartiles_are_ordered() {
        let inputs: Vec<Vec<f64>> = vec![
            vec![5.0],
            vec![2.0, 2.0, 2.0],
            vec![-10.0, 0.0, 10.0, 100.0],
            vec![1.5, -3.25, 8.0, 8.0, 0.0, 42.0, -7.5],
        ];
        for samples in inputs {
            let stat = summarize(samples).unwrap();
            assert!(stat.p25 <= stat.median);
            assert!(stat.median <= stat.p75);
        }
    }

    /// Sample counts track only non-null contributions per group.
    #[test]
    fn aggregate_groups_and_counts() {
        let values = vec![
            ("eu".to_string(), Some(1.0)),
            ("eu".to_string(), Some(3.0)),
            ("eu".to_string(), None),
            ("us".to_string(), Some(10.0)),
        ];
        let stats = aggregate(values);
        assert_eq!(stats.len(), 2);
        assert_eq!(stats["eu"].sample_count, 2);
        assert_eq!(stats["eu"].median, 2.0);
        assert_eq!(stats["us"].sample_count, 1);
        assert_eq!(stats["us"].median, 10.0);
    }
}
