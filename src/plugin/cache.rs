use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Smallest non-zero allotment; zero means "unlimited" to a worker.
pub const MIN_CACHE_SIZE_MB: u64 = 1;

/// Cache settings pushed to workers that support them.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
#[rkyv(derive(Debug))]
pub struct CacheOptions {
    pub enabled: bool,
    pub ttl_secs: u64,
    /// 0 = unlimited
    pub max_size_mb: u64,
}

impl CacheOptions {
    pub fn new(enabled: bool, ttl: Duration, max_size_mb: u64) -> Self {
        Self {
            enabled,
            ttl_secs: ttl.as_secs(),
            max_size_mb,
        }
    }
}

/// Split `budget_mb` across instances in proportion to their non-aggregator
/// connection counts.
///
/// Whole megabytes are handed out by largest remainder so the shares add up to
/// the budget; any instance left at zero is raised to [`MIN_CACHE_SIZE_MB`].
/// `None` (or a zero budget) means unlimited for everyone.
pub fn partition(budget_mb: Option<u64>, counts: &BTreeMap<String, usize>) -> BTreeMap<String, u64> {
    let budget = match budget_mb {
        Some(b) if b > 0 => b,
        _ => return counts.keys().map(|k| (k.clone(), 0)).collect(),
    };

    let total: u128 = counts.values().map(|&c| c as u128).sum();
    if total == 0 {
        return counts
            .keys()
            .map(|k| (k.clone(), MIN_CACHE_SIZE_MB))
            .collect();
    }

    let mut shares: BTreeMap<String, u64> = BTreeMap::new();
    let mut remainders: Vec<(u128, usize, &String)> = Vec::with_capacity(counts.len());
    let mut assigned: u64 = 0;

    for (instance, &count) in counts {
        let exact = budget as u128 * count as u128;
        let share = (exact / total) as u64;
        assigned += share;
        shares.insert(instance.clone(), share);
        remainders.push((exact % total, count, instance));
    }

    // largest remainder first; ties go to the bigger instance, then by name
    remainders.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)).then(a.2.cmp(b.2)));
    let leftover = budget - assigned;
    for (_, _, instance) in remainders.into_iter().take(leftover as usize) {
        if let Some(share) = shares.get_mut(instance) {
            *share += 1;
        }
    }

    for share in shares.values_mut() {
        if *share == 0 {
            *share = MIN_CACHE_SIZE_MB;
        }
    }

    shares
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(pairs: &[(&str, usize)]) -> BTreeMap<String, usize> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn unset_budget_is_unlimited() {
        let shares = partition(None, &counts(&[("aws", 3), ("gcp", 1)]));
        assert!(shares.values().all(|&s| s == 0));
    }

    #[test]
    fn proportional_split() {
        let shares = partition(Some(1000), &counts(&[("aws", 3), ("gcp", 1)]));
        assert_eq!(shares["aws"], 750);
        assert_eq!(shares["gcp"], 250);
    }

    #[test]
    fn shares_sum_within_budget_plus_floor() {
        let cases: &[(u64, &[(&str, usize)])] = &[
            (10, &[("a", 1), ("b", 1), ("c", 1)]),
            (7, &[("a", 5), ("b", 2), ("c", 0)]),
            (1, &[("a", 100), ("b", 1), ("c", 1), ("d", 1)]),
            (1024, &[("a", 17), ("b", 3), ("c", 999)]),
        ];

        for (budget, pairs) in cases {
            let c = counts(pairs);
            let shares = partition(Some(*budget), &c);
            let sum: u64 = shares.values().sum();
            assert!(
                sum >= *budget && sum <= budget + c.len() as u64,
                "budget {budget}: sum {sum} of {shares:?}"
            );
            assert!(shares.values().all(|&s| s >= MIN_CACHE_SIZE_MB));
        }
    }

    #[test]
    fn instance_without_connections_only_gets_the_floor() {
        let shares = partition(Some(7), &counts(&[("a", 5), ("b", 2), ("idle", 0)]));
        assert_eq!(shares["idle"], MIN_CACHE_SIZE_MB);
    }
}
