//! Weighted random pool placement (§4.6): pool with weight 0 is eligible
//! only if every registered pool has weight 0 (uniform fallback in that
//! case, since a weighted draw over an all-zero distribution is undefined).

use rand::Rng;

use queue_core::model::PoolEntry;

pub fn weighted_pick<R: Rng + ?Sized>(pools: &[PoolEntry], rng: &mut R) -> Option<String> {
    if pools.is_empty() {
        return None;
    }

    let total_weight: u64 = pools.iter().map(|pool| u64::from(pool.weight)).sum();

    if total_weight == 0 {
        let index = rng.gen_range(0..pools.len());
        return Some(pools[index].id.clone());
    }

    let mut draw = rng.gen_range(0..total_weight);
    for pool in pools {
        let weight = u64::from(pool.weight);
        if draw < weight {
            return Some(pool.id.clone());
        }
        draw -= weight;
    }

    // Only reachable on a floating-point-free integer rounding edge that
    // shouldn't occur; fall back to the last pool rather than panicking.
    pools.last().map(|pool| pool.id.clone())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn pool(id: &str, weight: u32) -> PoolEntry {
        PoolEntry {
            id: id.into(),
            uri: format!("mem://{id}"),
            weight,
            group: None,
        }
    }

    #[test]
    fn picks_among_nonzero_weights_in_proportion() {
        let pools = vec![pool("a", 1), pool("b", 0), pool("c", 3)];
        let mut rng = StdRng::seed_from_u64(7);
        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..1000 {
            let id = weighted_pick(&pools, &mut rng).unwrap();
            *counts.entry(id).or_insert(0) += 1;
        }
        assert!(!counts.contains_key("b"), "zero-weight pool must never be chosen while others are eligible");
        assert!(counts["c"] > counts["a"], "higher weight should be picked more often");
    }

    #[test]
    fn falls_back_to_uniform_when_all_weights_zero() {
        let pools = vec![pool("a", 0), pool("b", 0)];
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..20 {
            assert!(weighted_pick(&pools, &mut rng).is_some());
        }
    }

    #[test]
    fn empty_pool_list_returns_none() {
        let pools: Vec<PoolEntry> = vec![];
        let mut rng = StdRng::seed_from_u64(1);
        assert!(weighted_pick(&pools, &mut rng).is_none());
    }
}
