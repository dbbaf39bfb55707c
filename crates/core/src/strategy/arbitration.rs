use std::sync::Arc;

use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};

use super::Strategy;

/// Pick which executable strategies fire.
///
/// Only the best (smallest) priority survives. Every unweighted survivor
/// fires, in input order; among weighted survivors exactly one is drawn,
/// proportionally to weight, and placed last.
pub fn arbitrate<R: Rng + ?Sized>(executable: Vec<Arc<Strategy>>, rng: &mut R) -> Vec<Arc<Strategy>> {
    let Some(best) = executable.iter().map(|s| s.priority()).min() else {
        return Vec::new();
    };
    let (weighted, mut firing): (Vec<_>, Vec<_>) = executable
        .into_iter()
        .filter(|s| s.priority() == best)
        .partition(|s| s.weight().is_some());

    if !weighted.is_empty() {
        match WeightedIndex::new(weighted.iter().map(|s| s.weight().map_or(1, u64::from))) {
            Ok(dist) => firing.push(weighted[dist.sample(rng)].clone()),
            Err(e) => tracing::warn!(error = %e, "weighted arbitration failed, skipping weighted strategies"),
        }
    }
    firing
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{CandidateAction, StrategyDefinition};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn strategy(id: &str, priority: i64, weight: Option<u32>) -> Arc<Strategy> {
        let mut def = StrategyDefinition::new(id, vec!["t".into()], vec![CandidateAction::action("n")]);
        def.priority = priority;
        def.weight = weight;
        Arc::new(Strategy::new(Arc::new(def)))
    }

    fn ids(fired: &[Arc<Strategy>]) -> Vec<&str> {
        fired.iter().map(|s| s.id()).collect()
    }

    #[test]
    fn empty_input_fires_nothing() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(arbitrate(Vec::new(), &mut rng).is_empty());
    }

    #[test]
    fn only_best_priority_survives() {
        let mut rng = StdRng::seed_from_u64(1);
        let fired = arbitrate(vec![strategy("a", 2, None), strategy("low", 5, None), strategy("b", 2, None)], &mut rng);
        assert_eq!(ids(&fired), vec!["a", "b"]);
    }

    #[test]
    fn one_weighted_joins_all_unweighted() {
        let mut rng = StdRng::seed_from_u64(3);
        let fired = arbitrate(
            vec![
                strategy("plain", 1, None),
                strategy("w1", 1, Some(1)),
                strategy("w2", 1, Some(5)),
            ],
            &mut rng,
        );
        assert_eq!(fired.len(), 2);
        assert_eq!(fired[0].id(), "plain");
        assert!(fired[1].id().starts_with('w'));
    }

    #[test]
    fn huge_weights_do_not_overflow() {
        let mut rng = StdRng::seed_from_u64(5);
        let fired = arbitrate(
            vec![strategy("a", 1, Some(u32::MAX)), strategy("b", 1, Some(u32::MAX)), strategy("c", 1, Some(u32::MAX))],
            &mut rng,
        );
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn zero_weight_counts_as_unweighted() {
        let mut rng = StdRng::seed_from_u64(3);
        let fired = arbitrate(vec![strategy("zero", 1, Some(0)), strategy("w", 1, Some(2))], &mut rng);
        assert_eq!(ids(&fired), vec!["zero", "w"]);
    }
}
