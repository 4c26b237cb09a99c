//! Property-based tests for the numeric folds
//!
//! Uses proptest to check that confidences stay in range whatever the
//! mix of signals and depths.

use proptest::prelude::*;
use trustweave_core::network::membership_confidence;
use trustweave_core::relations::{combine_relations, probabilistic_or, BLOCK_CONFIDENCE};
use trustweave_core::{AccountId, Keypair, Signal, SignalKind};

// ============================================================================
// Strategy Generators
// ============================================================================

fn account(seed: u8) -> AccountId {
    Keypair::from_seed(&[seed; 32]).account_id()
}

/// `(confidence, depth)` pairs as the propagator produces them
fn records_strategy() -> impl Strategy<Value = Vec<(f64, usize)>> {
    prop::collection::vec((-1.0f64..=1.0, 1usize..8), 0..12)
}

fn kind_strategy() -> impl Strategy<Value = SignalKind> {
    prop_oneof![
        Just(SignalKind::Trust),
        Just(SignalKind::Block),
        Just(SignalKind::Favorite),
        Just(SignalKind::CoAuthor),
        Just(SignalKind::PrivateBlock),
    ]
}

/// Signals about a handful of accounts, including the owner (seed 0)
fn signals_strategy() -> impl Strategy<Value = Vec<(u8, SignalKind)>> {
    prop::collection::vec((0u8..5, kind_strategy()), 0..20)
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    /// Membership confidence never leaves [-1, 1]
    #[test]
    fn membership_confidence_in_range(records in records_strategy(), direct in any::<bool>()) {
        let c = membership_confidence(&records, direct);
        prop_assert!((-1.0..=1.0).contains(&c), "confidence {} out of range", c);
    }

    /// A direct block from the origin always wins
    #[test]
    fn direct_block_is_minus_one(records in records_strategy()) {
        prop_assert_eq!(membership_confidence(&records, true), -1.0);
    }

    /// Positive-only records give a non-negative confidence
    #[test]
    fn trust_only_is_non_negative(records in prop::collection::vec((0.0f64..=1.0, 1usize..8), 0..12)) {
        prop_assert!(membership_confidence(&records, false) >= 0.0);
    }

    /// Probabilistic OR stays in [0, 1] and never drops when evidence is added
    #[test]
    fn probabilistic_or_bounded_and_monotone(
        values in prop::collection::vec(0.0f64..=1.0, 0..12),
        extra in 0.0f64..=1.0,
    ) {
        let before = probabilistic_or(values.iter().copied());
        let after = probabilistic_or(values.iter().copied().chain(Some(extra)));
        prop_assert!((0.0..=1.0).contains(&before));
        prop_assert!(after + 1e-12 >= before);
    }

    /// One relation per other account; any block signal forces -1
    #[test]
    fn combined_relations_are_well_formed(signals in signals_strategy()) {
        let owner = account(0);
        let built: Vec<Signal> = signals
            .iter()
            .map(|(seed, kind)| Signal::new(account(*seed), *kind))
            .collect();
        let relations = combine_relations(&owner, built.clone());

        prop_assert!(relations.iter().all(|r| r.account != owner));
        for pair in relations.windows(2) {
            prop_assert!(pair[0].account < pair[1].account);
        }
        for relation in &relations {
            let blocked = built
                .iter()
                .any(|s| s.account == relation.account && s.confidence < 0.0);
            if blocked {
                prop_assert_eq!(relation.confidence, BLOCK_CONFIDENCE);
            } else {
                prop_assert!((0.0..=1.0).contains(&relation.confidence));
            }
        }
    }
}
