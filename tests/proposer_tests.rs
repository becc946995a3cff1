//! Proposer-priority rotation tests.

use pipebft::crypto::Keypair;
use pipebft::types::{Validator, ValidatorSet, ValidatorUpdate};

fn make_keypair(seed: u8) -> Keypair {
    let mut bytes = [0u8; 32];
    bytes[0] = seed;
    Keypair::from_seed(bytes)
}

fn make_vset(powers: &[(u8, u64)]) -> ValidatorSet {
    ValidatorSet::new(
        powers
            .iter()
            .map(|(seed, power)| Validator::new(make_keypair(*seed).public_key(), *power))
            .collect(),
    )
}

/// The proposer is always a member of the set.
#[test]
fn test_proposer_always_in_set() {
    let mut vset = make_vset(&[(1, 100), (2, 200), (3, 50)]);
    for _ in 0..50 {
        vset.increment_proposer_priority(1);
        let proposer = vset.get_proposer().unwrap().address;
        assert!(vset.has_address(&proposer));
    }
}

/// Equal powers rotate round-robin through every validator.
#[test]
fn test_equal_power_rotates_through_all() {
    let mut vset = make_vset(&[(1, 1), (2, 1), (3, 1), (4, 1)]);
    let mut seen = std::collections::BTreeSet::new();
    for _ in 0..4 {
        vset.increment_proposer_priority(1);
        seen.insert(vset.get_proposer().unwrap().address);
    }
    assert_eq!(seen.len(), 4, "every validator proposes once per cycle");
}

/// Higher voting power proposes proportionally more often.
#[test]
fn test_weighted_selection_frequency() {
    let mut vset = make_vset(&[(1, 1), (2, 9)]);
    let heavy = make_keypair(2).address();
    let mut count = 0;
    for _ in 0..100 {
        vset.increment_proposer_priority(1);
        if vset.get_proposer().unwrap().address == heavy {
            count += 1;
        }
    }
    assert!(count > 80, "9/10 of power should propose ~90%, got {}", count);
}

/// Incrementing by n is the same as n single increments.
#[test]
fn test_increment_by_n_matches_repeated() {
    let mut a = make_vset(&[(1, 100), (2, 200), (3, 50)]);
    let mut b = a.clone();

    a.increment_proposer_priority(5);
    for _ in 0..5 {
        b.increment_proposer_priority(1);
    }
    assert_eq!(
        a.get_proposer().unwrap().address,
        b.get_proposer().unwrap().address
    );
}

/// Updates replace powers, drop zero-power validators, and keep the
/// priorities of the survivors.
#[test]
fn test_apply_updates() {
    let mut vset = make_vset(&[(1, 10), (2, 10), (3, 10)]);
    vset.increment_proposer_priority(2);

    let removed = make_keypair(3).public_key();
    let added = make_keypair(4).public_key();
    let next = vset.apply_updates(&[
        ValidatorUpdate {
            pub_key: removed,
            voting_power: 0,
        },
        ValidatorUpdate {
            pub_key: added,
            voting_power: 5,
        },
        ValidatorUpdate {
            pub_key: make_keypair(1).public_key(),
            voting_power: 20,
        },
    ]);

    assert_eq!(next.len(), 3);
    assert!(!next.has_address(&removed.address()));
    assert!(next.has_address(&added.address()));
    assert_eq!(next.voting_power_of(&make_keypair(1).address()), 20);
    assert_eq!(next.total_power(), 35);

    // Survivors keep their rotation position.
    let survivor = next
        .get_by_address(&make_keypair(2).address())
        .map(|(_, v)| v.proposer_priority)
        .unwrap();
    let before = vset
        .get_by_address(&make_keypair(2).address())
        .map(|(_, v)| v.proposer_priority)
        .unwrap();
    assert_eq!(survivor, before);
}
