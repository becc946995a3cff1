use serde::{Deserialize, Serialize};

use crate::crypto::hash::sha256;
use crate::crypto::PublicKey;
use crate::types::{Address, BlockId, Commit, Hash, VoteType};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub address: Address,
    pub pub_key: PublicKey,
    pub voting_power: u64,
    pub proposer_priority: i64,
}

impl Validator {
    pub fn new(pub_key: PublicKey, voting_power: u64) -> Self {
        Self {
            address: pub_key.address(),
            pub_key,
            voting_power,
            proposer_priority: 0,
        }
    }
}

/// A change produced by the application when a block is applied.
/// `voting_power == 0` removes the validator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorUpdate {
    pub pub_key: PublicKey,
    pub voting_power: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum CommitVerifyError {
    #[error("invalid commit precommits: expected {expected}, got {got}")]
    InvalidCommitPrecommits { expected: usize, got: usize },
    #[error("invalid commit signature from validator {address}")]
    InvalidSignature { address: Address },
    #[error("commit vote height {got}, expected {expected}")]
    WrongHeight { expected: u64, got: u64 },
    #[error("insufficient voting power: have {have}, need more than {need}")]
    InsufficientPower { have: u64, need: u64 },
}

/// Validator set with deterministic ordering by address. The set carries
/// per-validator proposer priorities used by the weighted round-robin.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
    total_power: u64,
}

impl ValidatorSet {
    pub fn new(mut validators: Vec<Validator>) -> Self {
        validators.sort_by(|a, b| a.address.cmp(&b.address));
        let total_power = validators
            .iter()
            .fold(0u64, |acc, v| acc.saturating_add(v.voting_power));
        Self {
            validators,
            total_power,
        }
    }

    pub fn empty() -> Self {
        Self {
            validators: Vec::new(),
            total_power: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn total_power(&self) -> u64 {
        self.total_power
    }

    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    pub fn get_by_index(&self, index: u32) -> Option<&Validator> {
        self.validators.get(index as usize)
    }

    pub fn get_by_address(&self, address: &Address) -> Option<(u32, &Validator)> {
        self.validators
            .iter()
            .position(|v| v.address == *address)
            .map(|i| (i as u32, &self.validators[i]))
    }

    pub fn has_address(&self, address: &Address) -> bool {
        self.get_by_address(address).is_some()
    }

    pub fn voting_power_of(&self, address: &Address) -> u64 {
        self.get_by_address(address)
            .map(|(_, v)| v.voting_power)
            .unwrap_or(0)
    }

    /// Strictly-greater-than-two-thirds threshold.
    pub fn quorum_threshold(&self) -> u64 {
        self.total_power.saturating_mul(2) / 3 + 1
    }

    pub fn hash(&self) -> Hash {
        if self.validators.is_empty() {
            return Hash::ZERO;
        }
        let mut bytes = Vec::new();
        for v in &self.validators {
            bytes.extend_from_slice(&v.address.0);
            bytes.extend_from_slice(&v.pub_key.0);
            bytes.extend_from_slice(&v.voting_power.to_be_bytes());
        }
        sha256(&bytes)
    }

    /// The proposer is the validator with the highest priority; ties break
    /// toward the lower address.
    pub fn get_proposer(&self) -> Option<&Validator> {
        self.validators.iter().reduce(|best, v| {
            if v.proposer_priority > best.proposer_priority {
                v
            } else {
                best
            }
        })
    }

    /// One round-robin step per `times`: every priority grows by its voting
    /// power, then the selected proposer is debited the total power.
    pub fn increment_proposer_priority(&mut self, times: u32) {
        for _ in 0..times {
            for v in &mut self.validators {
                v.proposer_priority = v
                    .proposer_priority
                    .saturating_add(v.voting_power as i64);
            }
            let total = self.total_power as i64;
            if let Some(idx) = self
                .validators
                .iter()
                .enumerate()
                .reduce(|best, v| {
                    if v.1.proposer_priority > best.1.proposer_priority {
                        v
                    } else {
                        best
                    }
                })
                .map(|(i, _)| i)
            {
                self.validators[idx].proposer_priority -= total;
            }
        }
    }

    /// Apply application-issued updates, producing the successor set.
    /// Surviving validators keep their proposer priorities; fresh entrants
    /// start at zero.
    pub fn apply_updates(&self, updates: &[ValidatorUpdate]) -> ValidatorSet {
        let mut next: Vec<Validator> = self.validators.clone();
        for u in updates {
            let address = u.pub_key.address();
            match next.iter_mut().find(|v| v.address == address) {
                Some(existing) if u.voting_power > 0 => {
                    existing.voting_power = u.voting_power;
                }
                Some(_) => next.retain(|v| v.address != address),
                None if u.voting_power > 0 => {
                    next.push(Validator::new(u.pub_key, u.voting_power));
                }
                None => {}
            }
        }
        ValidatorSet::new(next)
    }

    /// Verify that `commit` carries more than 2/3 of this set's power signed
    /// over `block_id` at `height`.
    pub fn verify_commit(
        &self,
        chain_id: &str,
        block_id: &BlockId,
        height: u64,
        commit: &Commit,
    ) -> Result<(), CommitVerifyError> {
        if commit.precommits.len() != self.validators.len() {
            return Err(CommitVerifyError::InvalidCommitPrecommits {
                expected: self.validators.len(),
                got: commit.precommits.len(),
            });
        }

        let mut tallied = 0u64;
        for (idx, sig) in commit.precommits.iter().enumerate() {
            let Some(cs) = sig else { continue };
            if cs.height != height {
                return Err(CommitVerifyError::WrongHeight {
                    expected: height,
                    got: cs.height,
                });
            }
            let val = &self.validators[idx];
            let vote = cs.to_vote(VoteType::Precommit, idx as u32);
            if !val
                .pub_key
                .verify(&vote.sign_bytes(chain_id), &cs.signature)
            {
                return Err(CommitVerifyError::InvalidSignature {
                    address: val.address,
                });
            }
            if cs.block_id.as_ref() == Some(block_id) {
                tallied = tallied.saturating_add(val.voting_power);
            }
        }

        let need = self.total_power.saturating_mul(2) / 3;
        if tallied <= need {
            return Err(CommitVerifyError::InsufficientPower {
                have: tallied,
                need,
            });
        }
        Ok(())
    }

    /// Voting-power-weighted median of the commit signatures' timestamps.
    pub fn median_time(&self, commit: &Commit) -> u64 {
        let mut weighted: Vec<(u64, u64)> = Vec::new();
        let mut total = 0u64;
        for (idx, sig) in commit.precommits.iter().enumerate() {
            let Some(cs) = sig else { continue };
            let Some(val) = self.validators.get(idx) else {
                continue;
            };
            weighted.push((cs.timestamp_ms, val.voting_power));
            total = total.saturating_add(val.voting_power);
        }
        weighted.sort_by_key(|(t, _)| *t);

        let mid = total / 2;
        let mut acc = 0u64;
        for (t, p) in weighted {
            acc = acc.saturating_add(p);
            if acc > mid {
                return t;
            }
        }
        0
    }
}
