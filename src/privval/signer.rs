use std::path::Path;

use serde_json::Value;

use crate::crypto::ed25519::load_or_generate_keypair;
use crate::crypto::{Keypair, PublicKey};
use crate::privval::sign_state::{SignStateStore, SignStep};
use crate::types::{Address, Proposal, Vote, VoteType};

#[derive(Debug, thiserror::Error)]
pub enum PrivvalError {
    #[error("height regression: got {height}, immutable height {immutable_height}")]
    HeightRegression { height: u64, immutable_height: u64 },
    #[error("round regression at height {height}: got {got}, last round {last}")]
    RoundRegression { height: u64, got: u32, last: u32 },
    #[error("step regression at height {height} round {round}: got {got:?}, last step {last:?}")]
    StepRegression {
        height: u64,
        round: u32,
        got: SignStep,
        last: SignStep,
    },
    #[error("no sign bytes found for a repeated sign request")]
    MissingSignBytes,
    #[error("conflicting data")]
    ConflictingData,
    #[error("immutable height regression: got {got}, current {current}")]
    ImmutableHeightRegression { got: u64, current: u64 },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl PrivvalError {
    /// Regressions are recoverable during WAL replay; everything else is not.
    pub fn is_regression(&self) -> bool {
        matches!(
            self,
            PrivvalError::HeightRegression { .. }
                | PrivvalError::RoundRegression { .. }
                | PrivvalError::StepRegression { .. }
        )
    }
}

fn vote_step(vote_type: VoteType) -> SignStep {
    match vote_type {
        VoteType::Prevote => SignStep::Prevote,
        VoteType::Precommit => SignStep::Precommit,
    }
}

/// If two canonical payloads differ only in their timestamp, return the
/// prior payload's timestamp.
fn only_differ_by_timestamp(prior: &[u8], current: &[u8]) -> Option<u64> {
    let mut prior_val: Value = serde_json::from_slice(prior).ok()?;
    let mut current_val: Value = serde_json::from_slice(current).ok()?;
    let prior_ts = prior_val.get("timestamp_ms")?.as_u64()?;
    prior_val
        .as_object_mut()?
        .insert("timestamp_ms".to_string(), Value::from(0u64));
    current_val
        .as_object_mut()?
        .insert("timestamp_ms".to_string(), Value::from(0u64));
    if prior_val == current_val {
        Some(prior_ts)
    } else {
        None
    }
}

/// Private validator backed by an on-disk key and the per-height sign-state
/// store. Every signature is durably recorded before it is released, so a
/// crash between signing and broadcasting can only ever reissue identical
/// bytes.
pub struct FilePrivValidator {
    keypair: Keypair,
    address: Address,
    pub sign_state: SignStateStore,
}

impl FilePrivValidator {
    pub fn new(keypair: Keypair, sign_state: SignStateStore) -> Self {
        let address = keypair.address();
        Self {
            keypair,
            address,
            sign_state,
        }
    }

    pub fn load_or_generate(key_path: &Path, state_path: &Path) -> Result<Self, PrivvalError> {
        let keypair = load_or_generate_keypair(key_path)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let sign_state = SignStateStore::load_or_new(state_path)?;
        Ok(Self::new(keypair, sign_state))
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn pub_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    pub fn set_immutable_height(&mut self, height: u64) -> Result<(), PrivvalError> {
        self.sign_state.set_immutable_height(height)
    }

    /// Sign a vote, setting its signature in place. A repeated request for
    /// the same (height, round, step) reuses the stored signature: identical
    /// payloads pass through, timestamp-only differences are rewritten to the
    /// stored timestamp, anything else is `ConflictingData`.
    pub fn sign_vote(&mut self, chain_id: &str, vote: &mut Vote) -> Result<(), PrivvalError> {
        let step = vote_step(vote.vote_type);
        let (reuse, prior) = self.sign_state.check_hrs(vote.height, vote.round, step)?;

        let sign_bytes = vote.sign_bytes(chain_id);

        if reuse {
            let prior = prior.expect("reuse implies a prior sign state");
            let prior_bytes = prior.sign_bytes.as_ref().expect("reuse implies sign bytes");
            let prior_sig = prior.signature.clone().expect("reuse implies signature");
            if *prior_bytes == sign_bytes {
                vote.signature = prior_sig;
                return Ok(());
            }
            if let Some(ts) = only_differ_by_timestamp(prior_bytes, &sign_bytes) {
                vote.timestamp_ms = ts;
                vote.signature = prior_sig;
                return Ok(());
            }
            return Err(PrivvalError::ConflictingData);
        }

        let signature = self.keypair.sign(&sign_bytes);
        self.sign_state
            .store(vote.height, vote.round, step, sign_bytes, signature.clone())?;
        vote.signature = signature;
        Ok(())
    }

    /// Proposal counterpart of `sign_vote`; the step is always Propose.
    pub fn sign_proposal(
        &mut self,
        chain_id: &str,
        proposal: &mut Proposal,
    ) -> Result<(), PrivvalError> {
        let (reuse, prior) =
            self.sign_state
                .check_hrs(proposal.height, proposal.round, SignStep::Propose)?;

        let sign_bytes = proposal.sign_bytes(chain_id);

        if reuse {
            let prior = prior.expect("reuse implies a prior sign state");
            let prior_bytes = prior.sign_bytes.as_ref().expect("reuse implies sign bytes");
            let prior_sig = prior.signature.clone().expect("reuse implies signature");
            if *prior_bytes == sign_bytes {
                proposal.signature = prior_sig;
                return Ok(());
            }
            if let Some(ts) = only_differ_by_timestamp(prior_bytes, &sign_bytes) {
                proposal.timestamp_ms = ts;
                proposal.signature = prior_sig;
                return Ok(());
            }
            return Err(PrivvalError::ConflictingData);
        }

        let signature = self.keypair.sign(&sign_bytes);
        self.sign_state.store(
            proposal.height,
            proposal.round,
            SignStep::Propose,
            sign_bytes,
            signature.clone(),
        )?;
        proposal.signature = signature;
        Ok(())
    }
}
