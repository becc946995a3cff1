use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::crypto::PublicKey;
use crate::types::{ConsensusParams, Hash, Validator, ValidatorSet};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisValidator {
    pub pub_key: PublicKey,
    pub voting_power: u64,
    #[serde(default)]
    pub name: String,
}

/// Genesis document. Consumed, never produced: the validator set and
/// consensus parameters come from outside the engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Genesis {
    pub chain_id: String,
    pub genesis_time_ms: u64,
    pub consensus_params: ConsensusParams,
    pub validators: Vec<GenesisValidator>,
    #[serde(default)]
    pub app_hash: Hash,
}

impl Genesis {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn validator_set(&self) -> ValidatorSet {
        ValidatorSet::new(
            self.validators
                .iter()
                .map(|v| Validator::new(v.pub_key, v.voting_power))
                .collect(),
        )
    }
}
