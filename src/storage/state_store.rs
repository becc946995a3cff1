use std::path::Path;

use rocksdb::{ColumnFamilyDescriptor, Options, DB};
use serde::{Deserialize, Serialize};

use crate::crypto::hash::sha256;
use crate::state::State;
use crate::storage::StoreError;
use crate::types::{Genesis, Hash, ValidatorSet};

const CF_VALIDATORS: &str = "validators"; // key: height (u64 BE) -> JSON ValidatorSet
const CF_APP_HASHES: &str = "app_hashes"; // key: height (u64 BE) -> 32 bytes
const CF_TX_RESULTS: &str = "tx_results"; // key: height (u64 BE) -> JSON TxResults
const CF_STATE: &str = "state"; // key: "state" -> JSON State

fn height_key(h: u64) -> [u8; 8] {
    h.to_be_bytes()
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxResult {
    pub code: u32,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Per-height application responses; the digest feeds the
/// `last_results_hash` of block H + len_ulb.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxResults {
    pub results: Vec<TxResult>,
}

impl TxResults {
    pub fn results_hash(&self) -> Hash {
        if self.results.is_empty() {
            return Hash::ZERO;
        }
        let bytes = serde_json::to_vec(self).expect("tx results serialize");
        sha256(&bytes)
    }
}

/// Height-indexed lookup of validator sets, application digests, and
/// transaction results, plus the latest promoted `State` snapshot.
pub struct StateStore {
    db: DB,
}

impl StateStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_VALIDATORS, Options::default()),
            ColumnFamilyDescriptor::new(CF_APP_HASHES, Options::default()),
            ColumnFamilyDescriptor::new(CF_TX_RESULTS, Options::default()),
            ColumnFamilyDescriptor::new(CF_STATE, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&opts, path, cfs)?;
        Ok(Self { db })
    }

    pub fn save_validators(&self, height: u64, validators: &ValidatorSet) -> Result<(), StoreError> {
        let cf = self.db.cf_handle(CF_VALIDATORS).unwrap();
        self.db
            .put_cf(&cf, height_key(height), serde_json::to_vec(validators)?)?;
        Ok(())
    }

    pub fn load_validators(&self, height: u64) -> Result<Option<ValidatorSet>, StoreError> {
        let cf = self.db.cf_handle(CF_VALIDATORS).unwrap();
        match self.db.get_cf(&cf, height_key(height))? {
            None => Ok(None),
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        }
    }

    pub fn save_app_hash(&self, height: u64, app_hash: Hash) -> Result<(), StoreError> {
        let cf = self.db.cf_handle(CF_APP_HASHES).unwrap();
        self.db.put_cf(&cf, height_key(height), app_hash.0)?;
        Ok(())
    }

    pub fn load_app_hash(&self, height: u64) -> Result<Option<Hash>, StoreError> {
        let cf = self.db.cf_handle(CF_APP_HASHES).unwrap();
        match self.db.get_cf(&cf, height_key(height))? {
            Some(bytes) if bytes.len() == 32 => {
                let mut h = [0u8; 32];
                h.copy_from_slice(&bytes);
                Ok(Some(Hash(h)))
            }
            _ => Ok(None),
        }
    }

    pub fn save_tx_results(&self, height: u64, results: &TxResults) -> Result<(), StoreError> {
        let cf = self.db.cf_handle(CF_TX_RESULTS).unwrap();
        self.db
            .put_cf(&cf, height_key(height), serde_json::to_vec(results)?)?;
        Ok(())
    }

    pub fn load_tx_results(&self, height: u64) -> Result<Option<TxResults>, StoreError> {
        let cf = self.db.cf_handle(CF_TX_RESULTS).unwrap();
        match self.db.get_cf(&cf, height_key(height))? {
            None => Ok(None),
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        }
    }

    pub fn save_state(&self, state: &State) -> Result<(), StoreError> {
        let cf = self.db.cf_handle(CF_STATE).unwrap();
        self.db.put_cf(&cf, b"state", serde_json::to_vec(state)?)?;
        Ok(())
    }

    pub fn load_state(&self) -> Result<Option<State>, StoreError> {
        let cf = self.db.cf_handle(CF_STATE).unwrap();
        match self.db.get_cf(&cf, b"state")? {
            None => Ok(None),
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        }
    }

    /// Seed the store from genesis. The validator set is stored for heights
    /// 1 ..= len_ulb + 2 so every lookup the initial live window performs
    /// (own set, next set, ULB set) is satisfiable before any block applies.
    /// Each successive height carries one more proposer-priority rotation.
    pub fn bootstrap(&self, genesis: &Genesis) -> Result<State, StoreError> {
        let state = State::from_genesis(genesis);
        let mut vset = genesis.validator_set();
        for h in 1..=state.len_ulb() + 2 {
            self.save_validators(h, &vset)?;
            vset.increment_proposer_priority(1);
        }
        self.save_state(&state)?;
        Ok(state)
    }

    /// Drop height-indexed records below `min_height`.
    pub fn prune_below(&self, min_height: u64) -> Result<u64, StoreError> {
        let cf_app = self.db.cf_handle(CF_APP_HASHES).unwrap();
        let cf_res = self.db.cf_handle(CF_TX_RESULTS).unwrap();

        let mut pruned = 0u64;
        for h in 1..min_height {
            let key = height_key(h);
            if self.db.get_cf(&cf_app, key)?.is_none() {
                continue;
            }
            let mut batch = rocksdb::WriteBatch::default();
            batch.delete_cf(&cf_app, key);
            batch.delete_cf(&cf_res, key);
            self.db.write(batch)?;
            pruned += 1;
        }
        Ok(pruned)
    }
}
