pub mod wal;
pub mod block_store;
pub mod state_store;

pub use block_store::BlockStore;
pub use state_store::{StateStore, TxResult, TxResults};
pub use wal::{Wal, WalError, WalRecord};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("db error: {0}")]
    Db(#[from] rocksdb::Error),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}
