pub mod sign_state;
pub mod signer;

pub use sign_state::{SignState, SignStateStore, SignStep};
pub use signer::{FilePrivValidator, PrivvalError};
