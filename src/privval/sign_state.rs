use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::privval::signer::PrivvalError;

/// Signing step within a round. Ordered: a later step never precedes an
/// earlier one at the same (height, round).
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum SignStep {
    Propose = 1,
    Prevote = 2,
    Precommit = 3,
}

mod hex_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            None => s.serialize_none(),
            Some(bytes) => {
                let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
                s.serialize_some(&hex)
            }
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let hex: Option<String> = Option::deserialize(d)?;
        match hex {
            None => Ok(None),
            Some(s) => {
                if s.len() % 2 != 0 {
                    return Err(serde::de::Error::custom("odd hex length"));
                }
                let mut out = Vec::with_capacity(s.len() / 2);
                for i in (0..s.len()).step_by(2) {
                    let byte = u8::from_str_radix(&s[i..i + 2], 16)
                        .map_err(serde::de::Error::custom)?;
                    out.push(byte);
                }
                Ok(Some(out))
            }
        }
    }
}

/// Last signing record for one height.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignState {
    pub round: u32,
    pub step: SignStep,
    #[serde(with = "hex_opt", default)]
    pub signature: Option<Vec<u8>>,
    #[serde(with = "hex_opt", default)]
    pub sign_bytes: Option<Vec<u8>>,
}

/// Persistent per-height signer state. Because heights progress in parallel,
/// one (round, step) watermark is kept per live height; heights at or below
/// the immutable watermark can never be signed again.
///
/// The on-disk format is a JSON object whose height map is keyed by
/// stringified heights.
#[derive(Debug, Serialize, Deserialize)]
pub struct SignStateStore {
    pub height_sign_states: BTreeMap<u64, SignState>,
    pub immutable_height: u64,
    #[serde(skip)]
    path: PathBuf,
}

impl SignStateStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            height_sign_states: BTreeMap::new(),
            immutable_height: 0,
            path,
        }
    }

    pub fn load(path: &Path) -> Result<Self, PrivvalError> {
        let bytes = std::fs::read(path)?;
        let mut store: SignStateStore = serde_json::from_slice(&bytes)?;
        store.path = path.to_path_buf();
        Ok(store)
    }

    pub fn load_or_new(path: &Path) -> Result<Self, PrivvalError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::new(path.to_path_buf()))
        }
    }

    /// Regression check for (height, round, step).
    ///
    /// Returns `(reuse, prior)`: `reuse == true` means this exact HRS was
    /// already signed and the stored signature must be reused. Panics if a
    /// record has sign bytes but no signature, which can only mean the state
    /// file was corrupted on disk.
    pub fn check_hrs(
        &self,
        height: u64,
        round: u32,
        step: SignStep,
    ) -> Result<(bool, Option<&SignState>), PrivvalError> {
        if self.immutable_height >= height {
            return Err(PrivvalError::HeightRegression {
                height,
                immutable_height: self.immutable_height,
            });
        }

        if let Some(prior) = self.height_sign_states.get(&height) {
            if prior.round > round {
                return Err(PrivvalError::RoundRegression {
                    height,
                    got: round,
                    last: prior.round,
                });
            }
            if prior.round == round {
                if prior.step > step {
                    return Err(PrivvalError::StepRegression {
                        height,
                        round,
                        got: step,
                        last: prior.step,
                    });
                }
                if prior.step == step {
                    if prior.sign_bytes.is_some() {
                        if prior.signature.is_none() {
                            panic!("privval: signature is nil but sign bytes is not");
                        }
                        return Ok((true, Some(prior)));
                    }
                    return Err(PrivvalError::MissingSignBytes);
                }
            }
        }

        Ok((false, None))
    }

    /// Idempotent write of the latest signing record for a height. Durably
    /// flushed before the caller may release the signature.
    pub fn store(
        &mut self,
        height: u64,
        round: u32,
        step: SignStep,
        sign_bytes: Vec<u8>,
        signature: Vec<u8>,
    ) -> Result<(), PrivvalError> {
        self.height_sign_states.insert(
            height,
            SignState {
                round,
                step,
                signature: Some(signature),
                sign_bytes: Some(sign_bytes),
            },
        );
        self.save()
    }

    /// Monotonic watermark advance; deletes every record at or below it.
    pub fn set_immutable_height(&mut self, height: u64) -> Result<(), PrivvalError> {
        if self.immutable_height > height {
            return Err(PrivvalError::ImmutableHeightRegression {
                got: height,
                current: self.immutable_height,
            });
        }
        self.immutable_height = height;
        self.height_sign_states.retain(|h, _| *h > height);
        self.save()
    }

    /// Erase all per-height records. Unsafe; recovery and tests only.
    pub fn reset(&mut self) -> Result<(), PrivvalError> {
        self.height_sign_states.clear();
        self.save()
    }

    /// Atomic persist: temp file, fsync, rename.
    pub fn save(&self) -> Result<(), PrivvalError> {
        let json = serde_json::to_vec_pretty(self)?;
        let tmp = self.path.with_extension("tmp");
        {
            let mut f: File = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            f.write_all(&json)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
