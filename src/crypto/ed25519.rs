use std::fs;
use std::path::Path;

use anyhow::Result;
use ed25519_dalek::Signer;
use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};

use crate::crypto::hash::sha256;
use crate::types::{Address, ADDRESS_SIZE};

/// Public key of the default signature scheme. The scheme is pluggable at the
/// seams (signatures travel as plain byte vectors); swapping it means
/// replacing this module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    /// Address is the truncated hash of the public key.
    pub fn address(&self) -> Address {
        let h = sha256(&self.0);
        let mut out = [0u8; ADDRESS_SIZE];
        out.copy_from_slice(&h.0[..ADDRESS_SIZE]);
        Address(out)
    }

    pub fn verify(&self, msg: &[u8], sig: &[u8]) -> bool {
        let Ok(vk) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let Ok(sig) = Signature::from_slice(sig) else {
            return false;
        };
        vk.verify_strict(msg, &sig).is_ok()
    }
}

pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing.verifying_key().to_bytes())
    }

    pub fn address(&self) -> Address {
        self.public_key().address()
    }

    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        self.signing.sign(msg).to_bytes().to_vec()
    }

    pub fn seed_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }
}

pub fn load_or_generate_keypair<P: AsRef<Path>>(path: P) -> Result<Keypair> {
    let path = path.as_ref();

    if path.exists() {
        let bytes = fs::read(path)?;
        if bytes.len() != 32 {
            anyhow::bail!("invalid key file length");
        }
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&bytes);
        Ok(Keypair::from_seed(seed))
    } else {
        let kp = Keypair::generate();
        fs::write(path, kp.seed_bytes())?;
        Ok(kp)
    }
}
