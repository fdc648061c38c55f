use ed25519_dalek::{Keypair, PublicKey, SecretKey, Signature, Signer, Verifier};
use serde::{Deserialize, Serialize};

use crate::crypto::{blake2b256, random_version};
use crate::errors::{ChainError, ChainResult};

/// Public-key identifier a sidechain output is locked to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey25519Proposition(pub [u8; 32]);

impl PublicKey25519Proposition {
    pub fn bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Secret-store key for this proposition.
    pub fn key_hash(&self) -> [u8; 32] {
        blake2b256(&self.0)
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> ChainResult<()> {
        let public = PublicKey::from_bytes(&self.0)
            .map_err(|err| ChainError::Crypto(format!("invalid public key bytes: {err}")))?;
        let signature = Signature::from_bytes(signature)
            .map_err(|err| ChainError::Crypto(format!("invalid signature bytes: {err}")))?;
        public
            .verify(message, &signature)
            .map_err(|err| ChainError::Crypto(format!("signature verification failed: {err}")))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateKey25519 {
    seed: [u8; 32],
    public: PublicKey25519Proposition,
}

impl PrivateKey25519 {
    pub fn from_seed(seed: [u8; 32]) -> ChainResult<Self> {
        let secret = SecretKey::from_bytes(&seed)
            .map_err(|err| ChainError::Crypto(format!("invalid secret seed: {err}")))?;
        let public = PublicKey::from(&secret);
        Ok(Self {
            seed,
            public: PublicKey25519Proposition(public.to_bytes()),
        })
    }

    pub fn generate() -> ChainResult<Self> {
        Self::from_seed(random_version())
    }

    pub fn public_image(&self) -> PublicKey25519Proposition {
        self.public
    }

    pub fn owns(&self, proposition: &PublicKey25519Proposition) -> bool {
        &self.public == proposition
    }

    pub fn sign(&self, message: &[u8]) -> ChainResult<Vec<u8>> {
        let secret = SecretKey::from_bytes(&self.seed)
            .map_err(|err| ChainError::Crypto(format!("invalid secret seed: {err}")))?;
        let public = PublicKey::from(&secret);
        let keypair = Keypair { secret, public };
        Ok(keypair.sign(message).to_bytes().to_vec())
    }
}
