/// Ed25519 signature implementation for vote authentication
///
/// Replicas exchange raw 32-byte public keys at setup and 64-byte
/// signatures on the wire; verification is total and never panics.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

pub const PUBLIC_KEY_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 64;

/// Ed25519 keypair held privately by one replica
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let mut csprng = OsRng;
        Self {
            signing: SigningKey::generate(&mut csprng),
        }
    }

    /// Public half as raw bytes, the form peers register and verify with
    pub fn public_bytes(&self) -> Vec<u8> {
        self.signing.verifying_key().to_bytes().to_vec()
    }

    /// Sign a message, producing a 64-byte signature
    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        self.signing.sign(msg).to_bytes().to_vec()
    }
}

/// Verify `sig` over `msg` under a raw public key.
///
/// Returns false on any failure: wrong key length, bytes that are not a
/// curve point, wrong signature length, or a signature that does not
/// verify.
pub fn verify(public: &[u8], msg: &[u8], sig: &[u8]) -> bool {
    let key_bytes: &[u8; PUBLIC_KEY_SIZE] = match public.try_into() {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let key = match VerifyingKey::from_bytes(key_bytes) {
        Ok(key) => key,
        Err(_) => return false,
    };
    let signature = match Signature::from_slice(sig) {
        Ok(sig) => sig,
        Err(_) => return false,
    };
    key.verify(msg, &signature).is_ok()
}
