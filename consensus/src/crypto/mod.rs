/// Cryptography for the consensus core
///
/// Implements:
/// - Ed25519 signatures for votes and quorum certificates
/// - SHA-256 content identities for blocks and QCs

pub mod ed25519;
pub mod hash;

pub use ed25519::{verify, Keypair, PUBLIC_KEY_SIZE, SIGNATURE_SIZE};
pub use hash::{block_id, qc_id, sha256_hex};
