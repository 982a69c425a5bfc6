/// Content hashing for block and QC identity
///
/// Identities are lowercase hex SHA-256 digests over fixed concatenations
/// so that independent implementations derive bit-identical ids.

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of raw bytes
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Block identity.
///
/// Digest of `"{height}:{parent}:{proposer}:{payload}:{view}:{timestamp}"`
/// with fields joined by single colons and no padding. An absent parent is
/// rendered as the literal string `None`.
pub fn block_id(
    height: u64,
    parent_id: Option<&str>,
    proposer: &str,
    payload: &str,
    view: u64,
    timestamp_ms: u64,
) -> String {
    let preimage = format!(
        "{}:{}:{}:{}:{}:{}",
        height,
        parent_id.unwrap_or("None"),
        proposer,
        payload,
        view,
        timestamp_ms,
    );
    sha256_hex(preimage.as_bytes())
}

/// QC identity.
///
/// Digest of the block id, the `","`-joined signer ids, the decimal view,
/// and the concatenated signature bytes, in that order.
pub fn qc_id(block_id: &str, signer_ids: &[String], view: u64, signatures: &[Vec<u8>]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(block_id.as_bytes());
    hasher.update(signer_ids.join(",").as_bytes());
    hasher.update(view.to_string().as_bytes());
    for sig in signatures {
        hasher.update(sig);
    }
    hex::encode(hasher.finalize())
}
