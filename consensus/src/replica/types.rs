/// Core consensus data structures
///
/// Blocks, votes, quorum certificates, and the lock a replica holds on
/// the chain it has pledged to extend. Identities are hex SHA-256 content
/// hashes, fixed at construction.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::crypto;

/// A node in the proposed chain. Immutable after creation; `id` covers
/// every field except `justify_qc_id`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub parent_id: Option<String>,
    pub proposer: String,
    pub payload: String,
    pub view: u64,
    pub justify_qc_id: Option<String>,
    pub timestamp_ms: u64,
    pub id: String,
}

impl Block {
    /// Create a block, deriving its content id
    pub fn new(
        height: u64,
        parent_id: Option<String>,
        proposer: String,
        payload: String,
        view: u64,
        justify_qc_id: Option<String>,
        timestamp_ms: u64,
    ) -> Self {
        let id = crypto::block_id(
            height,
            parent_id.as_deref(),
            &proposer,
            &payload,
            view,
            timestamp_ms,
        );
        Self {
            height,
            parent_id,
            proposer,
            payload,
            view,
            justify_qc_id,
            timestamp_ms,
            id,
        }
    }
}

/// One replica's authenticated endorsement of a `(block, view)` pair
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub block_id: String,
    pub voter: String,
    pub view: u64,
    /// 64-byte Ed25519 signature over [`Vote::signing_message`]
    pub sig: Vec<u8>,
}

impl Vote {
    /// The exact bytes a voter signs: `"{block_id}:{view}"` as UTF-8
    pub fn signing_message(block_id: &str, view: u64) -> Vec<u8> {
        format!("{}:{}", block_id, view).into_bytes()
    }
}

/// Quorum certificate: evidence that `signer_ids.len()` distinct voters
/// signed the same `(block, view)`. `signatures` aligns positionally with
/// `signer_ids`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Qc {
    pub block_id: String,
    pub signer_ids: Vec<String>,
    pub signatures: Vec<Vec<u8>>,
    pub view: u64,
}

impl Qc {
    /// Content identity of this certificate
    pub fn id(&self) -> String {
        crypto::qc_id(&self.block_id, &self.signer_ids, self.view, &self.signatures)
    }

    /// Count the distinct signers whose signature verifies under the
    /// registered public keys. Unknown signers and duplicates do not
    /// count.
    pub fn valid_signers(&self, pubkeys: &HashMap<String, Vec<u8>>) -> usize {
        let msg = Vote::signing_message(&self.block_id, self.view);
        let mut valid: HashSet<&str> = HashSet::new();
        for (signer, sig) in self.signer_ids.iter().zip(self.signatures.iter()) {
            if valid.contains(signer.as_str()) {
                continue;
            }
            if let Some(public) = pubkeys.get(signer) {
                if crypto::verify(public, &msg, sig) {
                    valid.insert(signer);
                }
            }
        }
        valid.len()
    }
}

/// The block a replica has pledged to extend, and the view of the
/// evidence that pinned it. Carried by id rather than as a certificate
/// over the parent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lock {
    pub block_id: String,
    pub view: u64,
}
