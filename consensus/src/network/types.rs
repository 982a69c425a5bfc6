// Wire message definitions

use serde::{Deserialize, Serialize};

use crate::replica::types::{Block, Qc, Vote};

/// Tagged envelope exchanged between endpoints. Every endpoint dispatches
/// by exhaustive match on receipt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// Leader's block proposal, broadcast to the whole domain
    #[serde(rename = "PROPOSE")]
    Propose { from: String, view: u64, block: Block },

    /// A follower's vote, unicast to the view's leader
    #[serde(rename = "VOTE")]
    Vote { from: String, vote: Vote },

    /// An aggregated certificate, broadcast by the leader that formed it
    #[serde(rename = "QC")]
    Qc { from: String, qc: Qc },

    /// View-change announcement carrying the sender's best certificate
    #[serde(rename = "NEWVIEW")]
    NewView {
        from: String,
        view: u64,
        high_qc: Option<Qc>,
    },
}
