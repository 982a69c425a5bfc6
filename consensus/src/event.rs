/// Structured event stream crossing the core boundary
///
/// Replicas and learners report what they do through an injected sink;
/// the host decides where the records go. The bundled binary prints them
/// as JSON lines, tests drain them from a channel and assert over them,
/// and a deployment would forward them to its fan-out hub.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

/// Which kind of component produced an event. Orchestrator-level records
/// (status, warnings) carry no source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Replica,
    Learner,
}

/// Simulation lifecycle states reported through `STATUS` events
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Starting,
    Running,
    Stopped,
    Finished,
}

/// The shape of a block as reported in `PROPOSED` events
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSummary {
    pub id: String,
    pub height: u64,
    pub parent_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    /// Lifecycle transition; `running` echoes the effective configuration
    #[serde(rename = "STATUS")]
    Status {
        state: RunState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        config: Option<serde_json::Value>,
    },

    #[serde(rename = "WARN")]
    Warn { message: String },

    #[serde(rename = "PROPOSED")]
    Proposed {
        replica: String,
        view: u64,
        block: BlockSummary,
    },

    #[serde(rename = "VOTE_SENT")]
    VoteSent {
        replica: String,
        view: u64,
        block_id: String,
        to: String,
    },

    #[serde(rename = "VOTE_RCVD")]
    VoteRcvd {
        replica: String,
        view: u64,
        block_id: String,
        voter: String,
        count: usize,
    },

    #[serde(rename = "QC_FORMED")]
    QcFormed {
        replica: String,
        view: u64,
        block_id: String,
        sigs: usize,
    },

    #[serde(rename = "COMMIT")]
    Commit {
        replica: String,
        block_id: String,
        height: u64,
        proposer: String,
    },

    #[serde(rename = "TIMEOUT")]
    Timeout { replica: String, view: u64 },

    #[serde(rename = "ERROR")]
    Error { replica: String, error: String },

    #[serde(rename = "LEARNER_FAST")]
    LearnerFast {
        learner: String,
        block_id: String,
        sigs: usize,
    },

    #[serde(rename = "LEARNER_SAFE")]
    LearnerSafe {
        learner: String,
        block_id: String,
        sigs: usize,
    },
}

/// An event plus the source tag it was emitted under
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    #[serde(flatten)]
    pub event: Event,
}

/// Cloneable emission handle over one event channel.
///
/// Emission never blocks and never fails; once the receiving side is
/// gone, records are discarded.
#[derive(Clone)]
pub struct EventSink {
    source: Option<Source>,
    tx: UnboundedSender<EventRecord>,
}

impl EventSink {
    /// An untagged sink, as used by the orchestrator itself
    pub fn new(tx: UnboundedSender<EventRecord>) -> Self {
        Self { source: None, tx }
    }

    /// A sink over the same channel that tags each record with `source`
    pub fn retagged(&self, source: Source) -> Self {
        Self {
            source: Some(source),
            tx: self.tx.clone(),
        }
    }

    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(EventRecord {
            source: self.source,
            event,
        });
    }
}
