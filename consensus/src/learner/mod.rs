// Commit-decision observers over the vote-aggregation transcript
//
// A learner subscribes to the broadcast stream like any other endpoint
// and records a block as committed the moment a QC's signer count crosses
// one of its two thresholds. It verifies no signatures and tracks no
// chain structure; signature checking is the replicas' job. Setting a
// threshold above n disables that rule.

use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::debug;

use crate::event::{Event, EventSink};
use crate::network::{Message, SimulatedNetwork};
use crate::replica::types::Qc;

/// A passive endpoint applying quorum-threshold commit rules
pub struct Learner {
    pub name: String,
    /// Optimistic threshold; commits fire `LEARNER_FAST`
    pub q_fast: usize,
    /// Classical threshold; commits fire `LEARNER_SAFE`
    pub q_commit: usize,
    /// Block ids recorded as committed, in decision order
    pub committed: Vec<String>,
    events: EventSink,
    inbox: Option<UnboundedReceiver<Message>>,
}

impl Learner {
    /// Create a learner and register it as endpoint `learner_{name}`
    pub fn new(
        name: &str,
        network: &SimulatedNetwork,
        q_fast: usize,
        q_commit: usize,
        events: EventSink,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        network.register(&format!("learner_{}", name), tx);
        Self {
            name: name.to_string(),
            q_fast,
            q_commit,
            committed: Vec::new(),
            events,
            inbox: Some(rx),
        }
    }

    /// Consume the broadcast stream until the task is cancelled
    pub async fn run(mut self) {
        let mut inbox = match self.inbox.take() {
            Some(inbox) => inbox,
            None => return,
        };
        while let Some(msg) = inbox.recv().await {
            if let Message::Qc { qc, .. } = msg {
                self.on_qc(&qc);
            }
        }
    }

    /// Apply both threshold rules to one observed certificate. The fast
    /// rule runs first, so a QC crossing both thresholds is recorded as a
    /// fast commit.
    pub fn on_qc(&mut self, qc: &Qc) {
        let sigs = qc.signer_ids.len();
        if sigs >= self.q_fast && !self.committed.contains(&qc.block_id) {
            debug!(learner = %self.name, block_id = %qc.block_id, sigs, "fast commit");
            self.committed.push(qc.block_id.clone());
            self.events.emit(Event::LearnerFast {
                learner: self.name.clone(),
                block_id: qc.block_id.clone(),
                sigs,
            });
        }
        if sigs >= self.q_commit && !self.committed.contains(&qc.block_id) {
            debug!(learner = %self.name, block_id = %qc.block_id, sigs, "safe commit");
            self.committed.push(qc.block_id.clone());
            self.events.emit(Event::LearnerSafe {
                learner: self.name.clone(),
                block_id: qc.block_id.clone(),
                sigs,
            });
        }
    }
}
