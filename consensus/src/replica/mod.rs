// HotStuff-style replica state machine
//
// One task per replica owns all of its state and suspends on three
// sources: the network inbox, the propose-loop tick, and the view timer.
// All cross-replica interaction is by message; a replica is never entered
// concurrently.

pub mod types;

use std::collections::{HashMap, HashSet};
use std::future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::{self, MissedTickBehavior, Sleep};
use tracing::debug;

use crate::crypto::{self, Keypair};
use crate::event::{BlockSummary, Event, EventSink};
use crate::network::{Message, SimulatedNetwork};

pub use types::{Block, Lock, Qc, Vote};

/// How long a view may sit without progress before NEWVIEW goes out.
/// Demo-friendly; commits stall visibly when it fires.
pub const VIEW_TIMEOUT: Duration = Duration::from_millis(800);

/// Bound on the parent walk in the lock-extension check
const MAX_ANCESTOR_WALK: usize = 1000;

#[derive(Error, Debug)]
pub enum ReplicaError {
    #[error("invalid signature from {0}")]
    InvalidVoteSignature(String),

    #[error("QC for block {block_id} has {valid} valid signatures, need {needed}")]
    InvalidQc {
        block_id: String,
        valid: usize,
        needed: usize,
    },
}

/// Policy for adopting an incoming valid QC as `high_qc`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HighQcPolicy {
    /// Adopt any valid QC regardless of its view
    #[default]
    AdoptAny,
    /// Keep the highest-view QC seen so far
    MaxView,
}

/// Static per-replica configuration
#[derive(Clone, Debug)]
pub struct ReplicaConfig {
    pub id: String,
    /// Shared, identically-ordered id list; drives leader rotation
    pub all_ids: Vec<String>,
    pub f: usize,
    /// Quorum size for QC formation; defaults to `2f + 1`
    pub qc_threshold: Option<usize>,
    /// Equivocate with a second block on every proposal
    pub is_byzantine: bool,
    /// Alive-but-corrupt classification; reserved, behaves honestly
    pub is_abc: bool,
    pub propose_interval: Duration,
    pub high_qc_policy: HighQcPolicy,
}

impl ReplicaConfig {
    pub fn new(id: &str, all_ids: Vec<String>, f: usize) -> Self {
        Self {
            id: id.to_string(),
            all_ids,
            f,
            qc_threshold: None,
            is_byzantine: false,
            is_abc: false,
            propose_interval: Duration::from_millis(150),
            high_qc_policy: HighQcPolicy::default(),
        }
    }
}

/// The consensus state machine for one replica
pub struct Replica {
    config: ReplicaConfig,
    keypair: Keypair,
    /// Registered peer public keys, raw 32-byte form
    pubkeys: HashMap<String, Vec<u8>>,
    network: Arc<SimulatedNetwork>,
    events: EventSink,
    inbox: Option<UnboundedReceiver<Message>>,

    n: usize,
    qc_threshold: usize,

    pub current_view: u64,
    /// Every block seen, by id; never pruned
    pub blocks: HashMap<String, Block>,
    /// Highest-height block, first-insertion tie-break
    tip: Option<String>,
    pub high_qc: Option<Qc>,
    pub locked: Option<Lock>,
    /// Leader-side vote accumulator per block
    votes_collected: HashMap<String, Vec<Vote>>,
    /// Blocks this leader has already aggregated a QC for
    certified: HashSet<String>,
    /// view -> block id voted for in that view
    pub voted_in_view: HashMap<u64, String>,
    pub committed: Vec<String>,
    /// view -> high-QCs carried by NEWVIEW messages for that view
    newview_buffer: HashMap<u64, Vec<Qc>>,
    /// Set by handlers that advance the view; the run loop re-arms the
    /// view timer when it sees this
    rearm_timer: bool,
}

impl Replica {
    /// Create a replica and register its inbox with the network
    pub fn new(
        config: ReplicaConfig,
        keypair: Keypair,
        pubkeys: HashMap<String, Vec<u8>>,
        network: Arc<SimulatedNetwork>,
        events: EventSink,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        network.register(&config.id, tx);
        let n = config.all_ids.len();
        let qc_threshold = config.qc_threshold.unwrap_or(2 * config.f + 1);
        Self {
            config,
            keypair,
            pubkeys,
            network,
            events,
            inbox: Some(rx),
            n,
            qc_threshold,
            current_view: 0,
            blocks: HashMap::new(),
            tip: None,
            high_qc: None,
            locked: None,
            votes_collected: HashMap::new(),
            certified: HashSet::new(),
            voted_in_view: HashMap::new(),
            committed: Vec::new(),
            newview_buffer: HashMap::new(),
            rearm_timer: true,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn qc_threshold(&self) -> usize {
        self.qc_threshold
    }

    /// Round-robin leader for `view`
    pub fn leader(&self, view: u64) -> &str {
        &self.config.all_ids[(view % self.n as u64) as usize]
    }

    /// Drive the replica until its task is cancelled. Handler errors are
    /// surfaced as ERROR events and the loop continues; nothing is fatal
    /// at replica granularity.
    pub async fn run(mut self) {
        let mut inbox = match self.inbox.take() {
            Some(inbox) => inbox,
            None => return,
        };
        // tokio rejects a zero interval period
        let period = self.config.propose_interval.max(Duration::from_millis(1));
        let mut propose_tick = time::interval(period);
        propose_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut view_timer = ViewTimer::idle();

        loop {
            if std::mem::take(&mut self.rearm_timer) {
                view_timer.arm(self.current_view);
            }
            tokio::select! {
                received = inbox.recv() => {
                    let msg = match received {
                        Some(msg) => msg,
                        None => break,
                    };
                    if let Err(err) = self.on_message(msg).await {
                        self.events.emit(Event::Error {
                            replica: self.config.id.clone(),
                            error: err.to_string(),
                        });
                    }
                }
                _ = propose_tick.tick() => {
                    if self.leader(self.current_view) == self.config.id {
                        self.propose().await;
                    }
                }
                view = view_timer.fired() => {
                    self.on_view_timeout(view).await;
                }
            }
        }
    }

    /// Single dispatch point for the inbox
    pub async fn on_message(&mut self, msg: Message) -> Result<(), ReplicaError> {
        match msg {
            Message::Propose { block, .. } => self.on_propose(block).await,
            Message::Vote { vote, .. } => self.on_vote(vote).await,
            Message::Qc { qc, .. } => self.on_qc(qc),
            Message::NewView { view, high_qc, .. } => self.on_newview(view, high_qc),
        }
    }

    /// Leader tick: build a candidate on the best known chain and
    /// broadcast it. A Byzantine proposer equivocates with a second block
    /// at the same view.
    pub async fn propose(&mut self) {
        let payload = format!("tx_from_{}_{}", self.config.id, now_ms());
        self.propose_payload(&payload).await;
        if self.config.is_byzantine {
            let alt = format!("{}_alt", payload);
            self.propose_payload(&alt).await;
        }
    }

    async fn propose_payload(&mut self, payload: &str) {
        let parent = self.tip_block().cloned();
        let mut block = self.make_block(parent.as_ref(), self.current_view, payload);
        if !self.extends_locked(&block) {
            // the lock outranks our own tip: rebuild on the locked block
            let locked_parent = self
                .locked
                .as_ref()
                .and_then(|lock| self.blocks.get(&lock.block_id))
                .cloned()
                .or(parent);
            block = self.make_block(locked_parent.as_ref(), self.current_view, payload);
        }
        self.ingest_block(block.clone());
        self.events.emit(Event::Proposed {
            replica: self.config.id.clone(),
            view: self.current_view,
            block: BlockSummary {
                id: block.id.clone(),
                height: block.height,
                parent_id: block.parent_id.clone(),
            },
        });
        let msg = Message::Propose {
            from: self.config.id.clone(),
            view: self.current_view,
            block,
        };
        self.network.broadcast(&self.config.id, msg).await;
    }

    /// Build a block extending `parent`, justified by our best QC
    pub fn make_block(&self, parent: Option<&Block>, view: u64, payload: &str) -> Block {
        let height = parent.map_or(0, |p| p.height + 1);
        let parent_id = parent.map(|p| p.id.clone());
        let justify_qc_id = self.high_qc.as_ref().map(Qc::id);
        Block::new(
            height,
            parent_id,
            self.config.id.clone(),
            payload.to_string(),
            view,
            justify_qc_id,
            now_ms(),
        )
    }

    /// Insert a block on first sight, maintaining the tip
    pub fn ingest_block(&mut self, block: Block) {
        if self.blocks.contains_key(&block.id) {
            return;
        }
        let is_new_tip = match self.tip.as_ref().and_then(|id| self.blocks.get(id)) {
            Some(tip) => block.height > tip.height,
            None => true,
        };
        if is_new_tip {
            self.tip = Some(block.id.clone());
        }
        self.blocks.insert(block.id.clone(), block);
    }

    fn tip_block(&self) -> Option<&Block> {
        self.tip.as_ref().and_then(|id| self.blocks.get(id))
    }

    /// Safe-voting rule: the proposal must carry the locked block on its
    /// ancestor chain. Walks parent links, bounded; an unreachable or
    /// unknown ancestor fails the check.
    pub fn extends_locked(&self, block: &Block) -> bool {
        let lock = match &self.locked {
            Some(lock) => lock,
            None => return true,
        };
        let mut current = Some(block);
        for _ in 0..MAX_ANCESTOR_WALK {
            let cur = match current {
                Some(cur) => cur,
                None => return false,
            };
            if cur.id == lock.block_id {
                return true;
            }
            current = match &cur.parent_id {
                Some(parent_id) => self.blocks.get(parent_id),
                None => return false,
            };
        }
        false
    }

    /// Ingest a proposal and vote for it if the safe-voting rules allow:
    /// at most one vote per view, and only for proposals extending the
    /// lock. Refusals are silent.
    pub async fn on_propose(&mut self, block: Block) -> Result<(), ReplicaError> {
        self.ingest_block(block.clone());

        if self.voted_in_view.contains_key(&block.view) {
            return Ok(());
        }
        if !self.extends_locked(&block) {
            return Ok(());
        }

        let sig = self
            .keypair
            .sign(&Vote::signing_message(&block.id, block.view));
        let vote = Vote {
            block_id: block.id.clone(),
            voter: self.config.id.clone(),
            view: block.view,
            sig,
        };
        let leader = self.leader(block.view).to_string();

        self.events.emit(Event::VoteSent {
            replica: self.config.id.clone(),
            view: block.view,
            block_id: block.id.clone(),
            to: leader.clone(),
        });
        let msg = Message::Vote {
            from: self.config.id.clone(),
            vote,
        };
        self.network.send(&self.config.id, &leader, msg).await;
        self.voted_in_view.insert(block.view, block.id);
        Ok(())
    }

    /// Aggregate a vote if we lead its view; form and broadcast a QC once
    /// the threshold is met
    pub async fn on_vote(&mut self, vote: Vote) -> Result<(), ReplicaError> {
        if self.leader(vote.view) != self.config.id {
            return Ok(());
        }
        let public = match self.pubkeys.get(&vote.voter) {
            Some(public) => public,
            None => return Ok(()),
        };
        let msg = Vote::signing_message(&vote.block_id, vote.view);
        if !crypto::verify(public, &msg, &vote.sig) {
            return Err(ReplicaError::InvalidVoteSignature(vote.voter));
        }
        // one QC per block from this leader
        if self.certified.contains(&vote.block_id) {
            return Ok(());
        }
        let votes = self.votes_collected.entry(vote.block_id.clone()).or_default();
        if votes.iter().any(|v| v.voter == vote.voter) {
            return Ok(());
        }
        votes.push(vote.clone());
        let count = votes.len();
        self.events.emit(Event::VoteRcvd {
            replica: self.config.id.clone(),
            view: vote.view,
            block_id: vote.block_id.clone(),
            voter: vote.voter,
            count,
        });

        if count >= self.qc_threshold {
            self.form_qc(&vote.block_id, vote.view).await;
        }
        Ok(())
    }

    /// Turn the accumulated votes into a QC, broadcast it, lock on the
    /// certified block's parent, and move to the next view
    async fn form_qc(&mut self, block_id: &str, view: u64) {
        let votes = match self.votes_collected.remove(block_id) {
            Some(votes) => votes,
            None => return,
        };
        let qc = Qc {
            block_id: block_id.to_string(),
            signer_ids: votes.iter().map(|v| v.voter.clone()).collect(),
            signatures: votes.into_iter().map(|v| v.sig).collect(),
            view,
        };
        let sigs = qc.signer_ids.len();
        self.certified.insert(block_id.to_string());
        debug!(replica = %self.config.id, view, block_id, sigs, "formed QC");

        let msg = Message::Qc {
            from: self.config.id.clone(),
            qc: qc.clone(),
        };
        self.network.broadcast(&self.config.id, msg).await;
        self.high_qc = Some(qc);

        let parent_id = self
            .blocks
            .get(block_id)
            .and_then(|block| block.parent_id.clone());
        if let Some(parent_id) = parent_id {
            if self.blocks.contains_key(&parent_id) {
                self.locked = Some(Lock {
                    block_id: parent_id,
                    view,
                });
            }
        }
        self.events.emit(Event::QcFormed {
            replica: self.config.id.clone(),
            view,
            block_id: block_id.to_string(),
            sigs,
        });

        self.current_view += 1;
        self.rearm_timer = true;
    }

    /// Validate an incoming QC, adopt it per the configured policy, and
    /// apply the three-chain commit rule: a QC on a block commits that
    /// block's grandparent.
    pub fn on_qc(&mut self, qc: Qc) -> Result<(), ReplicaError> {
        let valid = qc.valid_signers(&self.pubkeys);
        if valid < self.qc_threshold {
            return Err(ReplicaError::InvalidQc {
                block_id: qc.block_id,
                valid,
                needed: self.qc_threshold,
            });
        }

        let adopt = match self.config.high_qc_policy {
            HighQcPolicy::AdoptAny => true,
            HighQcPolicy::MaxView => self
                .high_qc
                .as_ref()
                .map_or(true, |current| qc.view >= current.view),
        };
        let block_id = qc.block_id.clone();
        if adopt {
            self.high_qc = Some(qc);
        }

        let block = match self.blocks.get(&block_id) {
            Some(block) => block,
            None => return Ok(()),
        };
        let parent = block
            .parent_id
            .as_ref()
            .and_then(|id| self.blocks.get(id));
        let grandparent = parent
            .and_then(|p| p.parent_id.as_ref())
            .and_then(|id| self.blocks.get(id));
        if let Some(grandparent) = grandparent {
            if !self.committed.contains(&grandparent.id) {
                let (id, height, proposer) = (
                    grandparent.id.clone(),
                    grandparent.height,
                    grandparent.proposer.clone(),
                );
                debug!(replica = %self.config.id, block_id = %id, height, "committed");
                self.committed.push(id.clone());
                self.events.emit(Event::Commit {
                    replica: self.config.id.clone(),
                    block_id: id,
                    height,
                    proposer,
                });
            }
        }
        Ok(())
    }

    /// Buffer the carried high-QC under the timed-out view; the leader of
    /// the successor view adopts the best one and advances.
    pub fn on_newview(&mut self, view: u64, high_qc: Option<Qc>) -> Result<(), ReplicaError> {
        if let Some(qc) = high_qc {
            let valid = qc.valid_signers(&self.pubkeys);
            if valid < self.qc_threshold {
                return Err(ReplicaError::InvalidQc {
                    block_id: qc.block_id,
                    valid,
                    needed: self.qc_threshold,
                });
            }
            self.newview_buffer.entry(view).or_default().push(qc);
        }

        if self.leader(view + 1) != self.config.id {
            return Ok(());
        }
        let best = self
            .newview_buffer
            .get(&view)
            .and_then(|buffered| buffered.iter().max_by_key(|qc| qc.view))
            .cloned();
        if let Some(best) = best {
            if self.blocks.contains_key(&best.block_id) {
                self.locked = Some(Lock {
                    block_id: best.block_id.clone(),
                    view: best.view,
                });
            }
            self.high_qc = Some(best);
        }
        if self.current_view <= view {
            self.current_view = view + 1;
            self.rearm_timer = true;
        }
        Ok(())
    }

    /// The view timer fired. If the view hasn't moved since it was armed,
    /// announce the stall with our best QC.
    async fn on_view_timeout(&mut self, view: u64) {
        if self.current_view != view {
            return;
        }
        debug!(replica = %self.config.id, view, "view timed out");
        let msg = Message::NewView {
            from: self.config.id.clone(),
            view,
            high_qc: self.high_qc.clone(),
        };
        self.network.broadcast(&self.config.id, msg).await;
        self.events.emit(Event::Timeout {
            replica: self.config.id.clone(),
            view,
        });
    }
}

/// Single outstanding view timer. Arming replaces any pending timer;
/// firing disarms it until the next view advance re-arms.
struct ViewTimer {
    armed: Option<(u64, Pin<Box<Sleep>>)>,
}

impl ViewTimer {
    fn idle() -> Self {
        Self { armed: None }
    }

    fn arm(&mut self, view: u64) {
        self.armed = Some((view, Box::pin(time::sleep(VIEW_TIMEOUT))));
    }

    /// Resolves with the armed view when the timer fires; pends forever
    /// while disarmed
    async fn fired(&mut self) -> u64 {
        let view = match self.armed.as_mut() {
            Some((view, sleep)) => {
                let view = *view;
                sleep.as_mut().await;
                view
            }
            None => return future::pending().await,
        };
        self.armed = None;
        view
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventRecord;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Cluster {
        ids: Vec<String>,
        keypairs: HashMap<String, Keypair>,
        pubkeys: HashMap<String, Vec<u8>>,
        network: Arc<SimulatedNetwork>,
    }

    impl Cluster {
        fn new(n: usize) -> Self {
            let ids: Vec<String> = (0..n).map(|i| format!("R{}", i)).collect();
            let keypairs: HashMap<String, Keypair> = ids
                .iter()
                .map(|id| (id.clone(), Keypair::generate()))
                .collect();
            let pubkeys = keypairs
                .iter()
                .map(|(id, kp)| (id.clone(), kp.public_bytes()))
                .collect();
            Self {
                ids,
                keypairs,
                pubkeys,
                network: Arc::new(SimulatedNetwork::instant()),
            }
        }

        fn replica(&self, id: &str, f: usize) -> (Replica, UnboundedReceiver<EventRecord>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let config = ReplicaConfig::new(id, self.ids.clone(), f);
            let replica = Replica::new(
                config,
                self.keypairs[id].clone(),
                self.pubkeys.clone(),
                Arc::clone(&self.network),
                EventSink::new(tx),
            );
            (replica, rx)
        }

        fn vote(&self, voter: &str, block_id: &str, view: u64) -> Vote {
            let sig = self.keypairs[voter].sign(&Vote::signing_message(block_id, view));
            Vote {
                block_id: block_id.to_string(),
                voter: voter.to_string(),
                view,
                sig,
            }
        }

        fn qc(&self, signers: &[&str], block_id: &str, view: u64) -> Qc {
            Qc {
                block_id: block_id.to_string(),
                signer_ids: signers.iter().map(|s| s.to_string()).collect(),
                signatures: signers
                    .iter()
                    .map(|s| self.keypairs[*s].sign(&Vote::signing_message(block_id, view)))
                    .collect(),
                view,
            }
        }
    }

    fn block(height: u64, parent: Option<&Block>, proposer: &str, payload: &str, view: u64) -> Block {
        Block::new(
            height,
            parent.map(|p| p.id.clone()),
            proposer.to_string(),
            payload.to_string(),
            view,
            None,
            height * 10 + view,
        )
    }

    fn drain(rx: &mut UnboundedReceiver<EventRecord>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(record) = rx.try_recv() {
            events.push(record.event);
        }
        events
    }

    #[test]
    fn test_leader_rotation() {
        let cluster = Cluster::new(4);
        let (replica, _rx) = cluster.replica("R0", 1);
        assert_eq!(replica.leader(0), "R0");
        assert_eq!(replica.leader(1), "R1");
        assert_eq!(replica.leader(3), "R3");
        assert_eq!(replica.leader(4), "R0");
        assert_eq!(replica.leader(9), "R1");
    }

    #[tokio::test]
    async fn test_votes_once_per_view() {
        let cluster = Cluster::new(4);
        let (mut replica, mut rx) = cluster.replica("R1", 1);

        let first = block(0, None, "R0", "a", 0);
        let second = block(0, None, "R0", "b", 0);
        replica.on_propose(first.clone()).await.expect("propose");
        replica.on_propose(second).await.expect("propose");

        assert_eq!(replica.voted_in_view.get(&0), Some(&first.id));
        let sent: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, Event::VoteSent { .. }))
            .collect();
        assert_eq!(sent.len(), 1);
    }

    #[tokio::test]
    async fn test_vote_goes_to_view_leader() {
        let cluster = Cluster::new(4);
        let (mut replica, mut rx) = cluster.replica("R0", 1);

        let proposal = block(0, None, "R2", "a", 2);
        replica.on_propose(proposal).await.expect("propose");

        match drain(&mut rx).as_slice() {
            [Event::VoteSent { to, view, .. }] => {
                assert_eq!(to, "R2");
                assert_eq!(*view, 2);
            }
            other => panic!("expected one VOTE_SENT, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejects_proposal_off_the_locked_branch() {
        let cluster = Cluster::new(4);
        let (mut replica, mut rx) = cluster.replica("R1", 1);

        let root = block(0, None, "R0", "root", 0);
        let locked = block(1, Some(&root), "R0", "locked", 1);
        replica.ingest_block(root.clone());
        replica.ingest_block(locked.clone());
        replica.locked = Some(Lock {
            block_id: locked.id.clone(),
            view: 1,
        });

        // A sibling of the locked block must be refused
        let conflicting = block(1, Some(&root), "R2", "conflict", 2);
        replica.on_propose(conflicting).await.expect("propose");
        assert!(drain(&mut rx)
            .iter()
            .all(|e| !matches!(e, Event::VoteSent { .. })));

        // A descendant of the locked block is fine
        let extending = block(2, Some(&locked), "R2", "ok", 2);
        replica.on_propose(extending).await.expect("propose");
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, Event::VoteSent { .. })));
    }

    #[tokio::test]
    async fn test_lock_check_fails_on_unknown_ancestry() {
        let cluster = Cluster::new(4);
        let (mut replica, mut rx) = cluster.replica("R1", 1);
        replica.locked = Some(Lock {
            block_id: "never_seen".into(),
            view: 1,
        });

        let orphan = block(5, None, "R0", "orphan", 3);
        replica.on_propose(orphan).await.expect("propose");
        assert!(drain(&mut rx)
            .iter()
            .all(|e| !matches!(e, Event::VoteSent { .. })));
    }

    #[tokio::test]
    async fn test_leader_forms_qc_at_threshold() {
        let cluster = Cluster::new(4);
        let (mut replica, mut rx) = cluster.replica("R0", 1);

        let root = block(0, None, "R0", "root", 0);
        let child = block(1, Some(&root), "R0", "child", 0);
        replica.ingest_block(root.clone());
        replica.ingest_block(child.clone());

        for voter in ["R1", "R2"] {
            replica
                .on_vote(cluster.vote(voter, &child.id, 0))
                .await
                .expect("vote");
            assert!(replica.high_qc.is_none());
        }
        replica
            .on_vote(cluster.vote("R3", &child.id, 0))
            .await
            .expect("vote");

        let qc = replica.high_qc.as_ref().expect("QC formed");
        assert_eq!(qc.block_id, child.id);
        assert_eq!(qc.signer_ids.len(), 3);
        assert_eq!(replica.current_view, 1);
        // Locked on the certified block's parent
        assert_eq!(
            replica.locked,
            Some(Lock {
                block_id: root.id.clone(),
                view: 0
            })
        );

        let events = drain(&mut rx);
        let received = events
            .iter()
            .filter(|e| matches!(e, Event::VoteRcvd { .. }))
            .count();
        assert_eq!(received, 3);
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::QcFormed { sigs: 3, .. })));
    }

    #[tokio::test]
    async fn test_leader_dedups_votes_by_voter() {
        let cluster = Cluster::new(4);
        let (mut replica, mut rx) = cluster.replica("R0", 1);

        let b = block(0, None, "R0", "b", 0);
        replica.ingest_block(b.clone());
        for _ in 0..3 {
            replica
                .on_vote(cluster.vote("R1", &b.id, 0))
                .await
                .expect("vote");
        }

        assert!(replica.high_qc.is_none());
        let counted = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, Event::VoteRcvd { .. }))
            .count();
        assert_eq!(counted, 1);
    }

    #[tokio::test]
    async fn test_invalid_vote_signature_is_an_error() {
        let cluster = Cluster::new(4);
        let (mut replica, _rx) = cluster.replica("R0", 1);

        let mut vote = cluster.vote("R1", "some_block", 0);
        vote.sig[0] ^= 0xFF;

        let err = replica.on_vote(vote).await.expect_err("bad signature");
        assert!(matches!(err, ReplicaError::InvalidVoteSignature(voter) if voter == "R1"));
    }

    #[tokio::test]
    async fn test_unknown_voter_is_ignored() {
        let cluster = Cluster::new(4);
        let (mut replica, mut rx) = cluster.replica("R0", 1);

        let stranger = Keypair::generate();
        let vote = Vote {
            block_id: "blk".into(),
            voter: "R9".into(),
            view: 0,
            sig: stranger.sign(&Vote::signing_message("blk", 0)),
        };
        replica.on_vote(vote).await.expect("ignored");
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_stale_leader_ignores_votes() {
        let cluster = Cluster::new(4);
        // R0 does not lead view 1
        let (mut replica, mut rx) = cluster.replica("R0", 1);
        replica
            .on_vote(cluster.vote("R1", "blk", 1))
            .await
            .expect("ignored");
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_one_qc_per_block() {
        let cluster = Cluster::new(4);
        let (mut replica, mut rx) = cluster.replica("R0", 1);

        let b = block(0, None, "R0", "b", 0);
        replica.ingest_block(b.clone());
        for voter in ["R0", "R1", "R2"] {
            replica
                .on_vote(cluster.vote(voter, &b.id, 0))
                .await
                .expect("vote");
        }
        // A late fourth vote must not produce a second certificate
        replica
            .on_vote(cluster.vote("R3", &b.id, 0))
            .await
            .expect("vote");

        let formed = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, Event::QcFormed { .. }))
            .count();
        assert_eq!(formed, 1);
    }

    #[tokio::test]
    async fn test_on_qc_rejects_insufficient_valid_signatures() {
        let cluster = Cluster::new(4);
        let (mut replica, _rx) = cluster.replica("R1", 1);

        let qc = cluster.qc(&["R0"], "blk", 0);
        let err = replica.on_qc(qc).expect_err("below threshold");
        assert!(matches!(err, ReplicaError::InvalidQc { valid: 1, needed: 3, .. }));
        assert!(replica.high_qc.is_none());
    }

    #[tokio::test]
    async fn test_high_qc_adoption_policies() {
        let cluster = Cluster::new(4);

        let (mut adopt_any, _rx) = cluster.replica("R1", 1);
        adopt_any
            .on_qc(cluster.qc(&["R0", "R1", "R2"], "blk_high", 5))
            .expect("qc");
        adopt_any
            .on_qc(cluster.qc(&["R0", "R1", "R2"], "blk_low", 2))
            .expect("qc");
        assert_eq!(adopt_any.high_qc.as_ref().map(|qc| qc.view), Some(2));

        let (mut max_view, _rx) = cluster.replica("R2", 1);
        max_view.config.high_qc_policy = HighQcPolicy::MaxView;
        max_view
            .on_qc(cluster.qc(&["R0", "R1", "R2"], "blk_high", 5))
            .expect("qc");
        max_view
            .on_qc(cluster.qc(&["R0", "R1", "R2"], "blk_low", 2))
            .expect("qc");
        assert_eq!(max_view.high_qc.as_ref().map(|qc| qc.view), Some(5));
    }

    #[tokio::test]
    async fn test_three_chain_commit() {
        let cluster = Cluster::new(4);
        let (mut replica, mut rx) = cluster.replica("R1", 1);

        let b0 = block(0, None, "R0", "b0", 0);
        let b1 = block(1, Some(&b0), "R1", "b1", 1);
        let b2 = block(2, Some(&b1), "R2", "b2", 2);
        for b in [&b0, &b1, &b2] {
            replica.ingest_block(b.clone());
        }

        replica
            .on_qc(cluster.qc(&["R0", "R1", "R2"], &b2.id, 2))
            .expect("qc");
        assert_eq!(replica.committed, vec![b0.id.clone()]);

        // The same certificate again must not commit twice
        replica
            .on_qc(cluster.qc(&["R0", "R1", "R3"], &b2.id, 2))
            .expect("qc");
        assert_eq!(replica.committed.len(), 1);

        let commits: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                Event::Commit {
                    block_id,
                    height,
                    proposer,
                    ..
                } => Some((block_id, height, proposer)),
                _ => None,
            })
            .collect();
        assert_eq!(commits, vec![(b0.id.clone(), 0, "R0".to_string())]);
    }

    #[tokio::test]
    async fn test_commit_needs_known_grandparent() {
        let cluster = Cluster::new(4);
        let (mut replica, mut rx) = cluster.replica("R1", 1);

        // Only the certified block and its parent are known
        let b1 = Block::new(1, Some("missing".into()), "R0".into(), "b1".into(), 1, None, 1);
        let b2 = block(2, Some(&b1), "R2", "b2", 2);
        replica.ingest_block(b1.clone());
        replica.ingest_block(b2.clone());

        replica
            .on_qc(cluster.qc(&["R0", "R1", "R2"], &b2.id, 2))
            .expect("qc");
        assert!(replica.committed.is_empty());
        assert!(drain(&mut rx)
            .iter()
            .all(|e| !matches!(e, Event::Commit { .. })));
    }

    #[tokio::test]
    async fn test_newview_successor_leader_adopts_best_qc() {
        let cluster = Cluster::new(4);
        // leader(0 + 1) = R1
        let (mut replica, _rx) = cluster.replica("R1", 1);

        let known = block(3, None, "R2", "known", 3);
        replica.ingest_block(known.clone());

        replica
            .on_newview(0, Some(cluster.qc(&["R0", "R1", "R2"], "elsewhere", 2)))
            .expect("newview");
        assert_eq!(replica.current_view, 1);
        replica.current_view = 0; // examine adoption across another round
        replica
            .on_newview(0, Some(cluster.qc(&["R0", "R1", "R3"], &known.id, 4)))
            .expect("newview");

        let adopted = replica.high_qc.as_ref().expect("adopted");
        assert_eq!(adopted.view, 4);
        assert_eq!(
            replica.locked,
            Some(Lock {
                block_id: known.id.clone(),
                view: 4
            })
        );
        assert_eq!(replica.current_view, 1);
    }

    #[tokio::test]
    async fn test_newview_without_qc_still_advances_the_leader() {
        let cluster = Cluster::new(4);
        let (mut replica, _rx) = cluster.replica("R1", 1);

        replica.on_newview(0, None).expect("newview");
        assert_eq!(replica.current_view, 1);
        assert!(replica.high_qc.is_none());
    }

    #[tokio::test]
    async fn test_newview_non_successor_only_buffers() {
        let cluster = Cluster::new(4);
        let (mut replica, _rx) = cluster.replica("R3", 1);

        replica
            .on_newview(0, Some(cluster.qc(&["R0", "R1", "R2"], "blk", 2)))
            .expect("newview");
        assert_eq!(replica.current_view, 0);
        assert!(replica.high_qc.is_none());
    }

    #[tokio::test]
    async fn test_propose_extends_the_tip() {
        let cluster = Cluster::new(4);
        let (mut replica, mut rx) = cluster.replica("R0", 1);

        let root = block(0, None, "R0", "root", 0);
        let tip = block(1, Some(&root), "R1", "tip", 1);
        replica.ingest_block(root);
        replica.ingest_block(tip.clone());

        replica.propose().await;

        let proposed: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                Event::Proposed { block, .. } => Some(block),
                _ => None,
            })
            .collect();
        assert_eq!(proposed.len(), 1);
        assert_eq!(proposed[0].height, 2);
        assert_eq!(proposed[0].parent_id, Some(tip.id.clone()));
    }

    #[tokio::test]
    async fn test_propose_falls_back_to_locked_block() {
        let cluster = Cluster::new(4);
        let (mut replica, mut rx) = cluster.replica("R0", 1);

        // The tip sits on a branch that conflicts with the lock
        let root = block(0, None, "R0", "root", 0);
        let locked = block(1, Some(&root), "R0", "locked", 1);
        let foreign_tip = block(2, None, "R2", "foreign", 2);
        replica.ingest_block(root);
        replica.ingest_block(locked.clone());
        replica.ingest_block(foreign_tip);
        replica.locked = Some(Lock {
            block_id: locked.id.clone(),
            view: 1,
        });

        replica.propose().await;

        let proposed: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                Event::Proposed { block, .. } => Some(block),
                _ => None,
            })
            .collect();
        assert_eq!(proposed[0].parent_id, Some(locked.id.clone()));
    }

    #[tokio::test]
    async fn test_byzantine_proposer_equivocates() {
        let cluster = Cluster::new(7);
        let (probe_tx, mut probe_rx) = mpsc::unbounded_channel();
        cluster.network.register("probe", probe_tx);

        let (mut replica, _rx) = cluster.replica("R0", 2);
        replica.config.is_byzantine = true;

        replica.propose().await;

        let mut proposals = Vec::new();
        while let Ok(msg) = probe_rx.try_recv() {
            if let Message::Propose { block, view, .. } = msg {
                proposals.push((view, block));
            }
        }
        assert_eq!(proposals.len(), 2);
        assert_eq!(proposals[0].0, proposals[1].0);
        assert_ne!(proposals[0].1.id, proposals[1].1.id);
        // The honest-looking block and the equivocation both entered our store
        assert_eq!(replica.blocks.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_view_timeout_broadcasts_newview() {
        let cluster = Cluster::new(2);
        let (probe_tx, mut probe_rx) = mpsc::unbounded_channel();
        cluster.network.register("probe", probe_tx);

        // R1 never leads view 0, so its timer is the only activity
        let (replica, mut rx) = cluster.replica("R1", 0);
        let handle = tokio::spawn(replica.run());

        time::advance(VIEW_TIMEOUT + Duration::from_millis(50)).await;
        // Let the replica task and the in-flight deliveries finish
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let mut saw_newview = false;
        while let Ok(msg) = probe_rx.try_recv() {
            if let Message::NewView { from, view, high_qc } = msg {
                assert_eq!(from, "R1");
                assert_eq!(view, 0);
                assert!(high_qc.is_none());
                saw_newview = true;
            }
        }
        assert!(saw_newview);
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, Event::Timeout { view: 0, .. })));

        handle.abort();
    }
}
