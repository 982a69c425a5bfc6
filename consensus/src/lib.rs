/// BFT replicated-state-machine core
///
/// HotStuff-style replicas agree on a totally-ordered chain of blocks
/// over a simulated lossy network despite up to f faulty participants;
/// learners observe the QC transcript and apply independent
/// quorum-threshold commit rules. Everything runs in-process on tokio
/// for deterministic testing.

pub mod crypto;
pub mod event;
pub mod learner;
pub mod network;
pub mod replica;

pub use crypto::Keypair;
pub use event::{Event, EventRecord, EventSink, RunState, Source};
pub use learner::Learner;
pub use network::{Message, SimulatedNetwork};
pub use replica::{HighQcPolicy, Replica, ReplicaConfig};
