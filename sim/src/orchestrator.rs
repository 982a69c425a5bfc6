// Simulation lifecycle
//
// Builds the network, replicas, and learners from a configuration, runs
// one simulation at a time, and reports lifecycle transitions through
// the event stream. Teardown aborts every spawned task; cancellation
// lands at each task's next suspension point.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use consensus::{
    EventRecord, EventSink, Keypair, Learner, Replica, ReplicaConfig, SimulatedNetwork,
};
use consensus::event::{Event, RunState, Source};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{info, warn};

use crate::config::{ConfigError, SimulationConfig};

#[derive(Error, Debug)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Handle over at most one running simulation. Starting a new run stops
/// the previous one first; must be used inside a tokio runtime.
pub struct Simulation {
    inner: Arc<Mutex<Inner>>,
    events: EventSink,
}

struct Inner {
    tasks: Vec<JoinHandle<()>>,
    running: bool,
    /// Echo of the last started configuration; survives stop
    config: Option<SimulationConfig>,
}

impl Simulation {
    pub fn new(events: UnboundedSender<EventRecord>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                tasks: Vec::new(),
                running: false,
                config: None,
            })),
            events: EventSink::new(events),
        }
    }

    /// Start a simulation from `config`. A validation failure is a failed
    /// start: nothing is spawned and no state changes.
    pub fn start(&self, config: SimulationConfig) -> Result<(), StartError> {
        self.stop();
        self.events.emit(Event::Status {
            state: RunState::Starting,
            config: None,
        });
        config.validate()?;
        let config = config.resolved();

        let n = config.replicas;
        let f = config.f;
        if n < 3 * f + 1 {
            warn!(n, f, "replica count below 3f+1");
            self.events.emit(Event::Warn {
                message: format!(
                    "n={} < 3f+1={} may violate classical safety.",
                    n,
                    3 * f + 1
                ),
            });
        }

        let network = Arc::new(SimulatedNetwork::new(
            config.drop_rate,
            Duration::from_secs_f64(config.min_delay),
            Duration::from_secs_f64(config.max_delay),
        ));

        let ids: Vec<String> = (0..n).map(|i| format!("R{}", i)).collect();
        let mut keypairs: HashMap<String, Keypair> = HashMap::new();
        let mut pubkeys: HashMap<String, Vec<u8>> = HashMap::new();
        for id in &ids {
            let keypair = Keypair::generate();
            pubkeys.insert(id.clone(), keypair.public_bytes());
            keypairs.insert(id.clone(), keypair);
        }

        let mut tasks = Vec::new();
        for (index, id) in ids.iter().enumerate() {
            let keypair = match keypairs.remove(id) {
                Some(keypair) => keypair,
                None => continue,
            };
            let mut replica_config = ReplicaConfig::new(id, ids.clone(), f);
            replica_config.qc_threshold = config.qc_threshold;
            replica_config.is_byzantine = config.byzantine.contains(&index);
            replica_config.is_abc = config.abc.contains(&index);
            replica_config.propose_interval = Duration::from_secs_f64(config.propose_interval);
            replica_config.high_qc_policy = config.high_qc_policy;

            let replica = Replica::new(
                replica_config,
                keypair,
                pubkeys.clone(),
                Arc::clone(&network),
                self.events.retagged(Source::Replica),
            );
            tasks.push(tokio::spawn(replica.run()));
        }

        for spec in config.learners.clone().unwrap_or_default() {
            let learner = Learner::new(
                &spec.name,
                &network,
                spec.q_fast,
                spec.q_commit.unwrap_or(config.quorum()),
                self.events.retagged(Source::Learner),
            );
            tasks.push(tokio::spawn(learner.run()));
        }

        // Duration timer: tears the run down and reports completion
        let inner = Arc::clone(&self.inner);
        let sink = self.events.clone();
        let duration = Duration::from_secs_f64(config.duration);
        tasks.push(tokio::spawn(async move {
            time::sleep(duration).await;
            stop_inner(&inner, &sink);
            sink.emit(Event::Status {
                state: RunState::Finished,
                config: None,
            });
        }));

        let echo = serde_json::to_value(&config).ok();
        {
            let mut guard = self.inner.lock().unwrap();
            guard.tasks = tasks;
            guard.running = true;
            guard.config = Some(config);
        }
        info!(n, f, "simulation running");
        self.events.emit(Event::Status {
            state: RunState::Running,
            config: echo,
        });
        Ok(())
    }

    /// Stop the current run, cancelling all outstanding work. Idempotent;
    /// keeps only the configuration echo.
    pub fn stop(&self) {
        stop_inner(&self.inner, &self.events);
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().unwrap().running
    }

    /// Configuration echo of the most recent run
    pub fn last_config(&self) -> Option<SimulationConfig> {
        self.inner.lock().unwrap().config.clone()
    }
}

fn stop_inner(inner: &Arc<Mutex<Inner>>, events: &EventSink) {
    let mut guard = inner.lock().unwrap();
    if !guard.running {
        return;
    }
    for task in guard.tasks.drain(..) {
        task.abort();
    }
    guard.running = false;
    info!("simulation stopped");
    events.emit(Event::Status {
        state: RunState::Stopped,
        config: None,
    });
}
