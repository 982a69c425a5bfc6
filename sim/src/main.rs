// Run one configured simulation from the command line, printing the
// event stream as JSON lines. Pass a JSON config file path as the first
// argument, or run with the built-in defaults.

use std::time::Duration;

use anyhow::Context;
use sim::{Simulation, SimulationConfig};
use tokio::sync::mpsc;
use tokio::time;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config: SimulationConfig = match std::env::args().nth(1) {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config file {}", path))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing config file {}", path))?
        }
        None => SimulationConfig::default(),
    };
    let duration = config.duration;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            if let Ok(line) = serde_json::to_string(&record) {
                println!("{}", line);
            }
        }
    });

    let simulation = Simulation::new(tx);
    simulation.start(config)?;

    // The duration timer inside the simulation handles teardown; linger
    // briefly so in-flight deliveries settle before exit
    time::sleep(Duration::from_secs_f64(duration) + Duration::from_millis(200)).await;
    simulation.stop();
    drop(simulation);
    printer.await.context("event printer")?;
    Ok(())
}
