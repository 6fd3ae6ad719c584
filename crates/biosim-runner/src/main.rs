//! Headless runner: advances an engine on its own thread while the main
//! thread feeds it commands and reads published snapshots.

mod telemetry;

use anyhow::{Context, Result};
use biosim_core::{Position, SimConfig};
use biosim_world::{CommandSender, Engine, SnapshotHandle};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

const DEFAULT_STEPS: u64 = 3600;
const DT: f32 = 1.0 / 60.0;

fn main() -> Result<()> {
    telemetry::init_telemetry()?;

    let config = load_config()?;
    let steps = match std::env::var("BIOSIM_STEPS") {
        Ok(s) => s.parse().context("BIOSIM_STEPS must be an integer")?,
        Err(_) => DEFAULT_STEPS,
    };

    info!(seed = config.seed, steps, "🦠 Starting BioSim runner");

    let engine = Engine::new(config).context("failed to build engine")?;
    let sender = engine.command_sender();
    let snapshots = engine.snapshot_handle();
    let running = Arc::new(AtomicBool::new(true));

    let sim = {
        let running = running.clone();
        thread::Builder::new()
            .name("simulation".into())
            .spawn(move || run_simulation(engine, steps, running))?
    };

    observe(&sender, &snapshots, &running);

    match sim.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Simulation failed: {:#}", e),
        Err(_) => error!("Simulation thread panicked"),
    }

    let last = snapshots.latest();
    info!(
        step = last.step,
        bacteria = last.metrics.bacteria.count,
        predators = last.metrics.predators.count,
        food = last.metrics.food_count,
        births = last.metrics.births,
        deaths = last.metrics.deaths.total(),
        "Simulation finished"
    );
    println!("{}", serde_json::to_string_pretty(&last.metrics)?);
    Ok(())
}

/// JSON config from the first argument, else from `BIOSIM_CONFIG`, else defaults
fn load_config() -> Result<SimConfig> {
    let path = std::env::args().nth(1).or_else(|| std::env::var("BIOSIM_CONFIG").ok());
    let Some(path) = path else {
        info!("No config file given, using defaults");
        return Ok(SimConfig::default());
    };
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path))?;
    let config: SimConfig =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path))?;
    config.validate()?;
    info!(path = %path, "Loaded config");
    Ok(config)
}

fn run_simulation(mut engine: Engine, steps: u64, running: Arc<AtomicBool>) -> Result<()> {
    let outcome = (0..steps).try_for_each(|_| engine.step(DT));
    running.store(false, Ordering::Release);
    outcome?;
    info!(
        index = ?engine.index_stats(),
        "Spatial index at shutdown"
    );
    Ok(())
}

/// Watch the published snapshots; top up bacteria and drop food near the
/// centre whenever the colony runs low.
fn observe(sender: &CommandSender, snapshots: &SnapshotHandle, running: &AtomicBool) {
    let mut seen = 0;
    let mut boosted = false;
    while running.load(Ordering::Acquire) {
        thread::sleep(Duration::from_millis(50));
        let snapshot = snapshots.latest();
        if snapshot.version == seen {
            continue;
        }
        seen = snapshot.version;

        if snapshot.metrics.bacteria.count < 20 {
            let center = Position::new(500.0, 350.0);
            let sent = sender
                .add_bacteria(center, None)
                .and_then(|_| sender.add_food(center.add(Position::new(15.0, 0.0))));
            if let Err(e) = sent {
                warn!("Failed to queue commands: {}", e);
            }
        }
        if !boosted && snapshot.step >= 1800 {
            boosted = true;
            if let Err(e) = sender.set_parameter("food.target", json!(80)) {
                warn!("Failed to raise food target: {}", e);
            }
        }
    }
}
