//! Bounded command queue between external callers and the engine.

use crate::prototype::Prototype;
use biosim_core::{Error, Position, Result, SimConfig, Species};
use parking_lot::RwLock;
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError, TrySendError};
use std::sync::Arc;
use tracing::warn;

/// Mutations external callers may request; applied at the start of the next step
#[derive(Debug, Clone)]
pub enum Command {
    AddFood {
        position: Position,
    },
    AddBacteria {
        position: Position,
        prototype: Option<Box<Prototype>>,
    },
    AddPredator {
        position: Position,
        prototype: Option<Box<Prototype>>,
    },
    /// Remove every agent and food item and reseed from the configuration
    ResetPopulation,
    SetParameter {
        path: String,
        value: serde_json::Value,
    },
    /// Hot-reload a complete configuration
    ReplaceConfig(Box<SimConfig>),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::AddFood { .. } => "add_food",
            Command::AddBacteria { .. } => "add_bacteria",
            Command::AddPredator { .. } => "add_predator",
            Command::ResetPopulation => "reset_population",
            Command::SetParameter { .. } => "set_parameter",
            Command::ReplaceConfig(_) => "replace_config",
        }
    }

    pub fn add_agent(species: Species, position: Position, prototype: Option<Prototype>) -> Self {
        let prototype = prototype.map(Box::new);
        match species {
            Species::Bacteria => Command::AddBacteria { position, prototype },
            Species::Predator => Command::AddPredator { position, prototype },
        }
    }
}

/// Cloneable, thread-safe handle for enqueueing commands.
///
/// Sends never block: when the queue is full the command is dropped and
/// `Error::Queue` is returned.
#[derive(Clone)]
pub struct CommandSender {
    tx: SyncSender<Command>,
    config: Arc<RwLock<SimConfig>>,
}

impl CommandSender {
    pub fn send(&self, command: Command) -> Result<()> {
        match self.tx.try_send(command) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(command)) => {
                warn!(command = command.name(), "command queue full, dropping command");
                Err(Error::Queue("command queue full".to_string()))
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(Error::Queue("engine is no longer running".to_string()))
            }
        }
    }

    pub fn add_food(&self, position: Position) -> Result<()> {
        self.send(Command::AddFood { position })
    }

    pub fn add_bacteria(&self, position: Position, prototype: Option<Prototype>) -> Result<()> {
        self.send(Command::add_agent(Species::Bacteria, position, prototype))
    }

    pub fn add_predator(&self, position: Position, prototype: Option<Prototype>) -> Result<()> {
        self.send(Command::add_agent(Species::Predator, position, prototype))
    }

    pub fn reset_population(&self) -> Result<()> {
        self.send(Command::ResetPopulation)
    }

    /// Validate against the latest configuration the engine accepted, then enqueue
    pub fn set_parameter(&self, path: &str, value: serde_json::Value) -> Result<()> {
        self.config.read().with_parameter(path, value.clone())?;
        self.send(Command::SetParameter {
            path: path.to_string(),
            value,
        })
    }

    pub fn replace_config(&self, config: SimConfig) -> Result<()> {
        config.validate()?;
        self.send(Command::ReplaceConfig(Box::new(config)))
    }
}

/// Engine-side end of the queue
pub struct CommandQueue {
    rx: Receiver<Command>,
}

impl CommandQueue {
    /// Take everything currently queued without blocking
    pub fn drain(&self) -> Vec<Command> {
        let mut commands = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(command) => commands.push(command),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        commands
    }
}

/// Create a bounded queue. `config` is the shared view of the latest accepted
/// configuration used to pre-validate parameter changes.
pub fn channel(capacity: usize, config: Arc<RwLock<SimConfig>>) -> (CommandSender, CommandQueue) {
    let (tx, rx) = mpsc::sync_channel(capacity.max(1));
    (CommandSender { tx, config }, CommandQueue { rx })
}
