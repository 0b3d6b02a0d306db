//! Shared event contracts for the provisioning workflow.
//!
//! This crate defines the formal contracts (DTOs) for events that flow from
//! the background provisioning worker to the front-end. Using shared types
//! prevents the worker from ever touching the terminal directly: every
//! user-visible change travels through the [`EventBus`] and is rendered by
//! whichever task owns the screen.

mod bus;

pub use bus::{ChannelEventBus, EventBus, EventBusRef, InMemoryEventBus, NullEventBus};

use serde::{Deserialize, Serialize};

/// Lifecycle phase of the model provisioning workflow.
///
/// Transitions are driven solely by the provisioning controller; consumers
/// only ever observe phases, never set them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningPhase {
    /// No provisioning run has begun.
    NotStarted,
    /// The inventory check against the local model directory is running.
    CheckingInventory,
    /// Missing files are being transferred, one at a time.
    Downloading,
    /// All files present and the engine was constructed.
    Ready,
    /// The run ended in an error; see the accompanying `Failed` event.
    Failed,
}

/// Event emitted by the provisioning worker.
///
/// Producers: provisioning controller (background task)
/// Consumers: CLI front-end (main task), tests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProvisioningEvent {
    /// The workflow moved to a new phase.
    PhaseChanged { phase: ProvisioningPhase },
    /// The inventory check finished. `missing` is empty when every required
    /// file already exists locally.
    InventoryChecked {
        /// Number of files in the manifest.
        required: usize,
        /// Local names of the files that still have to be fetched.
        missing: Vec<String>,
    },
    /// A file transfer began. `index` is the 1-based position within the
    /// download plan, `count` the plan length.
    FileStarted {
        file: String,
        index: usize,
        count: usize,
        /// Content length reported by the server, 0 when unknown.
        total_bytes: u64,
    },
    /// Transfer progress for the current file. Emitted only when the integer
    /// percentage changes, so observers are never flooded.
    FileProgress { file: String, percent: u8 },
    /// A file finished transferring and was moved into place.
    FileCompleted { file: String, bytes: u64 },
    /// Every file in the plan completed. Emitted exactly once per successful
    /// run, and never when any file is still outstanding.
    DownloadsCompleted,
    /// The run ended in an error (transfer, construction, or cancellation).
    Failed { message: String },
}

impl ProvisioningEvent {
    /// Phase carried by a `PhaseChanged` event, if that is what this is.
    pub fn phase(&self) -> Option<ProvisioningPhase> {
        match self {
            ProvisioningEvent::PhaseChanged { phase } => Some(*phase),
            _ => None,
        }
    }
}
