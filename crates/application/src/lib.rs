mod chat_service;
mod constants;
mod provisioning;
mod registry;
mod tracker;

pub use chat_service::{ChatService, ChatServiceError};
pub use constants::*;
pub use provisioning::{ProvisioningController, ProvisioningError, ProvisioningState};
pub use registry::{create_default_registry, EngineRegistry};
pub use tracker::DownloadTracker;
