//! Provisioning workflow: inventory check, staged download, engine
//! construction.
//!
//! One controller owns one state machine. The workflow runs on a single
//! background task; everything user-visible leaves it as events.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use banter_events::{EventBusRef, ProvisioningEvent, ProvisioningPhase};
use banter_genai::{ChatEngine, EngineError};
use banter_models::{
    missing_assets, AssetFetcher, ChatModel, DownloadPlan, FetchEvent, ModelError, RetryPolicy,
};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::registry::EngineRegistry;
use crate::tracker::DownloadTracker;

#[derive(Debug, thiserror::Error)]
pub enum ProvisioningError {
    #[error("provisioning already in progress")]
    AlreadyRunning,
    #[error("download failed: {0}")]
    Download(#[from] ModelError),
    #[error("engine construction failed: {0}")]
    Construction(#[from] EngineError),
    #[error("no loader registered for model: {0}")]
    NoLoader(String),
    #[error("provisioning cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ProvisioningError>;

/// Lifecycle of a provisioning run.
///
/// The engine handle exists only inside `Ready`, so no code can reach for
/// it in any other state.
#[derive(Clone, Default)]
pub enum ProvisioningState {
    #[default]
    NotStarted,
    CheckingInventory,
    Downloading,
    Ready(Arc<dyn ChatEngine>),
    Failed(String),
}

impl ProvisioningState {
    pub fn phase(&self) -> ProvisioningPhase {
        match self {
            Self::NotStarted => ProvisioningPhase::NotStarted,
            Self::CheckingInventory => ProvisioningPhase::CheckingInventory,
            Self::Downloading => ProvisioningPhase::Downloading,
            Self::Ready(_) => ProvisioningPhase::Ready,
            Self::Failed(_) => ProvisioningPhase::Failed,
        }
    }

    /// Engine handle, present only in `Ready`.
    pub fn engine(&self) -> Option<Arc<dyn ChatEngine>> {
        match self {
            Self::Ready(engine) => Some(Arc::clone(engine)),
            _ => None,
        }
    }
}

impl fmt::Debug for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(message) => write!(f, "Failed({message:?})"),
            other => write!(f, "{:?}", other.phase()),
        }
    }
}

/// Owns the provisioning state machine and runs the workflow:
/// inventory check, sequential download of the missing set, engine
/// construction.
pub struct ProvisioningController {
    model: ChatModel,
    model_dir: PathBuf,
    fetcher: Arc<dyn AssetFetcher>,
    registry: Arc<EngineRegistry>,
    bus: EventBusRef,
    retry: RetryPolicy,
    state: RwLock<ProvisioningState>,
    downloads: DownloadTracker,
}

impl ProvisioningController {
    pub fn new(
        model: ChatModel,
        model_dir: PathBuf,
        fetcher: Arc<dyn AssetFetcher>,
        registry: Arc<EngineRegistry>,
        bus: EventBusRef,
    ) -> Self {
        Self {
            model,
            model_dir,
            fetcher,
            registry,
            bus,
            retry: RetryPolicy::default(),
            state: RwLock::new(ProvisioningState::NotStarted),
            downloads: DownloadTracker::new(),
        }
    }

    /// Override the transfer retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn model(&self) -> ChatModel {
        self.model
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    /// Snapshot of the current state.
    pub async fn state(&self) -> ProvisioningState {
        self.state.read().await.clone()
    }

    /// Engine handle once the workflow reached `Ready`.
    pub async fn engine(&self) -> Option<Arc<dyn ChatEngine>> {
        self.state.read().await.engine()
    }

    /// Cancel the active run, if any.
    pub async fn cancel(&self) -> bool {
        self.downloads.cancel(self.model.name()).await
    }

    /// Start the workflow on a background task and return its handle.
    ///
    /// At most one run is active per controller; starting while one is
    /// active returns `AlreadyRunning` without spawning anything.
    pub async fn start(self: Arc<Self>) -> Result<JoinHandle<Result<()>>> {
        let Some(cancel) = self.downloads.try_start(self.model.name().to_string()).await else {
            return Err(ProvisioningError::AlreadyRunning);
        };

        let controller = self;
        let handle = tokio::spawn(async move {
            let result = controller.run(&cancel).await;
            controller.downloads.finish(controller.model.name()).await;
            if let Err(e) = &result {
                tracing::error!(error = %e, "provisioning failed");
                controller
                    .set_state(ProvisioningState::Failed(e.to_string()))
                    .await;
                controller.bus.emit(ProvisioningEvent::Failed {
                    message: e.to_string(),
                });
            }
            result
        });
        Ok(handle)
    }

    async fn set_state(&self, next: ProvisioningState) {
        let phase = next.phase();
        *self.state.write().await = next;
        self.bus.emit(ProvisioningEvent::PhaseChanged { phase });
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        self.set_state(ProvisioningState::CheckingInventory).await;

        let manifest = self.model.manifest();
        let missing = missing_assets(&self.model_dir, manifest);
        tracing::info!(
            model = self.model.name(),
            required = manifest.len(),
            missing = missing.len(),
            "inventory checked"
        );
        self.bus.emit(ProvisioningEvent::InventoryChecked {
            required: manifest.len(),
            missing: missing.iter().map(|a| a.local_name.to_string()).collect(),
        });

        if !missing.is_empty() {
            self.set_state(ProvisioningState::Downloading).await;

            let plan = DownloadPlan::for_missing(self.model, &self.model_dir, &missing);
            let bus = Arc::clone(&self.bus);
            let forward = move |event: FetchEvent| {
                bus.emit(match event {
                    FetchEvent::Started {
                        file,
                        index,
                        count,
                        total_bytes,
                    } => ProvisioningEvent::FileStarted {
                        file,
                        index,
                        count,
                        total_bytes,
                    },
                    FetchEvent::Progress { file, progress } => ProvisioningEvent::FileProgress {
                        file,
                        percent: progress.file_percent(),
                    },
                    FetchEvent::Completed { file, bytes } => {
                        ProvisioningEvent::FileCompleted { file, bytes }
                    }
                });
            };

            let summary = tokio::select! {
                res = self.fetcher.fetch(&plan, self.retry, cancel, &forward) => res?,
                _ = cancel.cancelled() => {
                    remove_partial_files(&self.model_dir).await;
                    return Err(ProvisioningError::Cancelled);
                }
            };
            tracing::info!(
                files = summary.files_fetched,
                bytes = summary.bytes_fetched,
                "downloads completed"
            );
            self.bus.emit(ProvisioningEvent::DownloadsCompleted);
        }

        if cancel.is_cancelled() {
            return Err(ProvisioningError::Cancelled);
        }

        let engine = self.construct_engine()?;
        self.set_state(ProvisioningState::Ready(engine)).await;
        Ok(())
    }

    fn construct_engine(&self) -> Result<Arc<dyn ChatEngine>> {
        let model_id = self.model.name();
        let loader = self
            .registry
            .find_loader(model_id)
            .ok_or_else(|| ProvisioningError::NoLoader(model_id.to_string()))?;

        tracing::info!(
            model = model_id,
            loader = loader.name(),
            dir = %self.model_dir.display(),
            "constructing engine"
        );
        let engine = loader.load(model_id, &self.model_dir)?;
        Ok(Arc::from(engine))
    }
}

/// Best-effort cleanup of `.part` leftovers after a cancelled run.
/// Completed files stay; the next inventory check will account for them.
async fn remove_partial_files(dir: &Path) {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "part") {
            tracing::debug!(path = %path.display(), "removing partial download");
            let _ = tokio::fs::remove_file(&path).await;
        }
    }
}
