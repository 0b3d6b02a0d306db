//! Terminal rendering of provisioning events.
//!
//! The provisioning worker never touches the terminal: its events arrive
//! over a channel and are drawn here, on the main task.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use banter_application::{create_default_registry, ProvisioningController};
use banter_events::{ChannelEventBus, ProvisioningEvent, ProvisioningPhase};
use banter_genai::ChatEngine;
use banter_models::{ChatModel, HttpAssetFetcher};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};

/// Run the provisioning workflow to `Ready` and hand back the engine.
///
/// Ctrl-C cancels a download in flight, which surfaces as an error.
pub(crate) async fn provision(
    model: ChatModel,
    model_dir: &Path,
) -> anyhow::Result<Arc<dyn ChatEngine>> {
    let (bus, mut rx) = ChannelEventBus::channel();
    let controller = Arc::new(ProvisioningController::new(
        model,
        model_dir.to_path_buf(),
        Arc::new(HttpAssetFetcher::new()),
        Arc::new(create_default_registry()),
        Arc::new(bus),
    ));

    let mut handle = controller.clone().start().await?;

    let mut bar: Option<ProgressBar> = None;
    let joined = loop {
        tokio::select! {
            res = &mut handle => break res,
            Some(event) = rx.recv() => render_event(event, &mut bar),
            _ = tokio::signal::ctrl_c() => {
                eprintln!();
                eprintln!("cancelling download");
                controller.cancel().await;
            }
        }
    };
    // The worker is done; flush whatever is still queued.
    while let Ok(event) = rx.try_recv() {
        render_event(event, &mut bar);
    }

    let outcome = joined?;
    outcome?;

    controller
        .engine()
        .await
        .context("no engine after provisioning")
}

fn render_event(event: ProvisioningEvent, bar: &mut Option<ProgressBar>) {
    match event {
        ProvisioningEvent::PhaseChanged { phase } => match phase {
            ProvisioningPhase::CheckingInventory => println!("checking model files…"),
            ProvisioningPhase::Ready => println!("model ready"),
            _ => {}
        },
        ProvisioningEvent::InventoryChecked { required, missing } => {
            if missing.is_empty() {
                println!("all model files already exist");
            } else {
                println!("{} of {} model files missing", missing.len(), required);
                println!("downloading model files… this may take several minutes");
            }
        }
        ProvisioningEvent::FileStarted {
            file, index, count, ..
        } => {
            let pb = ProgressBar::new(100);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{prefix} [{bar:40.cyan/blue}] {pos}%")
                    .expect("Invalid progress bar template")
                    .progress_chars("#>-"),
            );
            pb.set_prefix(format!("[{index}/{count}] {file}"));
            *bar = Some(pb);
        }
        ProvisioningEvent::FileProgress { percent, .. } => {
            if let Some(pb) = bar.as_ref() {
                pb.set_position(u64::from(percent));
            }
        }
        ProvisioningEvent::FileCompleted { file, bytes } => {
            if let Some(pb) = bar.take() {
                pb.finish_and_clear();
            }
            println!("downloaded {file} ({})", HumanBytes(bytes));
        }
        ProvisioningEvent::DownloadsCompleted => println!("downloads completed"),
        ProvisioningEvent::Failed { .. } => {
            // The error itself surfaces through the join handle.
            if let Some(pb) = bar.take() {
                pb.finish_and_clear();
            }
        }
    }
}
