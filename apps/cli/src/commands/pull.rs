//! Provision the model without entering the chat loop.

use std::path::PathBuf;

use banter_models::ChatModel;

pub(crate) async fn run(model: ChatModel, model_dir: PathBuf) -> anyhow::Result<()> {
    let engine = crate::render::provision(model, &model_dir).await?;
    println!("{} ready in {}", engine.model_name(), model_dir.display());
    Ok(())
}
