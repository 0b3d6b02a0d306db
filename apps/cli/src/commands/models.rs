//! Show the configured model and which of its files are present.

use std::path::Path;

use banter_models::{is_downloaded_in, missing_assets, ChatModel};
use indicatif::HumanBytes;

pub(crate) fn run(model: ChatModel, model_dir: &Path) -> anyhow::Result<()> {
    println!("{}", model.name());
    println!("  repository: {}", model.huggingface_repo());
    println!("  directory:  {}", model_dir.display());
    println!("  size:       ~{}", HumanBytes(model.size_bytes()));
    println!("  files:");
    for asset in model.manifest() {
        let mark = if model_dir.join(asset.local_name).exists() {
            "present"
        } else {
            "missing"
        };
        println!("    {mark:7}  {}", asset.local_name);
    }

    if is_downloaded_in(model_dir, model) {
        println!("  status: ready");
    } else {
        let outstanding = missing_assets(model_dir, model.manifest()).len();
        println!("  status: {outstanding} file(s) missing (run `banter pull`)");
    }
    Ok(())
}
