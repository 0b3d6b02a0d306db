mod download;

use std::path::{Path, PathBuf};

pub use download::{
    AssetFetcher, DownloadPlan, DownloadProgress, FetchEvent, FetchSummary, HttpAssetFetcher,
    PlannedFile, RetryPolicy,
};

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("model not found: {0}")]
    NotFound(String),
    #[error("http error for {file}: {message}")]
    Http { file: String, message: String },
    #[error("size mismatch for {file}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        file: String,
        expected: u64,
        actual: u64,
    },
    #[error("checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },
    #[error("download cancelled")]
    Cancelled,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ModelError>;

/// One file the model needs before it can be constructed.
///
/// `remote_path` is relative to the Hugging Face repository tree; the
/// fully-qualified URL comes from [`ChatModel::asset_url`]. `sha256` is
/// enforced after transfer when upstream publishes a digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequiredAsset {
    pub remote_path: &'static str,
    pub local_name: &'static str,
    pub sha256: Option<&'static str>,
}

impl RequiredAsset {
    pub const fn new(remote_path: &'static str, local_name: &'static str) -> Self {
        Self {
            remote_path,
            local_name,
            sha256: None,
        }
    }
}

/// Phi-3 mini, int4 CPU variant. The ONNX graph references the `.onnx.data`
/// external-weights file by name, so local names must match the remote ones.
// TODO: add digests once microsoft publishes them for this repo.
const PHI3_MINI_INT4_MANIFEST: &[RequiredAsset] = &[
    RequiredAsset::new(
        "cpu_and_mobile/cpu-int4-rtn-block-32-acc-level-4/added_tokens.json",
        "added_tokens.json",
    ),
    RequiredAsset::new(
        "cpu_and_mobile/cpu-int4-rtn-block-32-acc-level-4/config.json",
        "config.json",
    ),
    RequiredAsset::new(
        "cpu_and_mobile/cpu-int4-rtn-block-32-acc-level-4/configuration_phi3.py",
        "configuration_phi3.py",
    ),
    RequiredAsset::new(
        "cpu_and_mobile/cpu-int4-rtn-block-32-acc-level-4/genai_config.json",
        "genai_config.json",
    ),
    RequiredAsset::new(
        "cpu_and_mobile/cpu-int4-rtn-block-32-acc-level-4/phi3-mini-4k-instruct-cpu-int4-rtn-block-32-acc-level-4.onnx",
        "phi3-mini-4k-instruct-cpu-int4-rtn-block-32-acc-level-4.onnx",
    ),
    RequiredAsset::new(
        "cpu_and_mobile/cpu-int4-rtn-block-32-acc-level-4/phi3-mini-4k-instruct-cpu-int4-rtn-block-32-acc-level-4.onnx.data",
        "phi3-mini-4k-instruct-cpu-int4-rtn-block-32-acc-level-4.onnx.data",
    ),
    RequiredAsset::new(
        "cpu_and_mobile/cpu-int4-rtn-block-32-acc-level-4/special_tokens_map.json",
        "special_tokens_map.json",
    ),
    RequiredAsset::new(
        "cpu_and_mobile/cpu-int4-rtn-block-32-acc-level-4/tokenizer.json",
        "tokenizer.json",
    ),
    RequiredAsset::new(
        "cpu_and_mobile/cpu-int4-rtn-block-32-acc-level-4/tokenizer.model",
        "tokenizer.model",
    ),
    RequiredAsset::new(
        "cpu_and_mobile/cpu-int4-rtn-block-32-acc-level-4/tokenizer_config.json",
        "tokenizer_config.json",
    ),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatModel {
    /// Quantized Phi-3 mini with a 4k context, runs on CPU.
    Phi3Mini4kInstructInt4,
}

impl ChatModel {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Phi3Mini4kInstructInt4 => "phi-3-mini-4k-instruct-int4",
        }
    }

    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Phi3Mini4kInstructInt4 => "phi-3-mini-4k-instruct-int4",
        }
    }

    pub fn huggingface_repo(&self) -> &'static str {
        match self {
            Self::Phi3Mini4kInstructInt4 => "microsoft/Phi-3-mini-4k-instruct-onnx",
        }
    }

    /// Rough total size of the manifest, for display before totals are known.
    pub fn size_bytes(&self) -> u64 {
        match self {
            // ~2.5 GB, dominated by the .onnx.data external weights
            Self::Phi3Mini4kInstructInt4 => 2_500_000_000,
        }
    }

    /// Every file that must exist locally before the engine can be built.
    pub fn manifest(&self) -> &'static [RequiredAsset] {
        match self {
            Self::Phi3Mini4kInstructInt4 => PHI3_MINI_INT4_MANIFEST,
        }
    }

    /// Local name of the ONNX graph within the manifest.
    pub fn model_file(&self) -> &'static str {
        match self {
            Self::Phi3Mini4kInstructInt4 => {
                "phi3-mini-4k-instruct-cpu-int4-rtn-block-32-acc-level-4.onnx"
            }
        }
    }

    /// Fully-qualified download URL for one manifest entry.
    pub fn asset_url(&self, asset: &RequiredAsset) -> String {
        hf_resolve_url(self.huggingface_repo(), asset.remote_path)
    }

    pub fn all() -> &'static [ChatModel] {
        &[Self::Phi3Mini4kInstructInt4]
    }

    pub fn from_id(id: &str) -> Result<ChatModel> {
        Self::all()
            .iter()
            .copied()
            .find(|m| m.name() == id)
            .ok_or_else(|| ModelError::NotFound(id.to_string()))
    }
}

impl Default for ChatModel {
    fn default() -> Self {
        Self::Phi3Mini4kInstructInt4
    }
}

fn hf_resolve_url(repo: &str, remote_path: &str) -> String {
    format!("https://huggingface.co/{}/resolve/main/{}", repo, remote_path)
}

pub fn models_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("banter")
        .join("models")
}

pub fn model_path(model: ChatModel) -> PathBuf {
    models_dir().join(model.dir_name())
}

/// Which manifest entries have no file at `model_dir/local_name` yet.
///
/// Pure read of filesystem state at call time; order follows the manifest.
/// The fetcher is the only writer of `model_dir`, so a racing check is at
/// worst stale, never wrong about what it saw.
pub fn missing_assets(model_dir: &Path, manifest: &[RequiredAsset]) -> Vec<RequiredAsset> {
    manifest
        .iter()
        .filter(|asset| !model_dir.join(asset.local_name).exists())
        .copied()
        .collect()
}

pub fn is_downloaded_in(model_dir: &Path, model: ChatModel) -> bool {
    missing_assets(model_dir, model.manifest()).is_empty()
}
