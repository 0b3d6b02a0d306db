mod phi;

pub use phi::{PhiEngine, PhiEngineLoader};

use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to load tokenizer: {0}")]
    Tokenizer(String),
    #[error("failed to load model: {0}")]
    Model(String),
    #[error("invalid generation config: {0}")]
    Config(String),
    #[error("inference failed: {0}")]
    Generation(String),
    #[error("invalid model output")]
    InvalidOutput,
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Who produced a turn of the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One turn handed to the engine. The engine formats turns into its own
/// chat template; callers never deal with template markers.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatTurn {
    pub role: Role,
    pub text: String,
}

impl ChatTurn {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            text: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}

/// Decode-time knobs.
#[derive(Debug, Clone, Copy)]
pub struct GenerateOptions {
    pub max_new_tokens: usize,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_new_tokens: 256,
        }
    }
}

/// A constructed model session plus its tokenizer.
///
/// The implementation owns both, so the tokenizer can never outlive the
/// session it belongs to. Dropping the engine releases everything.
pub trait ChatEngine: Send + Sync {
    /// Greedy-decode a reply to the given turns. `on_token` receives each
    /// piece of decoded text as soon as it is stable; the full reply is also
    /// returned at the end.
    fn generate(
        &self,
        turns: &[ChatTurn],
        options: &GenerateOptions,
        on_token: &mut dyn FnMut(&str),
    ) -> Result<String>;

    fn model_name(&self) -> &str;
}

/// Factory trait for constructing chat engines.
///
/// The application layer depends on this abstraction, not on concrete
/// engine types, so the provisioning workflow can be tested without ONNX
/// Runtime present.
pub trait EngineLoader: Send + Sync {
    /// Human-readable name of the engine type.
    fn name(&self) -> &str;

    /// Check if this loader can handle the given model identifier.
    fn can_load(&self, model_id: &str) -> bool;

    /// Construct an engine from a directory that holds every manifest file.
    ///
    /// Must only be called once the manifest is satisfied; a partial
    /// directory is a construction error, not a silent fallback.
    fn load(&self, model_id: &str, model_dir: &Path) -> Result<Box<dyn ChatEngine>>;
}
