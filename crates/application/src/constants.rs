/// System prompt applied when the caller does not supply one.
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant. Answer concisely and accurately.";

/// Cap on newly generated tokens per assistant reply.
pub const DEFAULT_MAX_NEW_TOKENS: usize = 256;
