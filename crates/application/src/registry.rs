use banter_genai::{EngineLoader, PhiEngineLoader};

/// Registry of engine loaders for creating chat engines.
///
/// The application layer depends on this abstraction, not on concrete
/// engine types.
pub struct EngineRegistry {
    loaders: Vec<Box<dyn EngineLoader>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self {
            loaders: Vec::new(),
        }
    }

    /// Register a loader for a specific engine type.
    pub fn register(&mut self, loader: Box<dyn EngineLoader>) {
        tracing::debug!("Registering engine loader: {}", loader.name());
        self.loaders.push(loader);
    }

    /// Find a loader that can handle the given model ID.
    pub fn find_loader(&self, model_id: &str) -> Option<&dyn EngineLoader> {
        self.loaders
            .iter()
            .find(|l| l.can_load(model_id))
            .map(|l| l.as_ref())
    }

    /// Check if any loader can handle the given model ID.
    pub fn can_load(&self, model_id: &str) -> bool {
        self.loaders.iter().any(|l| l.can_load(model_id))
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with all available engine loaders.
///
/// This is called at startup to wire up the concrete engine
/// implementations.
pub fn create_default_registry() -> EngineRegistry {
    let mut registry = EngineRegistry::new();
    registry.register(Box::new(PhiEngineLoader));
    registry
}
