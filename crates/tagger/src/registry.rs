use crate::{backend::Interrogator, error::TaggerError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

/// Shared, lockable engine. Borrowed by the service for the length of one call.
pub type ModelHandle = Arc<Mutex<Box<dyn Interrogator>>>;

/// Lock a handle, recovering it if a previous holder panicked mid-inference.
pub(crate) fn lock_handle(handle: &ModelHandle) -> MutexGuard<'_, Box<dyn Interrogator>> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Model name to engine, in registration order.
#[derive(Default)]
pub struct ModelRegistry {
    models: RwLock<Vec<(String, ModelHandle)>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an engine under `name`, replacing any engine already there.
    /// A replaced engine keeps its position in [`names`](Self::names).
    pub fn register(&self, name: impl Into<String>, interrogator: impl Interrogator + 'static) {
        let name = name.into();
        let handle: ModelHandle = Arc::new(Mutex::new(Box::new(interrogator)));
        let mut models = self.models.write().unwrap_or_else(PoisonError::into_inner);

        match models.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => {
                tracing::info!(model = %name, "Replacing registered model");
                slot.1 = handle;
            }
            None => {
                tracing::info!(model = %name, "Registered model");
                models.push((name, handle));
            }
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|(existing, _)| existing == name)
    }

    pub fn get(&self, name: &str) -> Result<ModelHandle, TaggerError> {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, handle)| Arc::clone(handle))
            .ok_or_else(|| TaggerError::ModelNotFound(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.models.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ask every engine to unload and count the ones that actually freed
    /// something.
    ///
    /// Each engine is locked while it unloads, so this waits for an engine
    /// that is mid-inference. It does not take the service's gate; go through
    /// [`crate::InterrogationService::unload_all`] for that.
    pub fn unload_all(&self) -> usize {
        let handles: Vec<(String, ModelHandle)> = self
            .models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        handles
            .iter()
            .filter(|(name, handle)| {
                let unloaded = lock_handle(handle).unload();
                tracing::debug!(model = %name, unloaded, "Unload requested");
                unloaded
            })
            .count()
    }
}
