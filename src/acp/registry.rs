//! ACP Runtime Backend Registry (§4.5, §6): resolves a named backend id to
//! a runtime implementing the streaming contract. Populated once at
//! process start; absence of the requested backend is `ACP_BACKEND_MISSING`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::AcpErrorCode;
use crate::{AppError, Result};

use super::RuntimeBackend;

/// Maps backend ids to their runtime implementation.
#[derive(Default, Clone)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn RuntimeBackend>>,
}

impl BackendRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
        }
    }

    /// Register a backend under its own [`RuntimeBackend::id`].
    pub fn register(&mut self, backend: Arc<dyn RuntimeBackend>) {
        self.backends.insert(backend.id().to_owned(), backend);
    }

    /// Resolve a backend id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Acp` with code `BackendMissing` if no backend is
    /// registered under `id`.
    pub fn resolve(&self, id: &str) -> Result<Arc<dyn RuntimeBackend>> {
        self.backends
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::acp(AcpErrorCode::BackendMissing, format!("no backend registered for id '{id}'")))
    }
}
