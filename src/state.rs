//! Shared application state.

use crate::config::Config;
use crate::installer::{DependencyInstaller, VenvInstaller};
use crate::interpreter::{InterpreterResolver, ProbingResolver};
use crate::registry::ProcessRegistry;
use crate::upload::UploadFlow;
use crate::workspace::WorkspaceStore;
use std::sync::Arc;

/// Everything a request handler needs, cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub workspaces: WorkspaceStore,
    pub registry: ProcessRegistry,
    pub uploads: UploadFlow,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let installer = VenvInstaller {
            python: config.python.clone(),
            provision_timeout: config.venv_timeout(),
            install_timeout: config.install_timeout(),
        };
        let resolver = ProbingResolver::new(config.python.clone(), config.probe_timeout());
        Self::with_parts(config, Arc::new(installer), Arc::new(resolver))
    }

    pub fn with_parts(
        config: Config,
        installer: Arc<dyn DependencyInstaller>,
        resolver: Arc<dyn InterpreterResolver>,
    ) -> Self {
        let workspaces = WorkspaceStore::new(config.root.clone());
        let registry = ProcessRegistry::new(workspaces.clone(), resolver, config.stop_grace());
        let uploads = UploadFlow::new(
            workspaces.clone(),
            installer,
            registry.clone(),
            config.upload_ttl(),
        );
        Self {
            config: Arc::new(config),
            workspaces,
            registry,
            uploads,
        }
    }
}
