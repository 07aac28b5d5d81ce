//! CLI command modules.

pub mod queue;
pub mod scatter;

use std::sync::Arc;

use anyhow::{bail, Context, Result};

use assay_core::config::AssayConfig;
use assay_services::backend::{ContainerBackend, NetworkBackend, RequesterClient};
use assay_services::content_store::LocalContentStore;
use assay_services::{Backend, SqliteJobStore};

pub fn load_config() -> Result<AssayConfig> {
    AssayConfig::load().context("failed to load config")
}

/// Execution backend selected with `--backend`.
pub fn backend(name: &str, config: &AssayConfig) -> Result<Arc<dyn Backend>> {
    match name {
        "container" | "docker" => Ok(Arc::new(ContainerBackend::new(&config.container))),
        "network" => {
            let content = LocalContentStore::new(config.content.root.clone()).with_context(|| {
                format!("failed to open content store {}", config.content.root.display())
            })?;
            let api = RequesterClient::new(config.network.base_url());
            Ok(Arc::new(NetworkBackend::new(
                &config.network,
                Arc::new(api),
                Arc::new(content),
            )))
        }
        other => bail!("unknown backend {other:?} (expected container or network)"),
    }
}

pub fn open_store(config: &AssayConfig) -> Result<SqliteJobStore> {
    SqliteJobStore::open(&config.store.path)
        .with_context(|| format!("failed to open job store {}", config.store.path.display()))
}
