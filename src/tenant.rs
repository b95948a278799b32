use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;

/// One marketplace per pgwire database name. Each gets its own Engine, WAL
/// file and compactor task, created on first connect.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
}

/// Keep only characters that are safe in a file name.
fn sanitize(tenant: &str) -> io::Result<String> {
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "tenant name too long"));
    }
    let safe: String = tenant
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if safe.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty tenant name"));
    }
    Ok(safe)
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
        }
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// Get or lazily create the engine for `tenant`. Names that sanitize to
    /// the same file share one engine.
    pub fn get_or_create(&self, tenant: &str) -> io::Result<Arc<Engine>> {
        let safe_name = sanitize(tenant)?;
        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many tenants"));
        }

        // The entry guard serializes concurrent first connects to one tenant,
        // so its WAL is only ever replayed and opened once.
        let entry = self.engines.entry(safe_name.clone()).or_try_insert_with(|| {
            let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
            let engine = Arc::new(Engine::new(wal_path)?);
            let compactor_engine = engine.clone();
            let threshold = self.compact_threshold;
            tokio::spawn(async move {
                compactor::run_compactor(compactor_engine, threshold).await;
            });
            info!(tenant = %safe_name, "tenant loaded");
            Ok::<_, io::Error>(engine)
        })?;
        let engine = entry.value().clone();
        drop(entry);

        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}
