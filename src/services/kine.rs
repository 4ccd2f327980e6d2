//! kine adapter: an etcd-compatible endpoint over a local sqlite database

use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{run_component, wait_for_tcp};
use crate::bundle::Bundle;
use crate::config::Paths;
use crate::filesystem;
use crate::orchestrator::Service;
use crate::process::ProcessSpec;
use crate::readiness::ReadinessNotifier;
use crate::{Result, DEFAULT_KINE_ENDPOINT, DEFAULT_RETRY_COUNT, DEFAULT_RETRY_INTERVAL};

/// Service name
pub const NAME: &str = "kine";

/// sqlite datastore URL with WAL journaling and a generous busy timeout
pub fn datastore_endpoint(db_dir: &Path) -> String {
    format!(
        "sqlite://{}/state.db?_journal=WAL&cache=shared&_busy_timeout=30000&_txlock=immediate",
        db_dir.display()
    )
}

/// kine arguments
pub fn args(paths: &Paths) -> Vec<String> {
    [
        "--endpoint",
        &datastore_endpoint(&paths.kine_db_dir),
        "--listen-address",
        DEFAULT_KINE_ENDPOINT,
        "--datastore-max-idle-connections",
        "2",
        "--datastore-max-open-connections",
        "3",
        "--datastore-connection-max-lifetime",
        "10s",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// kine as a chain service
pub struct Kine {
    paths: Paths,
    spec: ProcessSpec,
}

impl Kine {
    /// Adapter running the bundle's `kine`
    pub fn new(paths: &Paths, bundle: &Bundle) -> Self {
        Self {
            paths: paths.clone(),
            spec: ProcessSpec::new(NAME, bundle.binary(NAME)).args(args(paths)),
        }
    }
}

#[async_trait]
impl Service for Kine {
    async fn run(&self, cancel: CancellationToken, ready: ReadinessNotifier) -> Result<()> {
        filesystem::ensure_dir(&self.paths.kine_db_dir)?;
        run_component(self.spec.clone(), cancel, ready, || {
            wait_for_tcp(DEFAULT_KINE_ENDPOINT, DEFAULT_RETRY_COUNT, DEFAULT_RETRY_INTERVAL)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_uses_wal_sqlite_in_db_dir() {
        let endpoint = datastore_endpoint(Path::new("/var/lib/edgekube/kine/db"));
        assert!(endpoint.starts_with("sqlite:///var/lib/edgekube/kine/db/state.db?"));
        assert!(endpoint.contains("_journal=WAL"));
        assert!(endpoint.contains("_busy_timeout=30000"));
    }

    #[test]
    fn listens_on_loopback_only() {
        let args = args(&Paths::new("/var/lib/edgekube"));
        let pos = args.iter().position(|a| a == "--listen-address").unwrap();
        assert_eq!(args[pos + 1], "127.0.0.1:2379");
    }

    #[test]
    fn connection_pool_is_small() {
        let args = args(&Paths::new("/var/lib/edgekube"));
        let value = |flag: &str| {
            let pos = args.iter().position(|a| a == flag).unwrap();
            args[pos + 1].clone()
        };
        assert_eq!(value("--datastore-max-idle-connections"), "2");
        assert_eq!(value("--datastore-max-open-connections"), "3");
    }
}
