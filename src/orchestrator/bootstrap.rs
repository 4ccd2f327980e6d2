//! Pre-sequencing bootstrap
//!
//! Everything here runs once, synchronously, before the first service starts.
//! Any error is fatal: the node never reaches the sequencing phase.

use tracing::info;

use crate::bundle::{self, Bundle};
use crate::config::Config;
use crate::filesystem;
use crate::pki::{self, PolicyContext};
use crate::Result;

/// Prepare the base directory, materialize the bundle and issue every certificate
pub fn bootstrap(config: &Config) -> Result<()> {
    let paths = &config.paths;
    info!(base = %paths.base.display(), node = %config.node_name, "Bootstrapping node");

    for dir in [
        &paths.base,
        &paths.pki_dir,
        &paths.containerd_dir,
        &paths.kubelet_dir,
        &paths.kine_dir,
        &paths.controller_manager_dir,
    ] {
        filesystem::ensure_dir(dir)?;
    }

    bundle::materialize(paths, &config.system, &Bundle::new(&config.bundle_dir))?;
    bundle::prepare_kernel(&config.system);

    pki::issue_all(paths, &PolicyContext::detect(&config.node_name))?;

    info!("Bootstrap complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Paths, SystemPaths};
    use std::fs;
    use tempfile::TempDir;

    fn test_config(root: &std::path::Path) -> Config {
        let bundle_dir = root.join("bundle");
        for name in ["containerd", "containerd-shim-runc-v2", "runc"] {
            let path = bundle_dir.join("bin").join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, name).unwrap();
        }
        for plugin in bundle::REQUIRED_CNI_PLUGINS {
            let path = bundle_dir.join("cni").join(plugin);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, plugin).unwrap();
        }

        Config {
            paths: Paths::new(root.join("base")),
            system: SystemPaths::rooted_at(&root.join("host")),
            bundle_dir,
            node_name: "edge-01".to_string(),
            ..Config::default()
        }
    }

    /// Story: first boot leaves a complete state directory behind
    #[test]
    fn story_first_boot_prepares_everything() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());

        bootstrap(&config).unwrap();

        for certs in config.paths.all_certs() {
            assert!(certs.cert.exists(), "{} missing", certs.cert.display());
            assert!(certs.key.exists(), "{} missing", certs.key.display());
        }
        assert!(config.paths.containerd_binary.exists());
        assert!(config.paths.cni_conf_file.exists());
        assert!(config.paths.controller_manager_dir.is_dir());
    }

    /// Story: a second boot keeps the certificates of the first
    #[test]
    fn story_second_boot_keeps_certificates() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());

        bootstrap(&config).unwrap();
        let ca = fs::read(&config.paths.ca.cert).unwrap();
        bootstrap(&config).unwrap();
        assert_eq!(fs::read(&config.paths.ca.cert).unwrap(), ca);
    }

    #[test]
    fn missing_bundle_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let config = Config {
            paths: Paths::new(tmp.path().join("base")),
            system: SystemPaths::rooted_at(&tmp.path().join("host")),
            bundle_dir: tmp.path().join("no-bundle"),
            ..Config::default()
        };

        let err = bootstrap(&config).unwrap_err();
        assert!(err.is_fatal_bootstrap());
        assert!(!config.paths.ca.cert.exists());
    }
}
