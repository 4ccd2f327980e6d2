//! Runtime bundle materialization
//!
//! The bundle directory ships every external component edgekube runs. The
//! container runtime, its shim, runc and the CNI plugins are copied under the base
//! directory and linked into their well-known host locations; the Kubernetes
//! components are run straight from the bundle.
//!
//! Expected layout:
//!
//! ```text
//! <bundle>/bin/{containerd,containerd-shim-runc-v2,runc,kine,kube-apiserver,...}
//! <bundle>/cni/{bridge,host-local,portmap,loopback}
//! <bundle>/images/*.tar[.gz]
//! ```

use std::path::{Path, PathBuf};

use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::{Paths, SystemPaths};
use crate::filesystem::{self, MODE_PUBLIC};
use crate::{Error, Result, DEFAULT_POD_CIDR};

/// CNI plugins the network config depends on
pub const REQUIRED_CNI_PLUGINS: [&str; 4] = ["bridge", "host-local", "portmap", "loopback"];

/// Kernel modules needed by the container runtime and kube-proxy
pub const KERNEL_MODULES: [&str; 6] = [
    "overlay",
    "br_netfilter",
    "ip_tables",
    "iptable_filter",
    "iptable_nat",
    "nf_conntrack",
];

/// Read-only view of the bundle directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    dir: PathBuf,
}

impl Bundle {
    /// Bundle rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of a component binary
    pub fn binary(&self, name: &str) -> PathBuf {
        self.dir.join("bin").join(name)
    }

    /// Path of a CNI plugin
    pub fn cni_plugin(&self, name: &str) -> PathBuf {
        self.dir.join("cni").join(name)
    }

    /// Directory of image archives
    pub fn images_dir(&self) -> PathBuf {
        self.dir.join("images")
    }
}

/// CNI network config: bridge with host-local IPAM, portmap and loopback
pub fn cni_config(pod_cidr: &str) -> serde_json::Value {
    json!({
        "cniVersion": "1.0.0",
        "name": "kubesolo-net",
        "plugins": [
            {
                "type": "bridge",
                "bridge": "cni0",
                "isGateway": true,
                "ipMasq": true,
                "hairpinMode": true,
                "capabilities": { "portMappings": true, "ips": true },
                "ipam": {
                    "type": "host-local",
                    "ranges": [[{ "subnet": pod_cidr }]],
                    "routes": [{ "dst": "0.0.0.0/0" }]
                }
            },
            {
                "type": "portmap",
                "capabilities": { "portMappings": true }
            },
            { "type": "loopback" }
        ]
    })
}

/// Copy runtime binaries, CNI plugins, CNI config and images into place
pub fn materialize(paths: &Paths, system: &SystemPaths, bundle: &Bundle) -> Result<()> {
    info!(bundle = %bundle.dir.display(), "Materializing runtime bundle");

    install_runtime(paths, system, bundle)?;
    install_cni_plugins(paths, system, bundle)?;
    write_cni_config(paths, system)?;
    copy_images(paths, bundle)?;

    Ok(())
}

fn install_runtime(paths: &Paths, system: &SystemPaths, bundle: &Bundle) -> Result<()> {
    for dest in [
        &paths.containerd_binary,
        &paths.containerd_shim_binary,
        &paths.runc_binary,
    ] {
        let name = file_name(dest)?;
        filesystem::extract_binary(&bundle.binary(name), dest)?;
    }
    filesystem::ensure_symlink(&paths.runc_binary, &system.runc)
}

fn install_cni_plugins(paths: &Paths, system: &SystemPaths, bundle: &Bundle) -> Result<()> {
    filesystem::ensure_dir(&paths.cni_bin_dir)?;
    for plugin in REQUIRED_CNI_PLUGINS {
        filesystem::extract_binary(&bundle.cni_plugin(plugin), &paths.cni_bin_dir.join(plugin))?;
    }
    filesystem::ensure_symlink(&paths.cni_bin_dir, &system.cni_bin_dir)
}

fn write_cni_config(paths: &Paths, system: &SystemPaths) -> Result<()> {
    let config = serde_json::to_vec_pretty(&cni_config(DEFAULT_POD_CIDR))
        .map_err(|e| Error::serialization(format!("failed to encode CNI config: {}", e)))?;
    filesystem::write_file(&paths.cni_conf_file, &config, MODE_PUBLIC)?;

    let link = system.cni_conf_dir.join(file_name(&paths.cni_conf_file)?);
    filesystem::ensure_symlink(&paths.cni_conf_file, &link)
}

fn copy_images(paths: &Paths, bundle: &Bundle) -> Result<()> {
    filesystem::ensure_dir(&paths.containerd_images_dir)?;

    let source_dir = bundle.images_dir();
    let entries = match std::fs::read_dir(&source_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(dir = %source_dir.display(), "Bundle has no images");
            return Ok(());
        }
        Err(e) => {
            return Err(Error::filesystem(format!(
                "failed to read {}: {}",
                source_dir.display(),
                e
            )))
        }
    };

    for entry in entries.flatten() {
        let source = entry.path();
        if !source.is_file() {
            continue;
        }
        let name = file_name(&source)?;
        filesystem::copy_if_missing(&source, &paths.containerd_images_dir.join(name), MODE_PUBLIC)?;
    }
    Ok(())
}

fn file_name(path: &Path) -> Result<&str> {
    path.file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::filesystem(format!("{} has no file name", path.display())))
}

/// Load kernel modules and enable IPv4 forwarding
///
/// Failures are logged: on hosts with the modules built in, modprobe fails harmlessly.
pub fn prepare_kernel(system: &SystemPaths) {
    match &system.modprobe {
        Some(modprobe) => {
            for module in KERNEL_MODULES {
                match std::process::Command::new(modprobe).arg(module).status() {
                    Ok(status) if status.success() => debug!(module, "Kernel module loaded"),
                    Ok(status) => warn!(module, %status, "modprobe failed"),
                    Err(e) => warn!(module, error = %e, "Failed to run modprobe"),
                }
            }
        }
        None => debug!("Kernel module loading disabled"),
    }

    if let Err(e) = std::fs::write(&system.ip_forward, b"1") {
        warn!(error = %e, "Failed to enable IP forwarding");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    /// Fake bundle with every binary present
    fn fake_bundle(root: &Path) -> Bundle {
        let bundle = Bundle::new(root.join("bundle"));
        for name in ["containerd", "containerd-shim-runc-v2", "runc"] {
            let path = bundle.binary(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, name).unwrap();
        }
        for plugin in REQUIRED_CNI_PLUGINS {
            let path = bundle.cni_plugin(plugin);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, plugin).unwrap();
        }
        fs::create_dir_all(bundle.images_dir()).unwrap();
        fs::write(bundle.images_dir().join("coredns.tar.gz"), b"image").unwrap();
        bundle
    }

    #[test]
    fn cni_config_chains_bridge_portmap_loopback() {
        let config = cni_config("10.42.0.0/16");
        let plugins = config["plugins"].as_array().unwrap();
        let types: Vec<_> = plugins.iter().map(|p| p["type"].as_str().unwrap()).collect();
        assert_eq!(types, vec!["bridge", "portmap", "loopback"]);
        assert_eq!(plugins[0]["ipam"]["type"], "host-local");
        assert_eq!(plugins[0]["ipam"]["ranges"][0][0]["subnet"], "10.42.0.0/16");
        assert_eq!(config["cniVersion"], "1.0.0");
    }

    #[test]
    fn materialize_lays_out_runtime_and_links_system_paths() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::new(tmp.path().join("base"));
        let system = SystemPaths::rooted_at(&tmp.path().join("host"));
        let bundle = fake_bundle(tmp.path());

        materialize(&paths, &system, &bundle).unwrap();

        assert_eq!(fs::read(&paths.containerd_binary).unwrap(), b"containerd");
        assert_eq!(fs::read_link(&system.runc).unwrap(), paths.runc_binary);
        assert_eq!(fs::read_link(&system.cni_bin_dir).unwrap(), paths.cni_bin_dir);
        assert!(system.cni_bin_dir.join("portmap").exists());

        let link = system.cni_conf_dir.join("10-bridge.conflist");
        let written: serde_json::Value =
            serde_json::from_slice(&fs::read(&link).unwrap()).unwrap();
        assert_eq!(written["name"], "kubesolo-net");
        assert!(paths.containerd_images_dir.join("coredns.tar.gz").exists());
    }

    #[test]
    fn rooted_host_enables_forwarding_without_loading_modules() {
        let tmp = TempDir::new().unwrap();
        let system = SystemPaths::rooted_at(tmp.path());
        assert_eq!(system.modprobe, None);
        fs::create_dir_all(system.ip_forward.parent().unwrap()).unwrap();

        prepare_kernel(&system);

        assert_eq!(fs::read(&system.ip_forward).unwrap(), b"1");
    }

    #[test]
    fn module_loader_failures_are_not_fatal() {
        let tmp = TempDir::new().unwrap();
        let system = SystemPaths {
            modprobe: Some(tmp.path().join("no-such-modprobe")),
            ..SystemPaths::rooted_at(tmp.path())
        };

        prepare_kernel(&system);
    }

    #[test]
    fn materialize_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::new(tmp.path().join("base"));
        let system = SystemPaths::rooted_at(&tmp.path().join("host"));
        let bundle = fake_bundle(tmp.path());

        materialize(&paths, &system, &bundle).unwrap();
        materialize(&paths, &system, &bundle).unwrap();
        assert_eq!(fs::read_link(&system.runc).unwrap(), paths.runc_binary);
    }

    #[test]
    fn missing_runtime_binary_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::new(tmp.path().join("base"));
        let system = SystemPaths::rooted_at(&tmp.path().join("host"));
        let bundle = Bundle::new(tmp.path().join("empty"));

        let err = materialize(&paths, &system, &bundle).unwrap_err();
        assert!(err.is_fatal_bootstrap());
    }

    #[test]
    fn bundle_without_images_is_fine() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::new(tmp.path().join("base"));
        copy_images(&paths, &Bundle::new(tmp.path().join("nothing"))).unwrap();
        assert!(paths.containerd_images_dir.is_dir());
    }
}
