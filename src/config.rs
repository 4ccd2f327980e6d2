//! Runtime configuration and on-disk layout
//!
//! Every file edgekube reads or writes is resolved here from a single base
//! directory, so the rest of the crate never joins path fragments itself.

use std::path::{Path, PathBuf};

use crate::{DEFAULT_BASE_PATH, DEFAULT_BUNDLE_PATH, DEFAULT_NODE_NAME};

/// Certificate and key locations for one identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPaths {
    /// Directory holding the pair
    pub dir: PathBuf,
    /// PEM certificate
    pub cert: PathBuf,
    /// PEM private key
    pub key: PathBuf,
}

impl CertPaths {
    fn new(pki_dir: &Path, dir_name: &str, file_stem: &str) -> Self {
        let dir = pki_dir.join(dir_name);
        Self {
            cert: dir.join(format!("{file_stem}.crt")),
            key: dir.join(format!("{file_stem}.key")),
            dir,
        }
    }
}

/// Host-wide locations outside the base directory
///
/// Re-rootable so tests can run against a temporary directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemPaths {
    /// Directory the container runtime reads CNI network configs from
    pub cni_conf_dir: PathBuf,
    /// Directory the container runtime loads CNI plugins from
    pub cni_bin_dir: PathBuf,
    /// Well-known runc location
    pub runc: PathBuf,
    /// Well-known containerd socket location
    pub containerd_socket: PathBuf,
    /// IPv4 forwarding sysctl
    pub ip_forward: PathBuf,
    /// Kernel module loader; `None` skips module loading
    pub modprobe: Option<PathBuf>,
}

impl Default for SystemPaths {
    fn default() -> Self {
        Self {
            modprobe: Some(PathBuf::from("modprobe")),
            ..Self::rooted_at(Path::new("/"))
        }
    }
}

impl SystemPaths {
    /// Resolve the system locations under `root`
    ///
    /// A re-rooted host has no kernel of its own, so module loading is off.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            cni_conf_dir: root.join("etc/cni/net.d"),
            cni_bin_dir: root.join("opt/cni/bin"),
            runc: root.join("usr/local/bin/runc"),
            containerd_socket: root.join("run/containerd/containerd.sock"),
            ip_forward: root.join("proc/sys/net/ipv4/ip_forward"),
            modprobe: None,
        }
    }
}

/// Every path derived from the base directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    /// Base directory
    pub base: PathBuf,

    /// PKI root directory
    pub pki_dir: PathBuf,
    /// Root CA
    pub ca: CertPaths,
    /// Admin user
    pub admin: CertPaths,
    /// API server serving/kubelet-client identity
    pub apiserver: CertPaths,
    /// Controller manager
    pub controller_manager: CertPaths,
    /// Kubelet
    pub kubelet: CertPaths,
    /// Mutating webhook
    pub webhook: CertPaths,
    /// Admin kubeconfig
    pub admin_kubeconfig: PathBuf,
    /// Kubelet kubeconfig
    pub kubelet_kubeconfig: PathBuf,
    /// Service account signing key
    pub service_account_key: PathBuf,

    /// containerd working directory
    pub containerd_dir: PathBuf,
    /// containerd binaries
    pub containerd_bin_dir: PathBuf,
    /// containerd daemon binary
    pub containerd_binary: PathBuf,
    /// runc shim binary
    pub containerd_shim_binary: PathBuf,
    /// runc binary
    pub runc_binary: PathBuf,
    /// containerd TOML config
    pub containerd_config: PathBuf,
    /// containerd gRPC socket
    pub containerd_socket: PathBuf,
    /// containerd persistent root
    pub containerd_root_dir: PathBuf,
    /// containerd state directory
    pub containerd_state_dir: PathBuf,
    /// Image archives to import
    pub containerd_images_dir: PathBuf,
    /// CNI plugin binaries
    pub cni_bin_dir: PathBuf,
    /// CNI config directory
    pub cni_conf_dir: PathBuf,
    /// CNI conflist
    pub cni_conf_file: PathBuf,

    /// Kubelet root directory
    pub kubelet_dir: PathBuf,
    /// Kubelet config directory
    pub kubelet_config_dir: PathBuf,
    /// KubeletConfiguration file
    pub kubelet_config_file: PathBuf,
    /// Flexvolume plugin directory
    pub kubelet_volume_plugin_dir: PathBuf,

    /// kine working directory
    pub kine_dir: PathBuf,
    /// kine sqlite database directory
    pub kine_db_dir: PathBuf,

    /// Controller manager working directory
    pub controller_manager_dir: PathBuf,
}

impl Paths {
    /// Resolve every path from `base`
    pub fn new(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        let pki_dir = base.join("pki");

        let ca = CertPaths::new(&pki_dir, "ca", "ca");
        let admin = CertPaths::new(&pki_dir, "admin", "admin");
        let apiserver = CertPaths::new(&pki_dir, "apiserver", "apiserver");
        let controller_manager =
            CertPaths::new(&pki_dir, "controller-manager", "controller-manager");
        let kubelet = CertPaths::new(&pki_dir, "kubelet", "kubelet");
        let webhook = CertPaths::new(&pki_dir, "webhook", "webhook");

        let containerd_dir = base.join("containerd");
        let containerd_bin_dir = containerd_dir.join("bin");
        let cni_dir = containerd_dir.join("cni");
        let cni_conf_dir = cni_dir.join("conf");

        let kubelet_dir = base.join("kubelet");
        let kubelet_config_dir = kubelet_dir.join("config");

        let kine_dir = base.join("kine");
        let controller_manager_dir = base.join("controller-manager");

        Self {
            admin_kubeconfig: admin.dir.join("admin.kubeconfig"),
            kubelet_kubeconfig: kubelet.dir.join("kubelet.kubeconfig"),
            service_account_key: apiserver.dir.join("service-account.key"),
            ca,
            admin,
            apiserver,
            controller_manager,
            kubelet,
            webhook,
            pki_dir,

            containerd_binary: containerd_bin_dir.join("containerd"),
            containerd_shim_binary: containerd_bin_dir.join("containerd-shim-runc-v2"),
            runc_binary: containerd_bin_dir.join("runc"),
            containerd_bin_dir,
            containerd_config: containerd_dir.join("config.toml"),
            containerd_socket: containerd_dir.join("containerd.sock"),
            containerd_root_dir: containerd_dir.join("root"),
            containerd_state_dir: containerd_dir.join("state"),
            containerd_images_dir: containerd_dir.join("images"),
            cni_bin_dir: cni_dir.join("bin"),
            cni_conf_file: cni_conf_dir.join("10-bridge.conflist"),
            cni_conf_dir,
            containerd_dir,

            kubelet_config_file: kubelet_config_dir.join("config.yaml"),
            kubelet_volume_plugin_dir: kubelet_dir.join("volumeplugins"),
            kubelet_config_dir,
            kubelet_dir,

            kine_db_dir: kine_dir.join("db"),
            kine_dir,

            controller_manager_dir: controller_manager_dir.join("config"),

            base,
        }
    }

    /// Certificate paths for every identity, in issuance order
    pub fn all_certs(&self) -> [&CertPaths; 6] {
        [
            &self.ca,
            &self.kubelet,
            &self.apiserver,
            &self.controller_manager,
            &self.admin,
            &self.webhook,
        ]
    }
}

/// Portainer edge agent credentials
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgeAgentConfig {
    /// Edge environment identifier
    pub edge_id: String,
    /// Edge key used to join the Portainer server
    pub edge_key: String,
}

impl EdgeAgentConfig {
    /// The edge agent is deployed only when both values are present
    pub fn is_enabled(&self) -> bool {
        !self.edge_id.is_empty() && !self.edge_key.is_empty()
    }
}

/// Resolved runtime configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Paths under the base directory
    pub paths: Paths,
    /// Host-wide paths
    pub system: SystemPaths,
    /// Directory the runtime bundle is read from
    pub bundle_dir: PathBuf,
    /// Name this node registers under
    pub node_name: String,
    /// Edge agent credentials
    pub edge: EdgeAgentConfig,
    /// Serve the diagnostics endpoint
    pub diagnostics: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            paths: Paths::new(DEFAULT_BASE_PATH),
            system: SystemPaths::default(),
            bundle_dir: PathBuf::from(DEFAULT_BUNDLE_PATH),
            node_name: DEFAULT_NODE_NAME.to_string(),
            edge: EdgeAgentConfig::default(),
            diagnostics: false,
        }
    }
}

/// Node name derived from the host name, lower-cased
///
/// Falls back to [`DEFAULT_NODE_NAME`] when the host name is unavailable or not UTF-8.
pub fn node_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .map(|h| h.trim().to_lowercase())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| DEFAULT_NODE_NAME.to_string())
}
