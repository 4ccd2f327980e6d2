//! Edgekube - single-node Kubernetes bootstrapper for constrained edge devices
//!
//! Edgekube brings up a complete control plane and node on one host by starting a
//! fixed chain of external components in dependency order:
//!
//! containerd → kine → kube-apiserver → kube-controller-manager → kubelet → kube-proxy
//!
//! Each component is started only after the previous one has signalled readiness.
//! Once the chain is up, cluster add-ons (CoreDNS, optionally the Portainer edge agent)
//! are deployed and the process waits for a termination signal.
//!
//! # Modules
//!
//! - [`orchestrator`] - Dependency-ordered startup with readiness gating and fail-fast shutdown
//! - [`pki`] - Certificate authority and leaf certificate issuance for every internal identity
//! - [`services`] - Adapters that run each external component as a supervised process
//! - [`readiness`] - One-shot readiness signals shared between services and the orchestrator
//! - [`health`] - Bounded-retry HTTP(S) health prober
//! - [`retry`] - Retry utilities with fixed or exponential backoff
//! - [`bundle`] - Materializes runtime binaries, CNI plugins and CNI configuration
//! - [`filesystem`] - Small idempotent filesystem helpers
//! - [`network`] - Local address discovery for certificate SANs and node IP
//! - [`config`] - Runtime configuration and on-disk path layout
//! - [`kubeconfig`] - Admin and kubelet kubeconfig rendering
//! - [`kube_client`] - Cluster client and server-side apply helper
//! - [`rbac`] - RBAC objects applied after the API server is up
//! - [`webhook`] - Node-name mutating admission webhook
//! - [`addons`] - Declarative cluster add-ons
//! - [`diagnostics`] - Optional debug HTTP server
//! - [`process`] - Supervised child process handling
//! - [`telemetry`] - Tracing subscriber setup
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod addons;
pub mod bundle;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod filesystem;
pub mod health;
pub mod kube_client;
pub mod kubeconfig;
pub mod network;
pub mod orchestrator;
pub mod pki;
pub mod process;
pub mod rbac;
pub mod readiness;
pub mod retry;
pub mod services;
pub mod telemetry;
pub mod webhook;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// Cluster-wide defaults shared by the certificate policies, the component flags
// and the add-on manifests.

/// Default base directory for all generated state
pub const DEFAULT_BASE_PATH: &str = "/var/lib/edgekube";

/// Default directory holding the runtime bundle (component binaries, CNI plugins, images)
pub const DEFAULT_BUNDLE_PATH: &str = "/usr/lib/edgekube";

/// Node name used when the host name cannot be determined
pub const DEFAULT_NODE_NAME: &str = "edgekube-node";

/// API server URL as seen from the node
pub const DEFAULT_API_SERVER_ADDRESS: &str = "https://127.0.0.1:6443";

/// Listen address of the kine etcd shim
pub const DEFAULT_KINE_ENDPOINT: &str = "127.0.0.1:2379";

/// Pod network range
pub const DEFAULT_POD_CIDR: &str = "10.42.0.0/16";

/// Service network range
pub const DEFAULT_SERVICE_CIDR: &str = "10.43.0.0/16";

/// Cluster IP of the `kubernetes` service (first address of the service range)
pub const DEFAULT_KUBERNETES_SERVICE_IP: std::net::Ipv4Addr = std::net::Ipv4Addr::new(10, 43, 0, 1);

/// Cluster IP of the DNS service
pub const DEFAULT_COREDNS_IP: &str = "10.43.0.10";

/// Sandbox (pause) image pinned in the container runtime
pub const DEFAULT_SANDBOX_IMAGE: &str = "registry.k8s.io/pause:3.10";

/// CoreDNS image
pub const DEFAULT_COREDNS_IMAGE: &str = "coredns/coredns:1.12.1";

/// Portainer edge agent image
pub const DEFAULT_EDGE_AGENT_IMAGE: &str = "portainer/agent:2.29.2";

/// Port the node-name mutating webhook listens on
pub const DEFAULT_WEBHOOK_PORT: u16 = 10443;

/// Name of the mutating webhook and its configuration object
pub const DEFAULT_WEBHOOK_NAME: &str = "webhook.kubesolo.io";

/// Port of the diagnostics server enabled with `--pprof-server`
pub const DEFAULT_DIAGNOSTICS_PORT: u16 = 6060;

/// Number of attempts made by health probes before giving up
pub const DEFAULT_RETRY_COUNT: u32 = 12;

/// Fixed delay between health probe attempts
pub const DEFAULT_RETRY_INTERVAL: std::time::Duration = std::time::Duration::from_secs(2);

/// Per-request timeout of health probe clients
pub const DEFAULT_PROBE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Delay before add-ons are applied, letting controllers settle
pub const DEFAULT_COMPONENT_SLEEP: std::time::Duration = std::time::Duration::from_secs(5);

/// Upper bound on a single add-on deployment
pub const DEFAULT_CONTEXT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);

/// Field manager name used for server-side apply
pub const FIELD_MANAGER: &str = "edgekube";
