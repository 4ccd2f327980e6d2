//! Bootstrap against a fake bundle and the inputs it leaves for the components

use std::fs;
use std::path::Path;

use tempfile::TempDir;

use edgekube::bundle::{self, REQUIRED_CNI_PLUGINS};
use edgekube::config::{Config, Paths, SystemPaths};
use edgekube::services::{containerd, kubelet};
use edgekube::{kubeconfig, orchestrator, pki};

/// Bundle with placeholder binaries for everything materialization copies
fn fake_bundle(dir: &Path) {
    for name in ["containerd", "containerd-shim-runc-v2", "runc"] {
        let path = dir.join("bin").join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, format!("#!/bin/sh\n# {}\n", name)).unwrap();
    }
    for plugin in REQUIRED_CNI_PLUGINS {
        let path = dir.join("cni").join(plugin);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, plugin).unwrap();
    }
    fs::create_dir_all(dir.join("images")).unwrap();
    fs::write(dir.join("images").join("pause.tar"), b"tar").unwrap();
}

fn config(root: &Path) -> Config {
    fake_bundle(&root.join("bundle"));
    Config {
        paths: Paths::new(root.join("state")),
        system: SystemPaths::rooted_at(&root.join("host")),
        bundle_dir: root.join("bundle"),
        node_name: "edge-01".to_string(),
        ..Config::default()
    }
}

/// Story: after bootstrap every file a component reads is in place
#[test]
fn story_bootstrap_leaves_component_inputs() {
    let tmp = TempDir::new().unwrap();
    let config = config(tmp.path());

    orchestrator::bootstrap(&config).unwrap();

    let paths = &config.paths;
    assert!(paths.runc_binary.exists());
    assert!(fs::symlink_metadata(&config.system.runc)
        .unwrap()
        .file_type()
        .is_symlink());
    for plugin in REQUIRED_CNI_PLUGINS {
        assert!(paths.cni_bin_dir.join(plugin).exists());
    }
    assert!(paths.containerd_images_dir.join("pause.tar").exists());

    let conflist: serde_json::Value =
        serde_json::from_slice(&fs::read(&paths.cni_conf_file).unwrap()).unwrap();
    assert_eq!(conflist, bundle::cni_config(edgekube::DEFAULT_POD_CIDR));

    let ca = fs::read_to_string(&paths.ca.cert).unwrap();
    pki::verify_signed_by(&fs::read_to_string(&paths.kubelet.cert).unwrap(), &ca).unwrap();
}

/// Story: the admin kubeconfig written after bootstrap is usable by kube clients
#[test]
fn story_admin_kubeconfig_embeds_issued_credentials() {
    let tmp = TempDir::new().unwrap();
    let config = config(tmp.path());
    orchestrator::bootstrap(&config).unwrap();

    kubeconfig::write_admin_kubeconfig(&config.paths).unwrap();

    let parsed = kube::config::Kubeconfig::read_from(&config.paths.admin_kubeconfig).unwrap();
    assert_eq!(
        parsed.current_context.as_deref(),
        Some("kubernetes-admin@kubesolo")
    );
    let cluster = parsed.clusters[0].cluster.as_ref().unwrap();
    assert_eq!(cluster.server.as_deref(), Some("https://127.0.0.1:6443"));
    assert!(cluster.certificate_authority_data.is_some());
}

/// Story: the rendered runtime and kubelet configs agree on the CRI socket
#[test]
fn story_runtime_and_kubelet_share_the_socket() {
    let tmp = TempDir::new().unwrap();
    let config = config(tmp.path());

    let rendered: toml::Value =
        toml::from_str(&containerd::render_config(&config.paths, &config.system).unwrap())
            .unwrap();
    let socket = rendered["grpc"]["address"].as_str().unwrap().to_string();

    let kubelet_config = kubelet::kubelet_configuration(&config.paths);
    assert_eq!(
        kubelet_config["containerRuntimeEndpoint"],
        format!("unix://{}", socket)
    );
}
