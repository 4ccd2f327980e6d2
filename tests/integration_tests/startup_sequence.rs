//! Orchestrator sequencing with in-process services and a recording cluster

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use edgekube::addons::ManifestAddon;
use edgekube::kube_client::ClusterApplier;
use edgekube::orchestrator::{
    AddonDeployer, Orchestrator, OrchestratorState, RunOutcome, Service, ServiceDescriptor,
    StatusHandle,
};
use edgekube::readiness::{ReadinessNotifier, ReadinessState};
use edgekube::{Error, Result};

type Journal = Arc<Mutex<Vec<String>>>;

/// Becomes ready after `delay`, then runs until cancelled
struct FakeComponent {
    name: &'static str,
    delay: Duration,
    fail_startup: bool,
    journal: Journal,
}

#[async_trait]
impl Service for FakeComponent {
    async fn run(&self, cancel: CancellationToken, ready: ReadinessNotifier) -> Result<()> {
        self.journal.lock().unwrap().push(format!("start {}", self.name));
        tokio::select! {
            _ = tokio::time::sleep(self.delay) => {}
            _ = cancel.cancelled() => return Ok(()),
        }
        if self.fail_startup {
            return Err(Error::health(format!("{} never became healthy", self.name)));
        }
        ready.ready();
        cancel.cancelled().await;
        self.journal.lock().unwrap().push(format!("stop {}", self.name));
        Ok(())
    }
}

/// Applier recording the kind and name of every applied object
#[derive(Default)]
struct RecordingCluster {
    applied: Mutex<Vec<String>>,
}

#[async_trait]
impl ClusterApplier for RecordingCluster {
    async fn apply(&self, manifest: &Value) -> Result<()> {
        let kind = manifest["kind"].as_str().unwrap_or_default();
        let name = manifest["metadata"]["name"].as_str().unwrap_or_default();
        self.applied.lock().unwrap().push(format!("{}/{}", kind, name));
        Ok(())
    }
}

const CHAIN: [&str; 6] = [
    "containerd",
    "kine",
    "apiserver",
    "controller-manager",
    "kubelet",
    "kube-proxy",
];

fn chain(journal: &Journal, failing: Option<&'static str>) -> Vec<ServiceDescriptor> {
    CHAIN
        .into_iter()
        .map(|name| {
            ServiceDescriptor::new(
                name,
                FakeComponent {
                    name,
                    delay: Duration::from_millis(5),
                    fail_startup: failing == Some(name),
                    journal: journal.clone(),
                },
            )
        })
        .collect()
}

async fn wait_for_state(status: &StatusHandle, want: OrchestratorState) {
    for _ in 0..500 {
        if status.state() == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("orchestrator never reached {:?}", want);
}

/// Story: the whole chain comes up in order, add-ons land, shutdown is clean
#[tokio::test]
async fn story_full_chain_reaches_steady_state() {
    let journal = Journal::default();
    let cluster = Arc::new(RecordingCluster::default());
    let cancel = CancellationToken::new();

    let coredns: Arc<dyn AddonDeployer> = Arc::new(ManifestAddon::new(
        "coredns",
        edgekube::addons::coredns::manifests().unwrap(),
        cluster.clone(),
    ));
    let orchestrator = Orchestrator::new(chain(&journal, None), cancel.clone())
        .with_addons(vec![coredns])
        .with_addon_timing(Duration::from_millis(1), Duration::from_secs(5))
        .with_signal_handling(false);
    let status = orchestrator.status();

    let run = tokio::spawn(orchestrator.run());
    wait_for_state(&status, OrchestratorState::Steady).await;

    assert!(status
        .services()
        .iter()
        .all(|(_, state)| *state == ReadinessState::Ready));
    let applied = cluster.applied.lock().unwrap().clone();
    assert!(applied.contains(&"Service/kube-dns".to_string()));
    assert!(applied.contains(&"Deployment/coredns".to_string()));

    cancel.cancel();
    let outcome = run.await.unwrap().unwrap();
    assert_eq!(outcome, RunOutcome::Stopped);

    let journal = journal.lock().unwrap().clone();
    let starts: Vec<_> = journal
        .iter()
        .filter_map(|e| e.strip_prefix("start "))
        .collect();
    assert_eq!(starts, CHAIN.to_vec());
    assert_eq!(journal.iter().filter(|e| e.starts_with("stop ")).count(), 6);
}

/// Story: a component that never gets healthy stops the chain right there
#[tokio::test]
async fn story_failed_startup_halts_the_chain() {
    let journal = Journal::default();
    let cancel = CancellationToken::new();

    let outcome = Orchestrator::new(chain(&journal, Some("apiserver")), cancel.clone())
        .with_signal_handling(false)
        .run()
        .await
        .unwrap();

    assert!(!outcome.is_success());
    match outcome {
        RunOutcome::Aborted { service, reason } => {
            assert_eq!(service, "apiserver");
            assert!(reason.contains("never became healthy"));
        }
        other => panic!("expected Aborted, got {:?}", other),
    }

    let journal = journal.lock().unwrap().clone();
    assert!(!journal.iter().any(|e| e == "start controller-manager"));
    assert!(journal.contains(&"stop kine".to_string()));
    assert!(cancel.is_cancelled());
}

/// Story: shutdown requested mid-startup starts nothing further
#[tokio::test]
async fn story_shutdown_during_startup() {
    let journal = Journal::default();
    let cancel = CancellationToken::new();

    let mut services = chain(&journal, None);
    services[2] = ServiceDescriptor::new(
        "apiserver",
        FakeComponent {
            name: "apiserver",
            delay: Duration::from_secs(60),
            fail_startup: false,
            journal: journal.clone(),
        },
    );
    let orchestrator = Orchestrator::new(services, cancel.clone()).with_signal_handling(false);
    let status = orchestrator.status();
    let run = tokio::spawn(orchestrator.run());

    wait_for_state(&status, OrchestratorState::Sequencing("apiserver")).await;
    cancel.cancel();

    let outcome = run.await.unwrap().unwrap();
    assert_eq!(outcome, RunOutcome::Cancelled { service: "apiserver" });
    assert!(outcome.is_success());
    assert!(!journal
        .lock()
        .unwrap()
        .iter()
        .any(|e| e == "start controller-manager"));
}
