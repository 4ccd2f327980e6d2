//! Startup orchestrator
//!
//! Starts a fixed chain of services one at a time. Service N+1 is never started
//! before service N has signalled readiness; the first service that fails, or a
//! cancellation of the shared scope, halts the chain with nothing after it started.
//!
//! # Lifecycle
//!
//! ```text
//! Idle -> Sequencing(svc) -> ... -> PostSequence -> Steady -> ShuttingDown
//!              |                         |
//!              +--------- cancel / failure ---------> ShuttingDown
//! ```
//!
//! Services receive the shared [`CancellationToken`] and stop themselves when it
//! fires. A service that fails after it became ready cancels the scope, so the
//! whole node goes down with it.

mod bootstrap;

pub use bootstrap::bootstrap;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::readiness::{self, ReadinessNotifier, ReadinessState, ReadinessWaiter};
use crate::{Error, Result};

/// A long-running component the orchestrator can start
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Service: Send + Sync {
    /// Start the component and run until it stops
    ///
    /// Implementations fire `ready` once the component is serving, then return
    /// `Ok` when `cancel` fires and they have shut down, or `Err` when the
    /// component fails. Returning `Err` before firing `ready` fails the signal.
    async fn run(&self, cancel: CancellationToken, ready: ReadinessNotifier) -> Result<()>;
}

/// Declarative resources deployed once the whole chain is ready
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AddonDeployer: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Create or update the add-on's objects in the cluster
    async fn deploy(&self) -> Result<()>;
}

/// One entry of the sequencing chain
pub struct ServiceDescriptor {
    name: &'static str,
    service: Arc<dyn Service>,
    notifier: ReadinessNotifier,
    waiter: ReadinessWaiter,
}

impl ServiceDescriptor {
    /// Wrap `service` with a fresh readiness signal
    pub fn new(name: &'static str, service: impl Service + 'static) -> Self {
        let (notifier, waiter) = readiness::signal();
        Self {
            name,
            service: Arc::new(service),
            notifier,
            waiter,
        }
    }

    /// Service name
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Phase of [`Orchestrator::run`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Not started
    Idle,
    /// Waiting for the named service to become ready
    Sequencing(&'static str),
    /// Every service is ready; deploying add-ons
    PostSequence,
    /// Running until the termination signal
    Steady,
    /// The shared scope was cancelled
    ShuttingDown,
}

/// How [`Orchestrator::run`] ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Reached steady state, then shut down on request
    Stopped,
    /// Sequencing halted at `service` because the scope was cancelled
    Cancelled {
        /// Service that was being waited on
        service: &'static str,
    },
    /// Sequencing halted because `service` failed before becoming ready
    Aborted {
        /// Failed service
        service: &'static str,
        /// Failure reason
        reason: String,
    },
    /// A ready service failed later and took the node down
    Failed {
        /// Failed service
        service: &'static str,
        /// Failure reason
        reason: String,
    },
}

impl RunOutcome {
    /// Whether the process should exit successfully
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Stopped | RunOutcome::Cancelled { .. })
    }
}

/// Read-only view of the orchestrator for observers
#[derive(Debug, Clone)]
pub struct StatusHandle {
    state: watch::Receiver<OrchestratorState>,
    services: Vec<(&'static str, ReadinessWaiter)>,
}

impl StatusHandle {
    /// Current phase
    pub fn state(&self) -> OrchestratorState {
        self.state.borrow().clone()
    }

    /// Readiness of every service, in chain order
    pub fn services(&self) -> Vec<(&'static str, ReadinessState)> {
        self.services
            .iter()
            .map(|(name, waiter)| (*name, waiter.state()))
            .collect()
    }
}

struct ServiceFailure {
    service: &'static str,
    reason: String,
}

/// Drives the sequencing chain
pub struct Orchestrator {
    services: Vec<ServiceDescriptor>,
    addons: Vec<Arc<dyn AddonDeployer>>,
    cancel: CancellationToken,
    state: watch::Sender<OrchestratorState>,
    settle_delay: Duration,
    addon_timeout: Duration,
    shutdown_timeout: Duration,
    handle_signals: bool,
}

impl Orchestrator {
    /// Orchestrator for `services` observing `cancel`
    pub fn new(services: Vec<ServiceDescriptor>, cancel: CancellationToken) -> Self {
        let (state, _) = watch::channel(OrchestratorState::Idle);
        Self {
            services,
            addons: Vec::new(),
            cancel,
            state,
            settle_delay: crate::DEFAULT_COMPONENT_SLEEP,
            addon_timeout: crate::DEFAULT_CONTEXT_TIMEOUT,
            shutdown_timeout: crate::process::TERMINATION_GRACE + Duration::from_secs(5),
            handle_signals: true,
        }
    }

    /// Add-ons to deploy once every service is ready, in order
    pub fn with_addons(mut self, addons: Vec<Arc<dyn AddonDeployer>>) -> Self {
        self.addons = addons;
        self
    }

    /// Delay before add-ons are deployed and the bound on each deployment
    pub fn with_addon_timing(mut self, settle_delay: Duration, timeout: Duration) -> Self {
        self.settle_delay = settle_delay;
        self.addon_timeout = timeout;
        self
    }

    /// Whether SIGINT/SIGTERM cancel the shared scope (on by default)
    pub fn with_signal_handling(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    /// Observer for diagnostics
    pub fn status(&self) -> StatusHandle {
        StatusHandle {
            state: self.state.subscribe(),
            services: self
                .services
                .iter()
                .map(|d| (d.name, d.waiter.clone()))
                .collect(),
        }
    }

    fn enter(&self, state: OrchestratorState) {
        debug!(state = ?state, "Orchestrator state change");
        self.state.send_replace(state);
    }

    /// Start the chain and run until shutdown
    ///
    /// A failing add-on is returned as `Err` after the scope has been cancelled
    /// and services have stopped.
    pub async fn run(self) -> Result<RunOutcome> {
        self.enter(OrchestratorState::Idle);
        if self.handle_signals {
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                info!("Termination signal received, shutting down");
                cancel.cancel();
            });
        }

        let mut tasks = JoinSet::new();
        let (failures_tx, mut failures_rx) = mpsc::unbounded_channel();

        let outcome = self.sequence(&mut tasks, &failures_tx, &mut failures_rx).await;
        drop(failures_tx);

        let result = match outcome {
            Some(outcome) => Ok(outcome),
            None => self.post_sequence(&mut failures_rx).await,
        };

        self.enter(OrchestratorState::ShuttingDown);
        self.cancel.cancel();
        self.drain(tasks).await;

        result
    }

    /// Start every service in order; `Some` means the chain was halted
    async fn sequence(
        &self,
        tasks: &mut JoinSet<()>,
        failures: &mpsc::UnboundedSender<ServiceFailure>,
        failed: &mut mpsc::UnboundedReceiver<ServiceFailure>,
    ) -> Option<RunOutcome> {
        for descriptor in &self.services {
            if self.cancel.is_cancelled() {
                warn!(service = descriptor.name, "Cancelled before start, halting sequence");
                return Some(Self::halted(descriptor.name, failed));
            }

            self.enter(OrchestratorState::Sequencing(descriptor.name));
            info!(service = descriptor.name, "Starting service");
            tasks.spawn(supervise(
                descriptor.name,
                descriptor.service.clone(),
                self.cancel.clone(),
                descriptor.notifier.clone(),
                failures.clone(),
            ));

            let mut waiter = descriptor.waiter.clone();
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    warn!(service = descriptor.name, "Cancelled while waiting for readiness");
                    return Some(Self::halted(descriptor.name, failed));
                }
                ready = waiter.wait() => match ready {
                    Ok(()) => info!(service = descriptor.name, "Service ready"),
                    Err(e) => {
                        error!(service = descriptor.name, error = %e, "Service failed to start");
                        return Some(RunOutcome::Aborted {
                            service: descriptor.name,
                            reason: e.to_string(),
                        });
                    }
                },
            }
        }
        None
    }

    async fn post_sequence(
        &self,
        failures: &mut mpsc::UnboundedReceiver<ServiceFailure>,
    ) -> Result<RunOutcome> {
        self.enter(OrchestratorState::PostSequence);
        info!("All services ready");

        if !self.addons.is_empty() {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(self.stopped(failures)),
                _ = tokio::time::sleep(self.settle_delay) => {}
            }
        }

        for addon in &self.addons {
            info!(addon = addon.name(), "Deploying add-on");
            let deployed = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(self.stopped(failures)),
                res = tokio::time::timeout(self.addon_timeout, addon.deploy()) => res,
            };
            match deployed {
                Ok(Ok(())) => info!(addon = addon.name(), "Add-on deployed"),
                Ok(Err(e)) => {
                    error!(addon = addon.name(), error = %e, "Add-on deployment failed");
                    return Err(Error::addon(format!("{}: {}", addon.name(), e)));
                }
                Err(_) => {
                    error!(addon = addon.name(), "Add-on deployment timed out");
                    return Err(Error::addon(format!(
                        "{}: timed out after {:?}",
                        addon.name(),
                        self.addon_timeout
                    )));
                }
            }
        }

        self.enter(OrchestratorState::Steady);
        info!("Node is up");
        self.cancel.cancelled().await;
        Ok(self.stopped(failures))
    }

    /// Sequencing halted at `service`; a crash of an earlier service wins over plain cancellation
    fn halted(
        service: &'static str,
        failures: &mut mpsc::UnboundedReceiver<ServiceFailure>,
    ) -> RunOutcome {
        match failures.try_recv() {
            Ok(failure) => RunOutcome::Failed {
                service: failure.service,
                reason: failure.reason,
            },
            Err(_) => RunOutcome::Cancelled { service },
        }
    }

    fn stopped(&self, failures: &mut mpsc::UnboundedReceiver<ServiceFailure>) -> RunOutcome {
        match failures.try_recv() {
            Ok(failure) => RunOutcome::Failed {
                service: failure.service,
                reason: failure.reason,
            },
            Err(_) => RunOutcome::Stopped,
        }
    }

    async fn drain(&self, mut tasks: JoinSet<()>) {
        let drained = tokio::time::timeout(self.shutdown_timeout, async {
            while let Some(res) = tasks.join_next().await {
                if let Err(e) = res {
                    warn!(error = %e, "Service task panicked");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("Services did not stop in time, abandoning");
            tasks.abort_all();
        }
    }
}

/// Run one service and translate its result into readiness or scope cancellation
async fn supervise(
    name: &'static str,
    service: Arc<dyn Service>,
    cancel: CancellationToken,
    notifier: ReadinessNotifier,
    failures: mpsc::UnboundedSender<ServiceFailure>,
) {
    let result = service.run(cancel.clone(), notifier.clone()).await;
    match result {
        Ok(()) => {
            notifier.fail("stopped before becoming ready");
            debug!(service = name, "Service stopped");
        }
        Err(e) => {
            if notifier.fail(e.to_string()) {
                return;
            }
            if cancel.is_cancelled() {
                debug!(service = name, error = %e, "Service error during shutdown");
                return;
            }
            error!(service = name, error = %e, "Service failed, shutting down");
            let _ = failures.send(ServiceFailure {
                service: name,
                reason: e.to_string(),
            });
            cancel.cancel();
        }
    }
}

/// Resolve on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
