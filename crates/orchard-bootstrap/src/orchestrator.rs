//! One orchestration run: readiness of every node, then bindings.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{info, warn};

use orchard_core::{FailureReason, NodeState, ResourceDecl};

use crate::binder::Binder;
use crate::binding::BindingSet;
use crate::error::{BootstrapError, BootstrapResult};
use crate::graph::DependencyGraph;
use crate::provision::Provisioner;
use crate::waiter::{ReadinessWaiter, WaitOutcome, WaiterContext};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Outcome of a successful run.
#[derive(Debug)]
pub struct RunReport {
    /// Node names in topological order.
    pub order: Vec<String>,
    pub states: BTreeMap<String, NodeState>,
    pub bindings: BindingSet,
}

pub struct Orchestrator {
    graph: DependencyGraph,
    provisioner: Arc<dyn Provisioner>,
    binder: Arc<Binder>,
    default_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        graph: DependencyGraph,
        provisioner: Arc<dyn Provisioner>,
        binder: Arc<Binder>,
    ) -> Self {
        Self {
            graph,
            provisioner,
            binder,
            default_timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Deadline for nodes that declare no `timeout`.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Bring every node to a settled state and bind the ready ones.
    ///
    /// Unrelated branches keep going after a failure; the run then reports
    /// the first node in topological order that failed on its own account.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> BootstrapResult<RunReport> {
        let started = Instant::now();
        info!(nodes = self.graph.len(), "orchestration starting");

        let mut waiter = ReadinessWaiter::start(
            &self.graph,
            WaiterContext {
                provisioner: self.provisioner.clone(),
                binder: self.binder.clone(),
                default_timeout: self.default_timeout,
            },
            shutdown,
        );

        let mut outcomes = Vec::with_capacity(self.graph.len());
        for decl in self.graph.order() {
            let outcome = waiter.wait_ready(&decl.name).await?;
            outcomes.push((decl, outcome));
        }
        waiter.join().await;

        let states: BTreeMap<String, NodeState> = outcomes
            .iter()
            .map(|(decl, outcome)| (decl.name.clone(), state_of(outcome)))
            .collect();
        let order: Vec<String> = outcomes.iter().map(|(d, _)| d.name.clone()).collect();

        if let Some(error) = terminal_error(&outcomes) {
            warn!(
                error = %error,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "orchestration failed"
            );
            return Err(error);
        }

        let mut bindings = BindingSet::new();
        for (decl, outcome) in &outcomes {
            if let WaitOutcome::Ready(facts) = outcome {
                let node = self.binder.bind(decl, &NodeState::Ready, facts)?;
                bindings.absorb(node)?;
            }
        }

        info!(
            nodes = order.len(),
            bindings = bindings.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "all resources ready"
        );
        Ok(RunReport {
            order,
            states,
            bindings,
        })
    }
}

fn failure_of(outcome: &WaitOutcome) -> Option<FailureReason> {
    match outcome {
        WaitOutcome::Ready(_) => None,
        WaitOutcome::TimedOut => Some(FailureReason::TimedOut),
        WaitOutcome::Failed(reason) => Some(reason.clone()),
    }
}

fn state_of(outcome: &WaitOutcome) -> NodeState {
    match failure_of(outcome) {
        None => NodeState::Ready,
        Some(reason) => NodeState::Failed { reason },
    }
}

/// The single error a failed run reports: cancellation if shutdown was
/// requested, else the first root failure in topological order.
fn terminal_error(outcomes: &[(&ResourceDecl, WaitOutcome)]) -> Option<BootstrapError> {
    let cancelled = outcomes
        .iter()
        .any(|(_, outcome)| matches!(outcome, WaitOutcome::Failed(FailureReason::Cancelled)));
    if cancelled {
        return Some(BootstrapError::Cancelled);
    }

    let root = outcomes.iter().find_map(|(decl, outcome)| {
        let reason = failure_of(outcome).filter(FailureReason::is_root)?;
        Some(match reason {
            FailureReason::Probe { message } => BootstrapError::ReadinessFailed {
                node: decl.name.clone(),
                reason: message,
            },
            _ => BootstrapError::TimedOut {
                node: decl.name.clone(),
            },
        })
    });
    if root.is_some() {
        return root;
    }

    outcomes.iter().find_map(|(decl, outcome)| match outcome {
        WaitOutcome::Failed(FailureReason::DependencyFailed { dependency }) => {
            Some(BootstrapError::DependencyFailed {
                node: decl.name.clone(),
                dependency: dependency.clone(),
            })
        }
        _ => None,
    })
}
