//! Readiness waiter: one task per resource node.
//!
//! Each node publishes its state through its own `watch` channel; only the
//! node's task writes to it. A node task first waits for every dependency to
//! settle, fails with `DependencyFailed` as soon as one of them fails, and
//! otherwise provisions the node under its own deadline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use orchard_core::{FailureReason, NodeState, ResourceDecl};

use crate::binder::Binder;
use crate::binding::Facts;
use crate::error::{BootstrapError, BootstrapResult};
use crate::graph::DependencyGraph;
use crate::provision::{ProvisionRequest, Provisioner};

/// What a node task publishes.
#[derive(Debug, Clone)]
pub enum Signal {
    Declared,
    Starting,
    Ready(Arc<Facts>),
    Failed(FailureReason),
}

impl Signal {
    pub fn is_settled(&self) -> bool {
        matches!(self, Signal::Ready(_) | Signal::Failed(_))
    }

    pub fn state(&self) -> NodeState {
        match self {
            Signal::Declared => NodeState::Declared,
            Signal::Starting => NodeState::Starting,
            Signal::Ready(_) => NodeState::Ready,
            Signal::Failed(reason) => NodeState::Failed {
                reason: reason.clone(),
            },
        }
    }
}

/// Result of waiting on one node.
#[derive(Debug, Clone)]
pub enum WaitOutcome {
    Ready(Arc<Facts>),
    Failed(FailureReason),
    TimedOut,
}

impl WaitOutcome {
    fn from_signal(signal: Signal) -> Self {
        match signal {
            Signal::Ready(facts) => WaitOutcome::Ready(facts),
            Signal::Failed(FailureReason::TimedOut) => WaitOutcome::TimedOut,
            Signal::Failed(reason) => WaitOutcome::Failed(reason),
            // Only reachable if the node task vanished without settling.
            Signal::Declared | Signal::Starting => WaitOutcome::Failed(FailureReason::Cancelled),
        }
    }
}

/// Collaborators shared by every node task.
pub struct WaiterContext {
    pub provisioner: Arc<dyn Provisioner>,
    pub binder: Arc<Binder>,
    /// Deadline for nodes that declare no `timeout`.
    pub default_timeout: Duration,
}

/// Running readiness tasks of one orchestration run.
///
/// Dropping the waiter aborts every task still in flight.
pub struct ReadinessWaiter {
    signals: HashMap<String, watch::Receiver<Signal>>,
    tasks: JoinSet<()>,
}

impl ReadinessWaiter {
    /// Spawn one task per node. Must be called inside a tokio runtime.
    pub fn start(
        graph: &DependencyGraph,
        ctx: WaiterContext,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let ctx = Arc::new(ctx);

        let mut senders = HashMap::with_capacity(graph.len());
        let mut signals = HashMap::with_capacity(graph.len());
        for decl in graph.order() {
            let (tx, rx) = watch::channel(Signal::Declared);
            senders.insert(decl.name.clone(), tx);
            signals.insert(decl.name.clone(), rx);
        }

        let mut tasks = JoinSet::new();
        for decl in graph.order() {
            let Some(tx) = senders.remove(&decl.name) else {
                continue;
            };
            let deps: Vec<(String, watch::Receiver<Signal>)> = graph
                .direct_dependencies(&decl.name)
                .into_iter()
                .filter_map(|d| signals.get(d).map(|rx| (d.to_string(), rx.clone())))
                .collect();
            let parent = decl.kind.parent_kind().and_then(|kind| {
                graph
                    .direct_dependencies(&decl.name)
                    .into_iter()
                    .find(|d| graph.node(d).is_some_and(|n| n.kind == kind))
                    .map(str::to_string)
            });

            tasks.spawn(run_node(
                decl.clone(),
                parent,
                deps,
                tx,
                ctx.clone(),
                shutdown.clone(),
            ));
        }

        Self { signals, tasks }
    }

    /// Current state of a node.
    pub fn state(&self, name: &str) -> Option<NodeState> {
        self.signals.get(name).map(|rx| rx.borrow().state())
    }

    /// Watch a node's state changes.
    pub fn subscribe(&self, name: &str) -> Option<watch::Receiver<Signal>> {
        self.signals.get(name).cloned()
    }

    /// Suspend until the node is ready, failed or timed out.
    pub async fn wait_ready(&self, name: &str) -> BootstrapResult<WaitOutcome> {
        let mut rx = self
            .signals
            .get(name)
            .cloned()
            .ok_or_else(|| BootstrapError::UnknownNode(name.to_string()))?;
        Ok(WaitOutcome::from_signal(settled(&mut rx).await))
    }

    /// Wait for every node task to finish.
    pub async fn join(&mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    warn!(error = %e, "readiness task panicked");
                }
            }
        }
    }
}

async fn settled(rx: &mut watch::Receiver<Signal>) -> Signal {
    match rx.wait_for(Signal::is_settled).await {
        Ok(signal) => signal.clone(),
        Err(_) => Signal::Failed(FailureReason::Cancelled),
    }
}

async fn run_node(
    decl: ResourceDecl,
    parent: Option<String>,
    deps: Vec<(String, watch::Receiver<Signal>)>,
    tx: watch::Sender<Signal>,
    ctx: Arc<WaiterContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    let outcome = tokio::select! {
        outcome = drive(&decl, parent, deps, &tx, &ctx) => outcome,
        _ = cancelled(&mut shutdown) => {
            debug!(node = %decl.name, "readiness wait cancelled");
            Signal::Failed(FailureReason::Cancelled)
        }
    };
    tx.send_replace(outcome);
}

async fn drive(
    decl: &ResourceDecl,
    parent: Option<String>,
    deps: Vec<(String, watch::Receiver<Signal>)>,
    tx: &watch::Sender<Signal>,
    ctx: &WaiterContext,
) -> Signal {
    let dep_facts = match gate(deps).await {
        Ok(facts) => facts,
        Err(reason) => {
            warn!(node = %decl.name, %reason, "not starting");
            return Signal::Failed(reason);
        }
    };

    tx.send_replace(Signal::Starting);
    let started = Instant::now();
    info!(node = %decl.name, kind = %decl.kind, "starting resource");

    let parent_facts = parent
        .as_deref()
        .and_then(|p| dep_facts.get(p))
        .map(|f| f.as_ref());
    let facts = match ctx
        .binder
        .resolve_identity(decl)
        .and_then(|identity| ctx.binder.facts(decl, identity.as_ref(), parent_facts))
    {
        Ok(facts) => facts,
        Err(e) => {
            warn!(node = %decl.name, error = %e, "could not resolve resource facts");
            return Signal::Failed(FailureReason::Probe {
                message: e.to_string(),
            });
        }
    };

    let deadline = decl.timeout_or(ctx.default_timeout);
    let request = ProvisionRequest {
        decl,
        facts: &facts,
    };
    let result = tokio::time::timeout(deadline, ctx.provisioner.provision(request)).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(Ok(())) => {
            info!(node = %decl.name, elapsed_ms, "resource ready");
            Signal::Ready(Arc::new(facts))
        }
        Ok(Err(failure)) => {
            warn!(node = %decl.name, elapsed_ms, error = %failure, "resource failed readiness");
            Signal::Failed(FailureReason::Probe { message: failure.0 })
        }
        Err(_) => {
            warn!(
                node = %decl.name,
                timeout_ms = deadline.as_millis() as u64,
                "resource readiness timed out"
            );
            Signal::Failed(FailureReason::TimedOut)
        }
    }
}

/// Wait for every dependency to be ready, failing on the first that is not.
async fn gate(
    deps: Vec<(String, watch::Receiver<Signal>)>,
) -> Result<HashMap<String, Arc<Facts>>, FailureReason> {
    let mut waits = JoinSet::new();
    for (name, mut rx) in deps {
        waits.spawn(async move {
            let signal = settled(&mut rx).await;
            (name, signal)
        });
    }

    let mut ready = HashMap::new();
    while let Some(joined) = waits.join_next().await {
        let (name, signal) = joined.map_err(|_| FailureReason::Cancelled)?;
        match signal {
            Signal::Ready(facts) => {
                ready.insert(name, facts);
            }
            Signal::Failed(reason) => return Err(propagate(name, reason)),
            Signal::Declared | Signal::Starting => return Err(FailureReason::Cancelled),
        }
    }
    Ok(ready)
}

/// Failure of a dependent: always names the root failing node.
fn propagate(dependency: String, reason: FailureReason) -> FailureReason {
    match reason {
        FailureReason::DependencyFailed { dependency: root } => {
            FailureReason::DependencyFailed { dependency: root }
        }
        FailureReason::Cancelled => FailureReason::Cancelled,
        FailureReason::Probe { .. } | FailureReason::TimedOut => {
            FailureReason::DependencyFailed { dependency }
        }
    }
}

/// Resolves once shutdown is requested; never if the sender is gone.
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn propagation_names_the_root() {
        assert_eq!(
            propagate("engine".into(), FailureReason::TimedOut),
            FailureReason::DependencyFailed {
                dependency: "engine".into()
            }
        );
        assert_eq!(
            propagate(
                "db".into(),
                FailureReason::DependencyFailed {
                    dependency: "engine".into()
                }
            ),
            FailureReason::DependencyFailed {
                dependency: "engine".into()
            }
        );
        assert_eq!(
            propagate("db".into(), FailureReason::Cancelled),
            FailureReason::Cancelled
        );
    }

    #[test]
    fn timed_out_signal_maps_to_outcome() {
        assert!(matches!(
            WaitOutcome::from_signal(Signal::Failed(FailureReason::TimedOut)),
            WaitOutcome::TimedOut
        ));
        assert!(matches!(
            WaitOutcome::from_signal(Signal::Starting),
            WaitOutcome::Failed(FailureReason::Cancelled)
        ));
    }

    #[tokio::test]
    async fn gate_without_dependencies_is_open() {
        assert!(gate(Vec::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn gate_fails_on_first_failed_dependency() {
        let (_slow_tx, slow_rx) = watch::channel(Signal::Starting);
        let (failed_tx, failed_rx) = watch::channel(Signal::Declared);
        failed_tx.send_replace(Signal::Failed(FailureReason::Probe {
            message: "refused".into(),
        }));

        let result = gate(vec![
            ("slow".to_string(), slow_rx),
            ("broken".to_string(), failed_rx),
        ])
        .await;
        assert_eq!(
            result.unwrap_err(),
            FailureReason::DependencyFailed {
                dependency: "broken".into()
            }
        );
    }

    #[tokio::test]
    async fn cancelled_fires_on_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), cancelled(&mut rx))
            .await
            .unwrap();
    }
}
