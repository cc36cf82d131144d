//! Resource provisioning boundary.
//!
//! A [`Provisioner`] brings one resource to the point where it is usable:
//! starting or reaching a process, creating a database or container if
//! missing, or checking that a parameter was supplied. The readiness waiter
//! calls it once per node, after every dependency is ready, and bounds it
//! with the node's deadline.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use orchard_core::{env_segment, Lifetime, ResourceDecl, ResourceKind};

use crate::binding::Facts;
use crate::probe::{http_probe, tcp_probe, ProbeResult, ReadinessTracker};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Why a resource could not be made ready.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ProbeFailure(pub String);

impl ProbeFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// What the provisioner gets to work with for one node.
#[derive(Debug, Clone, Copy)]
pub struct ProvisionRequest<'a> {
    pub decl: &'a ResourceDecl,
    /// Connection facts the node will be bound with once ready.
    pub facts: &'a Facts,
}

pub trait Provisioner: Send + Sync {
    /// Resolve when the resource is ready. Dropping the future abandons
    /// the attempt and releases anything it acquired.
    fn provision<'a>(&'a self, request: ProvisionRequest<'a>)
    -> BoxFuture<'a, Result<(), ProbeFailure>>;
}

/// Child process started for a resource; killed if dropped before release.
struct AcquireGuard {
    child: Option<Child>,
}

impl AcquireGuard {
    fn release(mut self) -> Option<Child> {
        self.child.take()
    }
}

impl Drop for AcquireGuard {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
    }
}

/// Production provisioner: external commands plus TCP/HTTP polling.
pub struct ProcessProvisioner {
    probe_interval: Duration,
    max_interval: Duration,
    connect_timeout: Duration,
    /// Ephemeral resource processes, killed when the provisioner is dropped.
    processes: Mutex<Vec<Child>>,
}

impl ProcessProvisioner {
    pub fn new(probe_interval: Duration) -> Self {
        Self {
            probe_interval,
            max_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
            processes: Mutex::new(Vec::new()),
        }
    }

    /// Number of resource processes this run started and still owns.
    pub fn owned_processes(&self) -> usize {
        self.processes.lock().map(|p| p.len()).unwrap_or(0)
    }

    async fn provision_process(&self, request: ProvisionRequest<'_>) -> Result<(), ProbeFailure> {
        let decl = request.decl;
        let addresses = endpoint_addresses(request.facts);
        if addresses.is_empty() {
            return Err(ProbeFailure::new("no ports to probe"));
        }

        if self.all_reachable(&addresses).await {
            info!(node = %decl.name, "resource already running, reusing it");
            return self.check_health(decl, &addresses[0]).await;
        }

        let mut guard = AcquireGuard { child: None };
        if let Some(start) = &decl.start {
            let mut command = command_for(start, &decl.name, request.facts);
            command
                .stdin(Stdio::null())
                .kill_on_drop(decl.lifetime == Lifetime::Ephemeral);
            let child = command.spawn().map_err(|e| {
                ProbeFailure::new(format!("failed to run start command '{}': {e}", start[0]))
            })?;
            info!(node = %decl.name, pid = child.id(), "resource process started");
            guard.child = Some(child);
        } else {
            debug!(node = %decl.name, "no start command, waiting for an external process");
        }

        let mut tracker = ReadinessTracker::new(self.probe_interval, self.max_interval);
        loop {
            if let Some(child) = guard.child.as_mut() {
                match child.try_wait() {
                    Ok(Some(status)) if !status.success() => {
                        guard.child = None;
                        return Err(ProbeFailure::new(format!(
                            "start command exited with {status}"
                        )));
                    }
                    // A detaching launcher (e.g. `docker run -d`) exits 0 early.
                    Ok(Some(_)) => guard.child = None,
                    Ok(None) => {}
                    Err(e) => return Err(ProbeFailure::new(format!("process check failed: {e}"))),
                }
            }

            let result = if self.all_reachable(&addresses).await {
                ProbeResult::Ready
            } else {
                ProbeResult::Failed
            };
            if tracker.record(result) {
                break;
            }
            debug!(
                node = %decl.name,
                attempts = tracker.attempts(),
                next_ms = tracker.next_interval().as_millis() as u64,
                "resource not reachable yet"
            );
            tokio::time::sleep(tracker.next_interval()).await;
        }

        self.check_health(decl, &addresses[0]).await?;

        if let Some(child) = guard.release() {
            match self.processes.lock() {
                Ok(mut processes) => processes.push(child),
                Err(_) => warn!(node = %decl.name, "process registry poisoned"),
            }
        }
        Ok(())
    }

    async fn all_reachable(&self, addresses: &[String]) -> bool {
        for address in addresses {
            if tcp_probe(address, self.connect_timeout).await != ProbeResult::Ready {
                return false;
            }
        }
        true
    }

    /// Poll the optional HTTP health path until it answers 2xx.
    async fn check_health(&self, decl: &ResourceDecl, address: &str) -> Result<(), ProbeFailure> {
        let Some(path) = decl.health_path.as_deref() else {
            return Ok(());
        };
        let mut tracker = ReadinessTracker::new(self.probe_interval, self.max_interval);
        loop {
            let result = http_probe(address, path, self.connect_timeout).await;
            if tracker.record(result) {
                return Ok(());
            }
            tokio::time::sleep(tracker.next_interval()).await;
        }
    }

    /// Existence check for databases and containers.
    async fn provision_data(&self, request: ProvisionRequest<'_>) -> Result<(), ProbeFailure> {
        let decl = request.decl;
        let Some(ensure) = &decl.ensure else {
            debug!(node = %decl.name, "no ensure command, created on first use");
            return Ok(());
        };

        let output = command_for(ensure, &decl.name, request.facts)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                ProbeFailure::new(format!("failed to run ensure command '{}': {e}", ensure[0]))
            })?;

        if output.status.success() {
            info!(node = %decl.name, "resource ensured");
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(ProbeFailure::new(format!(
                "ensure command exited with {}: {}",
                output.status,
                tail(stderr.trim(), 400)
            )))
        }
    }
}

impl Provisioner for ProcessProvisioner {
    fn provision<'a>(
        &'a self,
        request: ProvisionRequest<'a>,
    ) -> BoxFuture<'a, Result<(), ProbeFailure>> {
        Box::pin(async move {
            match request.decl.kind {
                ResourceKind::EngineInstance | ResourceKind::StorageEmulator => {
                    self.provision_process(request).await
                }
                ResourceKind::LogicalDatabase | ResourceKind::BlobContainer => {
                    self.provision_data(request).await
                }
                ResourceKind::Parameter => check_parameter(request),
            }
        })
    }
}

/// A parameter is ready once a value was supplied.
pub fn check_parameter(request: ProvisionRequest<'_>) -> Result<(), ProbeFailure> {
    if request.facts.contains_key("value") {
        Ok(())
    } else {
        Err(ProbeFailure::new(format!(
            "parameter '{}' was not supplied (use --param {}=... or {})",
            request.decl.name,
            request.decl.name,
            parameter_env_var(&request.decl.name)
        )))
    }
}

/// Environment variable a parameter value can be supplied through.
pub fn parameter_env_var(name: &str) -> String {
    format!("ORCHARD_PARAMETER_{}", env_segment(name))
}

/// `host:port` for every port fact (`port`, `blobPort`, ...).
fn endpoint_addresses(facts: &Facts) -> Vec<String> {
    let Some(host) = facts.get("host") else {
        return Vec::new();
    };
    facts
        .iter()
        .filter(|(name, _)| *name == "port" || name.ends_with("Port"))
        .map(|(_, port)| format!("{}:{}", host.expose(), port.expose()))
        .collect()
}

/// Build a command with the node's facts as `ORCHARD_RESOURCE_*` variables.
fn command_for(argv: &[String], name: &str, facts: &Facts) -> Command {
    let mut command = Command::new(&argv[0]);
    command.args(&argv[1..]);
    command.env("ORCHARD_RESOURCE_NAME", name);
    for (fact, value) in facts {
        command.env(format!("ORCHARD_RESOURCE_{}", env_segment(fact)), value.expose());
    }
    command
}

fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::BindingValue;
    use tokio::net::TcpListener;

    fn facts(pairs: &[(&str, &str)]) -> Facts {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), BindingValue::literal(*v)))
            .collect()
    }

    #[test]
    fn addresses_cover_every_port_fact() {
        let facts = facts(&[
            ("host", "127.0.0.1"),
            ("blobPort", "10000"),
            ("queuePort", "10001"),
            ("accountName", "devstoreaccount1"),
        ]);
        assert_eq!(
            endpoint_addresses(&facts),
            vec!["127.0.0.1:10000", "127.0.0.1:10001"]
        );
    }

    #[test]
    fn parameter_requires_value() {
        let decl = ResourceDecl::new("admin-password", ResourceKind::Parameter);
        let empty = Facts::new();
        let err = check_parameter(ProvisionRequest {
            decl: &decl,
            facts: &empty,
        })
        .unwrap_err();
        assert!(err.0.contains("ORCHARD_PARAMETER_ADMIN_PASSWORD"));

        let supplied = facts(&[("value", "pw")]);
        assert!(check_parameter(ProvisionRequest {
            decl: &decl,
            facts: &supplied,
        })
        .is_ok());
    }

    #[test]
    fn tail_keeps_end() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("abc", 10), "abc");
    }

    #[tokio::test]
    async fn reachable_engine_is_reused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port().to_string();
        let decl = ResourceDecl::new("mysql", ResourceKind::EngineInstance);
        let facts = facts(&[("host", "127.0.0.1"), ("port", port.as_str())]);

        let provisioner = ProcessProvisioner::new(Duration::from_millis(10));
        provisioner
            .provision(ProvisionRequest {
                decl: &decl,
                facts: &facts,
            })
            .await
            .unwrap();
        assert_eq!(provisioner.owned_processes(), 0);
    }

    #[tokio::test]
    async fn data_resource_without_ensure_is_ready() {
        let decl = ResourceDecl::new("ContentDb", ResourceKind::LogicalDatabase);
        let provisioner = ProcessProvisioner::new(Duration::from_millis(10));
        let facts = Facts::new();
        provisioner
            .provision(ProvisionRequest {
                decl: &decl,
                facts: &facts,
            })
            .await
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn ensure_command_sees_facts() {
        let mut decl = ResourceDecl::new("ContentDb", ResourceKind::LogicalDatabase);
        decl.ensure = Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            "test \"$ORCHARD_RESOURCE_DATABASE\" = ContentDb".to_string(),
        ]);
        let provisioner = ProcessProvisioner::new(Duration::from_millis(10));

        let good = facts(&[("database", "ContentDb")]);
        provisioner
            .provision(ProvisionRequest {
                decl: &decl,
                facts: &good,
            })
            .await
            .unwrap();

        let bad = facts(&[("database", "Other")]);
        let err = provisioner
            .provision(ProvisionRequest {
                decl: &decl,
                facts: &bad,
            })
            .await
            .unwrap_err();
        assert!(err.0.contains("ensure command exited"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_start_command_fails_fast() {
        let mut decl = ResourceDecl::new("mysql", ResourceKind::EngineInstance);
        decl.start = Some(vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string()]);
        // Nothing listens on port 1.
        let facts = facts(&[("host", "127.0.0.1"), ("port", "1")]);
        let provisioner = ProcessProvisioner::new(Duration::from_millis(10));

        let err = tokio::time::timeout(
            Duration::from_secs(10),
            provisioner.provision(ProvisionRequest {
                decl: &decl,
                facts: &facts,
            }),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(err.0.contains("start command exited"));
    }
}
