use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitCode, ExitStatus};
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};

use orchard_bootstrap::{
    parameter_env_var, Binder, DependencyGraph, FeatureFlags, Launcher, Orchestrator,
    ProcessProvisioner,
};
use orchard_core::{HostConfig, ResourceKind, TenantId};
use orchard_state::StateStore;

use crate::exit;

pub async fn run(
    config_path: &Path,
    state_dir: Option<PathBuf>,
    params: Vec<(String, String)>,
) -> anyhow::Result<ExitCode> {
    let config = super::load_config(config_path, state_dir)?;
    let graph = DependencyGraph::build(&config.resources)?;
    info!(order = ?graph.order_names(), "startup order");

    // ── Bootstrap ──────────────────────────────────────────────

    let db_path = config.bootstrap.bootstrap_db_path();
    let identities = StateStore::open(&db_path)
        .with_context(|| format!("opening state store {}", db_path.display()))?;
    info!(path = ?db_path, "state store opened");

    let binder = Arc::new(Binder::new(identities).with_parameters(parameter_values(&config, params)));
    let provisioner = Arc::new(ProcessProvisioner::new(config.bootstrap.probe_interval()));
    let orchestrator = Orchestrator::new(graph, provisioner.clone(), binder)
        .with_default_timeout(config.bootstrap.readiness_timeout());

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let report = orchestrator.run(shutdown_rx.clone()).await?;
    provision_tenants(&config)?;

    // ── Launch ─────────────────────────────────────────────────

    let config_file = std::path::absolute(config_path).unwrap_or_else(|_| config_path.to_path_buf());
    let launcher = Launcher::new(config.app.clone())
        .with_env("ORCHARD_CONFIG", config_file.display().to_string());
    let flags: FeatureFlags = config.app.features.iter().cloned().collect();
    let mut app = launcher.launch(&report.bindings, &flags, &config.app.startup_actions)?;

    let status = tokio::select! {
        status = app.wait() => status?,
        _ = shutdown_requested(&mut shutdown_rx) => {
            info!("stopping application");
            app.terminate()?;
            app.wait().await?
        }
    };
    info!(%status, resources = provisioner.owned_processes(), "application exited");
    Ok(ExitCode::from(passthrough_code(status)))
}

/// Parameter values from `--param`, falling back to `ORCHARD_PARAMETER_*`.
fn parameter_values(config: &HostConfig, params: Vec<(String, String)>) -> HashMap<String, String> {
    let mut cli: HashMap<String, String> = params.into_iter().collect();
    let mut values = HashMap::new();
    for decl in config.resources.iter().filter(|r| r.kind == ResourceKind::Parameter) {
        let value = cli
            .remove(&decl.name)
            .or_else(|| std::env::var(parameter_env_var(&decl.name)).ok());
        if let Some(value) = value {
            values.insert(decl.name.clone(), value);
        }
    }
    for name in cli.keys() {
        warn!(param = %name, "ignoring value for undeclared parameter");
    }
    values
}

/// Create missing tenant records before the application can migrate them.
///
/// The tenant store is closed again before launch so the application can
/// open it through `orchard-host migrate`.
fn provision_tenants(config: &HostConfig) -> anyhow::Result<()> {
    if config.tenants.is_empty() {
        return Ok(());
    }
    let path = config.bootstrap.tenants_db_path();
    let store = StateStore::open(&path)
        .with_context(|| format!("opening tenant store {}", path.display()))?;
    for tenant in &config.tenants {
        let record = store
            .provision_tenant(&TenantId::new(tenant.name.as_str()), &tenant.recipe)
            .with_context(|| format!("provisioning tenant {}", tenant.name))?;
        info!(
            tenant = %record.tenant_id,
            recipe = %record.recipe_name,
            version = record.applied_version,
            "tenant provisioned"
        );
    }
    Ok(())
}

async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// The application's exit code, or 128 + signal when it was killed.
fn passthrough_code(status: ExitStatus) -> u8 {
    if let Some(code) = status.code() {
        return code as u8;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128u8.wrapping_add(signal as u8);
        }
    }
    exit::FAILURE
}
