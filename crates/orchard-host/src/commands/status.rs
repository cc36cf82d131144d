use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;

use orchard_state::{ResourceIdentity, StateStore, TenantMigrationRecord};

pub fn status(config_path: &Path, state_dir: Option<PathBuf>) -> anyhow::Result<ExitCode> {
    let config = super::load_config(config_path, state_dir)?;

    let identities = match open_existing(&config.bootstrap.bootstrap_db_path())? {
        Some(store) => store.list_identities()?,
        None => Vec::new(),
    };
    let migrations = match open_existing(&config.bootstrap.tenants_db_path())? {
        Some(store) => store.list_migrations()?,
        None => Vec::new(),
    };

    print!("{}", format_identities(&identities));
    print!("{}", format_migrations(&migrations));
    Ok(ExitCode::SUCCESS)
}

fn open_existing(path: &Path) -> anyhow::Result<Option<StateStore>> {
    if !path.exists() {
        return Ok(None);
    }
    let store = StateStore::open(path)
        .with_context(|| format!("opening {} (is the host running?)", path.display()))?;
    Ok(Some(store))
}

fn format_identities(identities: &[ResourceIdentity]) -> String {
    if identities.is_empty() {
        return "No persisted resource identities.\n".to_string();
    }
    let mut out = String::from("Persistent resources:\n");
    for identity in identities {
        let ports: Vec<String> = identity
            .ports
            .iter()
            .map(|(name, port)| format!("{name}={port}"))
            .collect();
        out.push_str(&format!(
            "  {} [{}] {} {}",
            identity.name,
            identity.kind,
            identity.host,
            ports.join(",")
        ));
        if let Some(user) = &identity.username {
            out.push_str(&format!(" user={user}"));
        }
        if identity.password.is_some() {
            out.push_str(" password=***");
        }
        out.push('\n');
    }
    out
}

fn format_migrations(records: &[TenantMigrationRecord]) -> String {
    if records.is_empty() {
        return "No tenants provisioned.\n".to_string();
    }
    let mut out = String::from("Tenants:\n");
    for record in records {
        let state = if record.is_applied() { "applied" } else { "pending" };
        out.push_str(&format!(
            "  {} {} {} (version {}, attempts {})",
            record.tenant_id, record.recipe_name, state, record.applied_version, record.attempts
        ));
        if let Some(error) = &record.last_error {
            out.push_str(&format!(" last error: {error}"));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchard_core::{ResourceKind, TenantId};

    #[test]
    fn identities_never_show_passwords() {
        let identity = ResourceIdentity {
            name: "mysql".into(),
            kind: ResourceKind::EngineInstance,
            host: "127.0.0.1".into(),
            ports: [("port".to_string(), 3306)].into_iter().collect(),
            username: Some("root".into()),
            password: Some("s3cr3t".into()),
            created_at: 0,
        };
        let text = format_identities(&[identity]);
        assert!(text.contains("mysql [engine-instance] 127.0.0.1 port=3306 user=root password=***"));
        assert!(!text.contains("s3cr3t"));
    }

    #[test]
    fn migrations_show_state() {
        let mut record = TenantMigrationRecord::new(&TenantId::new("T1"), "import.json", 0);
        record.attempts = 1;
        record.last_error = Some("boom".into());
        let text = format_migrations(&[record]);
        assert!(text.contains("T1 import.json pending (version 0, attempts 1) last error: boom"));
    }

    #[test]
    fn missing_stores_are_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(open_existing(&dir.path().join("bootstrap.redb")).unwrap().is_none());
        assert_eq!(format_identities(&[]), "No persisted resource identities.\n");
    }
}
