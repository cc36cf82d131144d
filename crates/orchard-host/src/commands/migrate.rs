use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::bail;
use tracing::info;

use orchard_core::{HostConfig, TenantId};
use orchard_migrate::{CommandRecipeRunner, MigrationExecutor, MigrationOutcome, Recipe, TenantStore};

pub async fn migrate(
    config_path: &Path,
    tenant: &str,
    recipe: Option<&str>,
    state_dir: Option<PathBuf>,
) -> anyhow::Result<ExitCode> {
    let config = super::load_config(config_path, state_dir)?;
    let recipe_name = recipe_for(&config, tenant, recipe)?;
    let recipe = Recipe::load(&config.migrations.recipes_dir, &recipe_name)?;

    // Opened per record operation, so other tenants' migrations and the
    // host can use the file while this recipe runs.
    let store = TenantStore::file(
        config.bootstrap.tenants_db_path(),
        config.migrations.lock_timeout(),
    );

    let mut runner = CommandRecipeRunner::new(config.migrations.runner.clone());
    if let Some(dir) = &config.app.working_dir {
        runner = runner.working_dir(dir);
    }
    let executor = MigrationExecutor::new(store, Arc::new(runner));

    let tenant = TenantId::new(tenant);
    info!(tenant = %tenant, recipe = %recipe.name, digest = %recipe.digest, "migrating tenant");
    match executor.run(&tenant, &recipe).await? {
        MigrationOutcome::Applied(record) => println!(
            "Applied {} to tenant {} (version {}, attempt {})",
            record.recipe_name, record.tenant_id, record.applied_version, record.attempts
        ),
        MigrationOutcome::AlreadyApplied(record) => println!(
            "Tenant {} already migrated with {} (version {})",
            record.tenant_id, record.recipe_name, record.applied_version
        ),
    }
    Ok(ExitCode::SUCCESS)
}

/// The explicit `--recipe`, else the one configured for the tenant.
fn recipe_for(config: &HostConfig, tenant: &str, recipe: Option<&str>) -> anyhow::Result<String> {
    if let Some(recipe) = recipe {
        return Ok(recipe.to_string());
    }
    match config.tenants.iter().find(|t| t.name == tenant) {
        Some(t) => Ok(t.recipe.clone()),
        None => bail!("tenant '{tenant}' is not declared in [[tenants]]; pass --recipe"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipe_defaults_to_tenant_config() {
        let config = HostConfig::parse(
            r#"
[app]
command = ["orchard-app"]

[[tenants]]
name = "Default"
recipe = "import.json"
"#,
        )
        .unwrap();
        assert_eq!(recipe_for(&config, "Default", None).unwrap(), "import.json");
        assert_eq!(recipe_for(&config, "Default", Some("blog.json")).unwrap(), "blog.json");
        assert!(recipe_for(&config, "Blog", None).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn overlapping_invocations_both_migrate() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("recipes")).unwrap();
        std::fs::write(dir.path().join("recipes").join("import.json"), "{}").unwrap();
        let config_path = dir.path().join("orchard.toml");
        std::fs::write(
            &config_path,
            r#"
[app]
command = ["orchard-app"]

[migrations]
runner = ["sh", "-c", "sleep 0.3", "recipe-runner"]

[[tenants]]
name = "Default"
recipe = "import.json"

[[tenants]]
name = "Blog"
recipe = "import.json"
"#,
        )
        .unwrap();

        let (a, b) = tokio::join!(
            migrate(&config_path, "Default", None, None),
            migrate(&config_path, "Blog", None, None),
        );
        a.unwrap();
        b.unwrap();
        // A later start finds both tenants migrated.
        migrate(&config_path, "Default", None, None).await.unwrap();

        let store =
            orchard_state::StateStore::open(&dir.path().join(".orchard").join("tenants.redb"))
                .unwrap();
        let records = store.list_migrations().unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.is_applied() && r.attempts == 1));
    }
}
