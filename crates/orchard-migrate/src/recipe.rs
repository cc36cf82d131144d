//! Recipes and the boundary that executes them.

use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use orchard_core::TenantId;

use crate::error::{MigrationError, MigrationResult};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A recipe file, opaque except for its digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipe {
    pub name: String,
    pub path: PathBuf,
    /// Hex sha256 of the file content.
    pub digest: String,
}

impl Recipe {
    /// Load `name` from `recipes_dir`. Names are plain relative paths.
    pub fn load(recipes_dir: &Path, name: &str) -> MigrationResult<Self> {
        let relative = Path::new(name);
        let plain = !name.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !plain {
            return Err(MigrationError::RecipeNotFound(name.to_string()));
        }

        let path = recipes_dir.join(relative);
        if !path.is_file() {
            return Err(MigrationError::RecipeNotFound(name.to_string()));
        }
        let bytes = std::fs::read(&path).map_err(|source| MigrationError::RecipeRead {
            path: path.clone(),
            source,
        })?;

        Ok(Self {
            name: name.to_string(),
            path,
            digest: sha256_hex(&bytes),
        })
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Why a recipe run failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct RecipeError(pub String);

impl RecipeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub trait RecipeRunner: Send + Sync {
    fn run<'a>(
        &'a self,
        tenant: &'a TenantId,
        recipe: &'a Recipe,
    ) -> BoxFuture<'a, Result<(), RecipeError>>;
}

/// Runs `argv... --tenant <id> --recipe <path>` and waits for exit 0.
pub struct CommandRecipeRunner {
    argv: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandRecipeRunner {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            working_dir: None,
        }
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    async fn execute(&self, tenant: &TenantId, recipe: &Recipe) -> Result<(), RecipeError> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| RecipeError::new("no recipe runner command configured"))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .arg("--tenant")
            .arg(tenant.as_str())
            .arg("--recipe")
            .arg(&recipe.path)
            .env("ORCHARD_TENANT", tenant.as_str())
            .env("ORCHARD_RECIPE_DIGEST", &recipe.digest)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        debug!(tenant = %tenant, recipe = %recipe.name, program = %program, "running recipe command");
        let output = command
            .output()
            .await
            .map_err(|e| RecipeError::new(format!("failed to run '{program}': {e}")))?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        let mut message = format!("'{program}' exited with {}", output.status);
        if !stderr.is_empty() {
            let tail: String = stderr
                .chars()
                .rev()
                .take(400)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            message.push_str(": ");
            message.push_str(&tail);
        }
        Err(RecipeError(message))
    }
}

impl RecipeRunner for CommandRecipeRunner {
    fn run<'a>(
        &'a self,
        tenant: &'a TenantId,
        recipe: &'a Recipe,
    ) -> BoxFuture<'a, Result<(), RecipeError>> {
        Box::pin(self.execute(tenant, recipe))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn recipes_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("import.json"), br#"{"steps":[]}"#).unwrap();
        dir
    }

    #[test]
    fn load_computes_digest() {
        let dir = recipes_dir();
        let recipe = Recipe::load(dir.path(), "import.json").unwrap();
        assert_eq!(recipe.name, "import.json");
        assert_eq!(recipe.digest, sha256_hex(br#"{"steps":[]}"#));
        assert_eq!(recipe.digest.len(), 64);
    }

    #[test]
    fn sha256_of_empty_input() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn missing_or_escaping_names_are_not_found() {
        let dir = recipes_dir();
        for name in ["missing.json", "../import.json", "/etc/passwd", ""] {
            assert!(
                matches!(
                    Recipe::load(dir.path(), name),
                    Err(MigrationError::RecipeNotFound(_))
                ),
                "{name} should not load"
            );
        }
    }

    #[tokio::test]
    async fn empty_runner_command_fails() {
        let dir = recipes_dir();
        let recipe = Recipe::load(dir.path(), "import.json").unwrap();
        let err = CommandRecipeRunner::new(Vec::new())
            .run(&TenantId::new("Default"), &recipe)
            .await
            .unwrap_err();
        assert!(err.0.contains("no recipe runner"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_receives_tenant_and_recipe() {
        let dir = recipes_dir();
        let recipe = Recipe::load(dir.path(), "import.json").unwrap();
        let runner = CommandRecipeRunner::new(vec![
            "sh".into(),
            "-c".into(),
            r#"test "$1" = --tenant && test "$2" = T1 && test -f "$4" && test -n "$ORCHARD_RECIPE_DIGEST""#
                .into(),
            "recipe-check".into(),
        ]);
        runner.run(&TenantId::new("T1"), &recipe).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_reports_stderr() {
        let dir = recipes_dir();
        let recipe = Recipe::load(dir.path(), "import.json").unwrap();
        let runner = CommandRecipeRunner::new(vec![
            "sh".into(),
            "-c".into(),
            "echo 'duplicate content type' >&2; exit 3".into(),
            "recipe-fail".into(),
        ]);
        let err = runner.run(&TenantId::new("T1"), &recipe).await.unwrap_err();
        assert!(err.0.contains("duplicate content type"), "{err}");
    }
}
