//! Application launcher.
//!
//! Builds the application's environment from the run's bindings, the
//! `[app.env]` mapping, the ordered feature flags and the startup actions,
//! then starts the application as a child process.

use std::collections::BTreeMap;
use std::process::ExitStatus;

use tokio::process::{Child, Command};
use tracing::{debug, info};

use orchard_core::{AppConfig, EnvSource, StartupAction};

use crate::binding::BindingSet;
use crate::error::{BootstrapError, BootstrapResult};

/// Pseudo action name for missing references of the application itself.
const APPLICATION: &str = "application";

/// Ordered, de-duplicated feature flags.
///
/// Later flags may assume earlier ones are enabled; that is a contract for
/// the launched application and is not checked here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureFlags(Vec<String>);

impl FeatureFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a flag. Returns false if it was already enabled.
    pub fn enable(&mut self, flag: impl Into<String>) -> bool {
        let flag = flag.into();
        if self.0.contains(&flag) {
            return false;
        }
        self.0.push(flag);
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for FeatureFlags {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut flags = FeatureFlags::new();
        for flag in iter {
            flags.enable(flag);
        }
        flags
    }
}

pub struct Launcher {
    app: AppConfig,
    /// Host-provided variables, overridden by bindings and `[app.env]`.
    host_env: BTreeMap<String, String>,
}

impl Launcher {
    pub fn new(app: AppConfig) -> Self {
        Self {
            app,
            host_env: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.host_env.insert(key.into(), value.into());
        self
    }

    pub fn app(&self) -> &AppConfig {
        &self.app
    }

    /// The full environment handed to the application.
    ///
    /// Fails with `IncompleteBindings` if a resource the application waits
    /// for is unbound, an `[app.env]` reference cannot be resolved, or a
    /// startup action requires a key that is not present.
    pub fn prepare_env(
        &self,
        bindings: &BindingSet,
        flags: &FeatureFlags,
        actions: &[StartupAction],
    ) -> BootstrapResult<BTreeMap<String, String>> {
        let mut env = self.host_env.clone();
        env.extend(bindings.to_env());
        let mut missing = Vec::new();

        for name in &self.app.wait_for {
            if !bindings.is_bound(name) {
                missing.push(format!("resources.{name}"));
            }
        }

        for (key, source) in &self.app.env {
            let value = match source {
                EnvSource::Plain(value) | EnvSource::Literal { value } => Some(value.as_str()),
                EnvSource::Reference { from, fact: Some(fact) } => {
                    bindings.fact(from, fact).map(|v| v.expose())
                }
                EnvSource::Reference { from, fact: None } => {
                    bindings.primary(from).map(|v| v.expose())
                }
            };
            match value {
                Some(value) => {
                    env.insert(key.clone(), value.to_string());
                }
                None => missing.push(key.clone()),
            }
        }

        if !missing.is_empty() {
            return Err(BootstrapError::IncompleteBindings {
                action: APPLICATION.to_string(),
                missing,
            });
        }

        for (i, flag) in flags.iter().enumerate() {
            env.insert(format!("ORCHARD_FEATURES__{i}"), flag.to_string());
        }

        for (i, action) in actions.iter().enumerate() {
            let missing: Vec<String> = action
                .requires
                .iter()
                .filter(|key| !env.contains_key(key.as_str()))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BootstrapError::IncompleteBindings {
                    action: action.name.clone(),
                    missing,
                });
            }
            env.insert(format!("ORCHARD_STARTUP_ACTIONS__{i}"), action.name.clone());
        }

        Ok(env)
    }

    /// Start the application with inherited stdio.
    pub fn launch(
        &self,
        bindings: &BindingSet,
        flags: &FeatureFlags,
        actions: &[StartupAction],
    ) -> BootstrapResult<AppProcess> {
        let env = self.prepare_env(bindings, flags, actions)?;
        let (program, args) = self.app.command.split_first().ok_or_else(|| {
            BootstrapError::Launch(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty application command",
            ))
        })?;

        let mut command = Command::new(program);
        command.args(args).envs(&env).kill_on_drop(true);
        if let Some(dir) = &self.app.working_dir {
            command.current_dir(dir);
        }
        debug!(vars = env.len(), "application environment prepared");

        let child = command.spawn().map_err(BootstrapError::Launch)?;
        info!(pid = child.id(), program = %program, "application launched");
        Ok(AppProcess { child })
    }
}

/// The launched application.
pub struct AppProcess {
    child: Child,
}

impl AppProcess {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for the application to exit.
    pub async fn wait(&mut self) -> BootstrapResult<ExitStatus> {
        self.child.wait().await.map_err(BootstrapError::Launch)
    }

    /// Stop the application. The terminal already delivers Ctrl-C to the
    /// whole foreground process group; this covers every other shutdown.
    pub fn terminate(&mut self) -> BootstrapResult<()> {
        match self.child.start_kill() {
            Ok(()) => Ok(()),
            // Already exited.
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(BootstrapError::Launch(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{Binding, BindingValue, Facts, NodeBindings};

    fn bindings() -> BindingSet {
        let mut facts = Facts::new();
        facts.insert("containerName".into(), BindingValue::literal("shells"));
        facts.insert("connectionString".into(), BindingValue::secret("UseDev=true"));
        let mut set = BindingSet::new();
        set.absorb(NodeBindings {
            source: "shells".into(),
            primary_fact: Some("connectionString".into()),
            facts,
            bindings: vec![Binding {
                key: "ConnectionStrings__shells".into(),
                value: BindingValue::secret("UseDev=true"),
                source: "shells".into(),
            }],
        })
        .unwrap();
        set
    }

    fn app() -> AppConfig {
        let mut env = BTreeMap::new();
        env.insert(
            "Shells__ConnectionString".to_string(),
            EnvSource::Reference {
                from: "shells".into(),
                fact: None,
            },
        );
        env.insert(
            "Shells__Container".to_string(),
            EnvSource::Reference {
                from: "shells".into(),
                fact: Some("containerName".into()),
            },
        );
        env.insert(
            "ASPNETCORE_ENVIRONMENT".to_string(),
            EnvSource::Literal {
                value: "Development".into(),
            },
        );
        AppConfig {
            command: vec!["true".into()],
            working_dir: None,
            wait_for: vec!["shells".into()],
            features: Vec::new(),
            env,
            startup_actions: Vec::new(),
        }
    }

    #[test]
    fn env_combines_bindings_mapping_and_flags() {
        let launcher = Launcher::new(app()).with_env("ORCHARD_CONFIG", "/srv/orchard.toml");
        let flags: FeatureFlags = ["OrchardCore.Contents", "OrchardCore.Media", "OrchardCore.Contents"]
            .into_iter()
            .collect();
        let actions = vec![StartupAction {
            name: "AutoSetup".into(),
            requires: vec!["Shells__ConnectionString".into()],
        }];

        let env = launcher.prepare_env(&bindings(), &flags, &actions).unwrap();
        assert_eq!(env["ConnectionStrings__shells"], "UseDev=true");
        assert_eq!(env["Shells__ConnectionString"], "UseDev=true");
        assert_eq!(env["Shells__Container"], "shells");
        assert_eq!(env["ASPNETCORE_ENVIRONMENT"], "Development");
        assert_eq!(env["ORCHARD_CONFIG"], "/srv/orchard.toml");
        assert_eq!(env["ORCHARD_FEATURES__0"], "OrchardCore.Contents");
        assert_eq!(env["ORCHARD_FEATURES__1"], "OrchardCore.Media");
        assert!(!env.contains_key("ORCHARD_FEATURES__2"));
        assert_eq!(env["ORCHARD_STARTUP_ACTIONS__0"], "AutoSetup");
    }

    #[test]
    fn missing_required_key_refuses_action() {
        let launcher = Launcher::new(app());
        let actions = vec![StartupAction {
            name: "AutoSetup".into(),
            requires: vec!["Parameters__admin-password".into()],
        }];
        match launcher.prepare_env(&bindings(), &FeatureFlags::new(), &actions) {
            Err(BootstrapError::IncompleteBindings { action, missing }) => {
                assert_eq!(action, "AutoSetup");
                assert_eq!(missing, vec!["Parameters__admin-password"]);
            }
            other => panic!("expected IncompleteBindings, got {other:?}"),
        }
    }

    #[test]
    fn unbound_dependency_refuses_launch() {
        let launcher = Launcher::new(app());
        match launcher.prepare_env(&BindingSet::new(), &FeatureFlags::new(), &[]) {
            Err(BootstrapError::IncompleteBindings { action, missing }) => {
                assert_eq!(action, APPLICATION);
                assert!(missing.contains(&"resources.shells".to_string()));
                assert!(missing.contains(&"Shells__Container".to_string()));
            }
            other => panic!("expected IncompleteBindings, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn launched_process_sees_environment_and_exit_code() {
        let mut app = app();
        app.command = vec![
            "sh".into(),
            "-c".into(),
            r#"test "$Shells__Container" = shells && exit 7"#.into(),
        ];
        let launcher = Launcher::new(app);
        let mut process = launcher
            .launch(&bindings(), &FeatureFlags::new(), &[])
            .unwrap();
        let status = process.wait().await.unwrap();
        assert_eq!(status.code(), Some(7));
    }
}
