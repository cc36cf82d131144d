//! orchard.toml configuration parser.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::parse_duration;
use crate::error::ConfigError;
use crate::types::{env_segment, EngineFlavor, Lifetime, ResourceKind};

const DEFAULT_HOST: &str = "127.0.0.1";

/// Default emulator ports: blob, queue, table.
const EMULATOR_PORTS: [(&str, u16); 3] = [("blob", 10000), ("queue", 10001), ("table", 10002)];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
    #[serde(default)]
    pub resources: Vec<ResourceDecl>,
    pub app: AppConfig,
    #[serde(default)]
    pub tenants: Vec<TenantConfig>,
    #[serde(default)]
    pub migrations: MigrationsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout: String,
    #[serde(default = "default_probe_interval")]
    pub probe_interval: String,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            readiness_timeout: default_readiness_timeout(),
            probe_interval: default_probe_interval(),
            state_dir: default_state_dir(),
        }
    }
}

impl BootstrapConfig {
    pub fn readiness_timeout(&self) -> Duration {
        parse_duration(&self.readiness_timeout).unwrap_or(Duration::from_secs(60))
    }

    pub fn probe_interval(&self) -> Duration {
        parse_duration(&self.probe_interval).unwrap_or(Duration::from_millis(500))
    }

    /// Holds persistent resource identities.
    pub fn bootstrap_db_path(&self) -> PathBuf {
        self.state_dir.join("bootstrap.redb")
    }

    /// Holds tenant migration records.
    pub fn tenants_db_path(&self) -> PathBuf {
        self.state_dir.join("tenants.redb")
    }
}

/// One backing resource node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDecl {
    pub name: String,
    pub kind: ResourceKind,
    #[serde(default)]
    pub lifetime: Lifetime,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub host: Option<String>,
    /// Engine listen port.
    pub port: Option<u16>,
    /// Named ports (storage emulators: blob, queue, table).
    #[serde(default)]
    pub ports: BTreeMap<String, u16>,
    pub engine: Option<EngineFlavor>,
    pub username: Option<String>,
    /// Database or container name when it differs from the node name.
    pub database: Option<String>,
    pub container: Option<String>,
    /// Command that starts the resource process when it is not reachable.
    pub start: Option<Vec<String>>,
    /// Command that creates the resource if missing (databases, containers).
    pub ensure: Option<Vec<String>>,
    /// HTTP path probed after the port accepts connections.
    pub health_path: Option<String>,
    pub timeout: Option<String>,
    #[serde(default)]
    pub secret: bool,
    /// Fallback value for parameters.
    pub value: Option<String>,
}

impl ResourceDecl {
    /// Minimal declaration, mostly for tests and programmatic registries.
    pub fn new(name: &str, kind: ResourceKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            lifetime: Lifetime::Ephemeral,
            depends_on: Vec::new(),
            host: None,
            port: None,
            ports: BTreeMap::new(),
            engine: None,
            username: None,
            database: None,
            container: None,
            start: None,
            ensure: None,
            health_path: None,
            timeout: None,
            secret: false,
            value: None,
        }
    }

    pub fn depends_on(mut self, name: &str) -> Self {
        self.depends_on.push(name.to_string());
        self
    }

    pub fn persistent(mut self) -> Self {
        self.lifetime = Lifetime::Persistent;
        self
    }

    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or(DEFAULT_HOST)
    }

    pub fn engine_flavor(&self) -> EngineFlavor {
        self.engine.unwrap_or_default()
    }

    /// Resolved named ports, with kind defaults filled in.
    pub fn resolved_ports(&self) -> BTreeMap<String, u16> {
        let mut ports = BTreeMap::new();
        match self.kind {
            ResourceKind::EngineInstance => {
                let port = self
                    .port
                    .or_else(|| self.ports.get("port").copied())
                    .unwrap_or_else(|| self.engine_flavor().default_port());
                ports.insert("port".to_string(), port);
            }
            ResourceKind::StorageEmulator => {
                for (name, default) in EMULATOR_PORTS {
                    let port = self.ports.get(name).copied().unwrap_or(default);
                    ports.insert(name.to_string(), port);
                }
            }
            _ => {
                ports.extend(self.ports.iter().map(|(k, v)| (k.clone(), *v)));
                if let Some(port) = self.port {
                    ports.insert("port".to_string(), port);
                }
            }
        }
        ports
    }

    pub fn database_name(&self) -> &str {
        self.database.as_deref().unwrap_or(&self.name)
    }

    pub fn container_name(&self) -> &str {
        self.container.as_deref().unwrap_or(&self.name)
    }

    /// Readiness deadline for this node, falling back to the run default.
    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout
            .as_deref()
            .and_then(parse_duration)
            .unwrap_or(default)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub command: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Resources the application waits for before launch.
    #[serde(default)]
    pub wait_for: Vec<String>,
    /// Ordered feature flags; later flags may assume earlier ones are enabled.
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, EnvSource>,
    #[serde(default)]
    pub startup_actions: Vec<StartupAction>,
}

impl AppConfig {
    /// Every resource the application depends on directly.
    pub fn direct_dependencies(&self) -> Vec<String> {
        let mut deps: Vec<String> = self.wait_for.clone();
        for source in self.env.values() {
            if let EnvSource::Reference { from, .. } = source {
                if !deps.contains(from) {
                    deps.push(from.clone());
                }
            }
        }
        deps
    }
}

/// Value of one application environment variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvSource {
    Plain(String),
    Literal { value: String },
    /// A fact of a bound resource; the primary connection fact by default.
    Reference {
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fact: Option<String>,
    },
}

/// A named action the application runs at startup, with the binding keys it needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartupAction {
    pub name: String,
    #[serde(default)]
    pub requires: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantConfig {
    pub name: String,
    /// Recipe file name under `migrations.recipes_dir`.
    pub recipe: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationsConfig {
    #[serde(default = "default_recipes_dir")]
    pub recipes_dir: PathBuf,
    /// Command executing a recipe; receives `--tenant <id> --recipe <path>`.
    #[serde(default)]
    pub runner: Vec<String>,
    /// How long `migrate` waits for another process working on the same
    /// tenant store.
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout: String,
}

impl MigrationsConfig {
    pub fn lock_timeout(&self) -> Duration {
        parse_duration(&self.lock_timeout).unwrap_or(Duration::from_secs(600))
    }
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            recipes_dir: default_recipes_dir(),
            runner: Vec::new(),
            lock_timeout: default_lock_timeout(),
        }
    }
}

impl HostConfig {
    /// Load, resolve relative paths against the file's directory, and validate.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&content)?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn resource(&self, name: &str) -> Option<&ResourceDecl> {
        self.resources.iter().find(|r| r.name == name)
    }

    /// The engine or emulator a database or container is nested under.
    pub fn parent_of(&self, decl: &ResourceDecl) -> Option<&ResourceDecl> {
        let expected = decl.kind.parent_kind()?;
        decl.depends_on
            .iter()
            .filter_map(|name| self.resource(name))
            .find(|r| r.kind == expected)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.bootstrap.state_dir);
        resolve(&mut self.migrations.recipes_dir);
        if let Some(dir) = self.app.working_dir.as_mut() {
            resolve(dir);
        }
    }

    /// Check the whole declaration once, before anything is started.
    ///
    /// Cycles are reported by the graph builder, not here.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("bootstrap.readiness_timeout", &self.bootstrap.readiness_timeout),
            ("bootstrap.probe_interval", &self.bootstrap.probe_interval),
            ("migrations.lock_timeout", &self.migrations.lock_timeout),
        ] {
            check_duration(field, value)?;
        }

        let mut seen = HashSet::new();
        let mut segments: HashMap<String, &str> = HashMap::new();
        for (index, decl) in self.resources.iter().enumerate() {
            if decl.name.trim().is_empty() {
                return Err(ConfigError::EmptyName(index));
            }
            if !seen.insert(decl.name.as_str()) {
                return Err(ConfigError::DuplicateResource(decl.name.clone()));
            }
            // RESOURCES__<SEGMENT>__* keys must stay unique per resource.
            let segment = env_segment(&decl.name);
            if let Some(first) = segments.insert(segment.clone(), decl.name.as_str()) {
                return Err(ConfigError::EnvKeyCollision {
                    first: first.to_string(),
                    second: decl.name.clone(),
                    segment,
                });
            }
            if let Some(timeout) = &decl.timeout {
                check_duration(&format!("{}.timeout", decl.name), timeout)?;
            }
        }

        let kinds: HashMap<&str, ResourceKind> = self
            .resources
            .iter()
            .map(|r| (r.name.as_str(), r.kind))
            .collect();

        for decl in &self.resources {
            for dep in &decl.depends_on {
                if !kinds.contains_key(dep.as_str()) {
                    return Err(ConfigError::UnknownReference {
                        context: format!("resource '{}'", decl.name),
                        name: dep.clone(),
                    });
                }
            }

            if decl.kind == ResourceKind::Parameter && !decl.depends_on.is_empty() {
                return Err(ConfigError::ParameterWithDependencies(decl.name.clone()));
            }

            if let Some(expected) = decl.kind.parent_kind() {
                let parents = decl
                    .depends_on
                    .iter()
                    .filter(|d| kinds.get(d.as_str()) == Some(&expected))
                    .count();
                if parents != 1 {
                    return Err(ConfigError::MissingParent {
                        node: decl.name.clone(),
                        kind: decl.kind,
                        expected,
                    });
                }
            }

            for (label, command) in [("start", &decl.start), ("ensure", &decl.ensure)] {
                if command.as_ref().is_some_and(|c| c.is_empty()) {
                    return Err(ConfigError::EmptyCommand(format!(
                        "resource '{}' {label}",
                        decl.name
                    )));
                }
            }
        }

        if self.app.command.is_empty() {
            return Err(ConfigError::EmptyCommand("app".to_string()));
        }
        for name in &self.app.wait_for {
            if !kinds.contains_key(name.as_str()) {
                return Err(ConfigError::UnknownReference {
                    context: "app.wait_for".to_string(),
                    name: name.clone(),
                });
            }
        }
        for (key, source) in &self.app.env {
            if let EnvSource::Reference { from, .. } = source {
                if !kinds.contains_key(from.as_str()) {
                    return Err(ConfigError::UnknownReference {
                        context: format!("app.env.{key}"),
                        name: from.clone(),
                    });
                }
            }
        }

        let mut tenants = HashSet::new();
        for tenant in &self.tenants {
            if !tenants.insert(tenant.name.as_str()) {
                return Err(ConfigError::DuplicateTenant(tenant.name.clone()));
            }
        }

        Ok(())
    }
}

fn check_duration(field: &str, value: &str) -> Result<(), ConfigError> {
    match parse_duration(value) {
        Some(_) => Ok(()),
        None => Err(ConfigError::InvalidDuration {
            field: field.to_string(),
            value: value.to_string(),
        }),
    }
}

fn default_readiness_timeout() -> String {
    "60s".to_string()
}

fn default_probe_interval() -> String {
    "500ms".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".orchard")
}

fn default_lock_timeout() -> String {
    "10m".to_string()
}

fn default_recipes_dir() -> PathBuf {
    PathBuf::from("recipes")
}
