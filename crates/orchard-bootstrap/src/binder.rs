//! Turns ready resources into connection bindings.
//!
//! Identities of `persistent` resources are looked up in the state store and
//! minted only the first time, so every run against the same instance binds
//! the same host, ports and credentials. Ephemeral resources get a fresh
//! identity per run. Parameter values are passed through as supplied.

use std::collections::HashMap;

use tracing::{debug, warn};

use orchard_core::{env_segment, EngineFlavor, Lifetime, NodeState, ResourceDecl, ResourceKind};
use orchard_state::{ResourceIdentity, StateStore};

use crate::binding::{Binding, BindingValue, Facts, NodeBindings};
use crate::error::{BootstrapError, BootstrapResult};

/// Well-known development account of the Azurite storage emulator.
pub const EMULATOR_ACCOUNT: &str = "devstoreaccount1";
pub const EMULATOR_ACCOUNT_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";

const PASSWORD_BYTES: usize = 16;

pub struct Binder {
    store: StateStore,
    parameters: HashMap<String, String>,
}

impl Binder {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            parameters: HashMap::new(),
        }
    }

    /// Externally supplied parameter values, by resource name.
    pub fn with_parameters(mut self, parameters: HashMap<String, String>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Identity of an engine or emulator; `None` for every other kind.
    pub fn resolve_identity(&self, decl: &ResourceDecl) -> BootstrapResult<Option<ResourceIdentity>> {
        if !decl.kind.is_process() {
            return Ok(None);
        }
        if decl.lifetime == Lifetime::Ephemeral {
            return mint_identity(decl).map(Some);
        }

        if let Some(stored) = self.store.get_identity(&decl.name)? {
            if stored.ports != decl.resolved_ports() || stored.host != decl.host() {
                warn!(
                    node = %decl.name,
                    "declared endpoint differs from the persisted instance, keeping the persisted one"
                );
            }
            debug!(node = %decl.name, "reusing persisted identity");
            return Ok(Some(stored));
        }
        let (identity, _) = self.store.get_or_insert_identity(&mint_identity(decl)?)?;
        debug!(node = %decl.name, "persisted new identity");
        Ok(Some(identity))
    }

    /// Connection facts of a node, from its identity or its parent's facts.
    pub fn facts(
        &self,
        decl: &ResourceDecl,
        identity: Option<&ResourceIdentity>,
        parent: Option<&Facts>,
    ) -> BootstrapResult<Facts> {
        let mut facts = Facts::new();
        match decl.kind {
            ResourceKind::EngineInstance => {
                let identity = require_identity(decl, identity)?;
                let flavor = decl.engine_flavor();
                let port = identity.ports.get("port").copied().unwrap_or_default();
                let username = identity.username.clone().unwrap_or_default();
                let password = identity.password.clone().unwrap_or_default();
                facts.insert("engine".into(), BindingValue::literal(flavor_name(flavor)));
                facts.insert("host".into(), BindingValue::literal(&identity.host));
                facts.insert("port".into(), BindingValue::literal(port.to_string()));
                facts.insert("username".into(), BindingValue::literal(&username));
                facts.insert("password".into(), BindingValue::secret(&password));
                facts.insert(
                    "connectionString".into(),
                    BindingValue::secret(engine_connection_string(
                        flavor,
                        &identity.host,
                        port,
                        &username,
                        &password,
                        None,
                    )),
                );
            }
            ResourceKind::LogicalDatabase => {
                let parent = require_parent(decl, parent)?;
                let get = |fact: &str| parent.get(fact).map(|v| v.expose().to_string()).unwrap_or_default();
                let flavor = match get("engine").as_str() {
                    "postgres" => EngineFlavor::Postgres,
                    _ => EngineFlavor::Mysql,
                };
                for fact in ["engine", "host", "port", "username", "password"] {
                    if let Some(value) = parent.get(fact) {
                        facts.insert(fact.into(), value.clone());
                    }
                }
                let database = decl.database_name();
                facts.insert("database".into(), BindingValue::literal(database));
                facts.insert(
                    "connectionString".into(),
                    BindingValue::secret(engine_connection_string(
                        flavor,
                        &get("host"),
                        get("port").parse().unwrap_or_default(),
                        &get("username"),
                        &get("password"),
                        Some(database),
                    )),
                );
            }
            ResourceKind::StorageEmulator => {
                let identity = require_identity(decl, identity)?;
                let account = identity.username.clone().unwrap_or_default();
                let key = identity.password.clone().unwrap_or_default();
                facts.insert("host".into(), BindingValue::literal(&identity.host));
                facts.insert("accountName".into(), BindingValue::literal(&account));
                facts.insert("accountKey".into(), BindingValue::secret(&key));

                let mut endpoints = Vec::new();
                for service in ["blob", "queue", "table"] {
                    let Some(port) = identity.ports.get(service) else {
                        continue;
                    };
                    let endpoint = format!("http://{}:{port}/{account}", identity.host);
                    facts.insert(format!("{service}Port"), BindingValue::literal(port.to_string()));
                    facts.insert(format!("{service}Endpoint"), BindingValue::Uri(endpoint.clone()));
                    endpoints.push((service, endpoint));
                }
                facts.insert(
                    "connectionString".into(),
                    BindingValue::secret(storage_connection_string(&account, &key, &endpoints)),
                );
            }
            ResourceKind::BlobContainer => {
                let parent = require_parent(decl, parent)?;
                for fact in ["host", "blobPort", "blobEndpoint", "accountName", "accountKey"] {
                    if let Some(value) = parent.get(fact) {
                        facts.insert(fact.into(), value.clone());
                    }
                }
                let expose = |fact: &str| facts.get(fact).map(|v| v.expose().to_string()).unwrap_or_default();
                let connection = storage_connection_string(
                    &expose("accountName"),
                    &expose("accountKey"),
                    &[("blob", expose("blobEndpoint"))],
                );
                facts.insert("containerName".into(), BindingValue::literal(decl.container_name()));
                facts.insert("connectionString".into(), BindingValue::secret(connection));
            }
            ResourceKind::Parameter => {
                let supplied = self
                    .parameters
                    .get(&decl.name)
                    .cloned()
                    .or_else(|| decl.value.clone());
                if let Some(value) = supplied {
                    let value = if decl.secret {
                        BindingValue::secret(value)
                    } else {
                        BindingValue::literal(value)
                    };
                    facts.insert("value".into(), value);
                }
            }
        }
        Ok(facts)
    }

    /// Flatten a ready node's facts into hierarchical keys.
    ///
    /// Every fact `f` of node `N` is published as `resources.N.f` and
    /// `RESOURCES__N__F`; the primary fact also as `ConnectionStrings__N` /
    /// `ConnectionStrings:N` (or `Parameters__N` / `Parameters:N`).
    pub fn bind(
        &self,
        decl: &ResourceDecl,
        state: &NodeState,
        facts: &Facts,
    ) -> BootstrapResult<NodeBindings> {
        if !state.is_ready() {
            return Err(BootstrapError::NotReady(decl.name.clone()));
        }

        let name = &decl.name;
        let mut bindings = Vec::with_capacity(facts.len() * 2 + 2);
        let mut push = |key: String, value: &BindingValue| {
            bindings.push(Binding {
                key,
                value: value.clone(),
                source: name.clone(),
            });
        };

        for (fact, value) in facts {
            push(format!("resources.{name}.{fact}"), value);
            push(
                format!("RESOURCES__{}__{}", env_segment(name), env_segment(fact)),
                value,
            );
        }

        let (primary_fact, section) = match decl.kind {
            ResourceKind::Parameter => ("value", "Parameters"),
            _ => ("connectionString", "ConnectionStrings"),
        };
        let primary = facts.get(primary_fact);
        if let Some(value) = primary {
            push(format!("{section}__{name}"), value);
            push(format!("{section}:{name}"), value);
        }

        Ok(NodeBindings {
            source: name.clone(),
            primary_fact: primary.map(|_| primary_fact.to_string()),
            facts: facts.clone(),
            bindings,
        })
    }
}

fn mint_identity(decl: &ResourceDecl) -> BootstrapResult<ResourceIdentity> {
    let (username, password) = match decl.kind {
        ResourceKind::StorageEmulator => (
            EMULATOR_ACCOUNT.to_string(),
            EMULATOR_ACCOUNT_KEY.to_string(),
        ),
        _ => (
            decl.username
                .clone()
                .unwrap_or_else(|| decl.engine_flavor().default_user().to_string()),
            random_password()?,
        ),
    };
    Ok(ResourceIdentity {
        name: decl.name.clone(),
        kind: decl.kind,
        host: decl.host().to_string(),
        ports: decl.resolved_ports(),
        username: Some(username),
        password: Some(password),
        created_at: epoch_secs(),
    })
}

fn random_password() -> BootstrapResult<String> {
    let mut buf = [0u8; PASSWORD_BYTES];
    getrandom::getrandom(&mut buf).map_err(|e| BootstrapError::Credentials(e.to_string()))?;
    Ok(hex::encode(buf))
}

fn require_identity<'a>(
    decl: &ResourceDecl,
    identity: Option<&'a ResourceIdentity>,
) -> BootstrapResult<&'a ResourceIdentity> {
    identity.ok_or_else(|| BootstrapError::NotReady(decl.name.clone()))
}

fn require_parent<'a>(decl: &ResourceDecl, parent: Option<&'a Facts>) -> BootstrapResult<&'a Facts> {
    parent.ok_or_else(|| BootstrapError::NotReady(decl.name.clone()))
}

fn flavor_name(flavor: EngineFlavor) -> &'static str {
    match flavor {
        EngineFlavor::Mysql => "mysql",
        EngineFlavor::Postgres => "postgres",
    }
}

fn engine_connection_string(
    flavor: EngineFlavor,
    host: &str,
    port: u16,
    username: &str,
    password: &str,
    database: Option<&str>,
) -> String {
    let mut s = match flavor {
        EngineFlavor::Mysql => {
            format!("Server={host};Port={port};User ID={username};Password={password}")
        }
        EngineFlavor::Postgres => {
            format!("Host={host};Port={port};Username={username};Password={password}")
        }
    };
    if let Some(database) = database {
        s.push_str(&format!(";Database={database}"));
    }
    s
}

fn storage_connection_string(account: &str, key: &str, endpoints: &[(&str, String)]) -> String {
    let mut s = format!("DefaultEndpointsProtocol=http;AccountName={account};AccountKey={key};");
    for (service, endpoint) in endpoints {
        let label = match *service {
            "blob" => "BlobEndpoint",
            "queue" => "QueueEndpoint",
            _ => "TableEndpoint",
        };
        s.push_str(&format!("{label}={endpoint};"));
    }
    s
}

fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
