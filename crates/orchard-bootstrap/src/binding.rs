//! Resolved connection facts, published as hierarchical keys.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{BootstrapError, BootstrapResult};

/// Named connection facts of one ready resource (`host`, `port`, ...).
pub type Facts = BTreeMap<String, BindingValue>;

/// A secret value. Never printed by `Debug` or `Display`.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Value of a binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingValue {
    Literal(String),
    Uri(String),
    Secret(Secret),
}

impl BindingValue {
    pub fn literal(value: impl Into<String>) -> Self {
        Self::Literal(value.into())
    }

    pub fn secret(value: impl Into<String>) -> Self {
        Self::Secret(Secret::new(value))
    }

    /// The raw value, secrets included. Only for handing to child processes.
    pub fn expose(&self) -> &str {
        match self {
            BindingValue::Literal(v) | BindingValue::Uri(v) => v,
            BindingValue::Secret(s) => s.expose(),
        }
    }

    pub fn is_secret(&self) -> bool {
        matches!(self, BindingValue::Secret(_))
    }
}

impl fmt::Display for BindingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingValue::Literal(v) | BindingValue::Uri(v) => f.write_str(v),
            BindingValue::Secret(s) => fmt::Display::fmt(s, f),
        }
    }
}

/// One key/value pair produced by a ready resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub key: String,
    pub value: BindingValue,
    /// Name of the resource that produced it.
    pub source: String,
}

/// Everything the binder produced for one resource.
#[derive(Debug, Clone)]
pub struct NodeBindings {
    pub source: String,
    /// Fact addressed by a bare reference to the resource.
    pub primary_fact: Option<String>,
    pub facts: Facts,
    pub bindings: Vec<Binding>,
}

/// All bindings of a run. Keys are write-once.
#[derive(Debug, Clone, Default)]
pub struct BindingSet {
    entries: BTreeMap<String, Binding>,
    facts: BTreeMap<String, Facts>,
    primary: BTreeMap<String, String>,
}

impl BindingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one binding. Re-adding an identical binding is a no-op; changing
    /// the value of an existing key is refused.
    pub fn insert(&mut self, binding: Binding) -> BootstrapResult<()> {
        match self.entries.get(&binding.key) {
            Some(existing) if existing.value != binding.value => {
                Err(BootstrapError::BindingConflict { key: binding.key })
            }
            Some(_) => Ok(()),
            None => {
                self.entries.insert(binding.key.clone(), binding);
                Ok(())
            }
        }
    }

    /// Take over everything one resource produced.
    pub fn absorb(&mut self, node: NodeBindings) -> BootstrapResult<()> {
        if self.facts.contains_key(&node.source) {
            return Err(BootstrapError::BindingConflict {
                key: format!("resources.{}", node.source),
            });
        }
        for binding in node.bindings {
            self.insert(binding)?;
        }
        if let Some(primary) = node.primary_fact {
            self.primary.insert(node.source.clone(), primary);
        }
        self.facts.insert(node.source, node.facts);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&BindingValue> {
        self.entries.get(key).map(|b| &b.value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Whether the resource has been bound in this run.
    pub fn is_bound(&self, source: &str) -> bool {
        self.facts.contains_key(source)
    }

    pub fn fact(&self, source: &str, fact: &str) -> Option<&BindingValue> {
        self.facts.get(source)?.get(fact)
    }

    /// The value a bare reference to `source` resolves to.
    pub fn primary(&self, source: &str) -> Option<&BindingValue> {
        let fact = self.primary.get(source)?;
        self.fact(source, fact)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Binding> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Flat `KEY=value` pairs for a child process, secrets exposed.
    pub fn to_env(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|(k, b)| (k.clone(), b.value.expose().to_string()))
            .collect()
    }
}
