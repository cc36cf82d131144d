//! orchard-bootstrap — bring backing resources up in dependency order and
//! launch the application with their connection bindings.
//!
//! # Architecture
//!
//! ```text
//! HostConfig.resources
//!   └── DependencyGraph::build          (cycle check, topological order)
//!         └── Orchestrator::run
//!               ├── ReadinessWaiter     (one task per node, watch channels)
//!               │     ├── Binder        (identities, connection facts)
//!               │     └── Provisioner   (start / probe / ensure)
//!               └── BindingSet          (write-once keys)
//!                     └── Launcher      (env + feature flags + actions)
//! ```
//!
//! A node whose dependency fails never runs its own probe; it fails with
//! `DependencyFailed` naming the root node. The run reports one terminal
//! error and never launches the application in a degraded state.

pub mod binder;
pub mod binding;
pub mod error;
pub mod graph;
pub mod launcher;
pub mod orchestrator;
pub mod probe;
pub mod provision;
pub mod waiter;

pub use binder::Binder;
pub use binding::{Binding, BindingSet, BindingValue, Facts, NodeBindings, Secret};
pub use error::{BootstrapError, BootstrapResult};
pub use graph::DependencyGraph;
pub use launcher::{AppProcess, FeatureFlags, Launcher};
pub use orchestrator::{Orchestrator, RunReport};
pub use provision::{
    parameter_env_var, BoxFuture, ProbeFailure, ProcessProvisioner, ProvisionRequest, Provisioner,
};
pub use waiter::{ReadinessWaiter, Signal, WaitOutcome, WaiterContext};
