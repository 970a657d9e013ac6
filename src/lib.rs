//! Core library for prevue, an ephemeral preview environment tool.
//!
//! The crate provisions machines for an environment on one of several
//! backends (Scaleway Instances, Kubernetes Deployments or an in-process
//! fake), runs commands on them through the execution router and exposes
//! their service ports through a public relay with the tunnel client.
//! Teardown closes the tunnel before deleting machines and aggregates
//! per-resource failures into a report.

pub mod backend;
pub mod compose;
pub mod config;
pub mod driver;
pub mod environment;
pub mod error;
pub mod exec;
pub mod fake;
pub mod fs;
pub mod kube;
pub mod resource;
pub mod scaleway;
pub mod telemetry;
pub mod test_support;
pub mod tunnel;

pub use backend::{Backend, BackendKind, DeleteOptions, MachineBackend, MachineFilter};
pub use compose::{ComposeError, ComposeProject};
pub use config::{ConfigError, ExecConfig, PrevueConfig, TunnelConfig};
pub use driver::{DeletionReport, DriverSettings, MachineDriver, ProjectContext, RetryPolicy};
pub use environment::{EnvironmentOrchestrator, UpError, UpOutcome, UpRequest};
pub use error::{DriverError, ErrorKind};
pub use exec::{ExecError, ExecutionRequest, ExecutionResult, ExecutionRouter};
pub use fake::FakeBackend;
pub use kube::KubeBackend;
pub use resource::{EnvironmentId, Machine, ResourceKind, ResourceKinds, ResourceRow};
pub use scaleway::ScalewayBackend;
pub use telemetry::TelemetrySink;
pub use tunnel::{TunnelBinding, TunnelClient, TunnelError, TunnelSession};
