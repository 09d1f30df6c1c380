//! Infrastructure definition of the task lists backend.
//!
//! The stack is modelled as typed resources (data store, identity subsystem,
//! compute unit, routing layer and the roles between them), synthesized into
//! a CloudFormation template and audited before deployment.

pub mod api;
pub mod audit;
pub mod compute;
pub mod config;
pub mod errors;
pub mod iam;
pub mod identity;
pub mod stack;
pub mod table;
pub mod template;

pub use api::{CorsPolicy, HttpMethod, Route, RouteTable, ROUTES};
pub use audit::{audit, AuditReport, Finding, Rule, Severity};
pub use compute::ComputeEnv;
pub use config::*;
pub use errors::*;
pub use stack::{Stack, StackOutputs};
pub use template::Template;
