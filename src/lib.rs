//! App Kubernetes Operator
//!
//! Reconciles `App` custom resources (`app.o0w0o.cn/v1`) into managed
//! Deployments and serves the admission webhooks that default and validate
//! Apps before they are persisted.

pub mod adapters;
pub mod admission;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod reconcilers;
pub mod store;
pub mod webhook;

pub use error::{Error, Result};
