//! End-to-end test campaigns for accelerator Kubernetes clusters on AWS.
//!
//! A campaign is a list of prerequisites and features. Features own setup,
//! assess and teardown steps that deploy workloads, wait for cluster state
//! and check what the workloads report. The [`suites`] module defines the
//! concrete campaigns; everything else is the machinery they run on.

pub mod campaign;
pub mod client;
pub mod conditions;
pub mod config;
pub mod context;
mod embedded;
pub mod error;
pub mod formatters;
pub mod inventory;
pub mod logs;
pub mod manifest;
pub mod models;
pub mod results;
pub mod schemaless;
pub mod selection;
pub mod suites;
pub mod wait;
pub mod workloads;

pub use error::{Error, ErrorKind, Result};
