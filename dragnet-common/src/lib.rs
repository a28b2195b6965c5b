//! Shared contracts and data model for the dragnet scanning crawler.
//!
//! The controller and worker binaries communicate exclusively through the
//! [`orchestration::OrchestrationProvider`] transport and persist documents
//! through the [`persistence::PersistenceProvider`] store. Everything either
//! side needs to agree on lives here.

pub mod bulkscan;
pub mod denylist;
pub mod health;
pub mod job;
pub mod metrics;
pub mod orchestration;
pub mod persistence;
pub mod retry;
pub mod targets;
