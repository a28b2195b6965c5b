use dragnet_common::orchestration::OrchestrationError;
use dragnet_common::persistence::PersistenceError;
use dragnet_common::targets::TargetError;
use thiserror::Error;

/// Enumeration of errors that abort a bulk scan publication.
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("failed to acquire the target list: {0}")]
    Targets(#[from] TargetError),
    #[error("transport failure while publishing: {0}")]
    Transport(#[from] OrchestrationError),
    #[error("store failure while publishing: {0}")]
    Store(#[from] PersistenceError),
    #[error("invalid schedule: {0}")]
    Schedule(#[from] cron::error::Error),
}
