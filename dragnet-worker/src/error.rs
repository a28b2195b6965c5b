use dragnet_common::orchestration::OrchestrationError;
use dragnet_common::persistence::PersistenceError;
use thiserror::Error;

/// Enumeration of errors related to consuming and executing scan jobs.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a transport error occurred while handling a job")]
    Transport(#[from] OrchestrationError),
    #[error("a store error occurred while handling a job")]
    Store(#[from] PersistenceError),
}
