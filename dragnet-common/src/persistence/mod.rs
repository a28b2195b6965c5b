//! Idempotent document storage for bulk scans and scan results.
//!
//! Results are keyed by the job id, so a redelivered job that completes on a
//! second worker overwrites nothing and readers never observe mismatched
//! data. Writers namespace documents by `(database, collection)`; the
//! controller chooses both per bulk scan.

pub mod memory;
pub mod pg;

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::bulkscan::{BulkScan, ScanResult};
use crate::job::{JobStatus, ScanJobDescription};

/// Enumeration of errors for operations on the document store.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("result status {result} does not match job status {job}")]
    StatusMismatch { result: JobStatus, job: JobStatus },
    #[error("failed to encode a document: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("connection failed with: {error}")]
    Connection {
        #[source]
        error: sqlx::Error,
    },
    #[error("{command} query failed with: {error}")]
    Query {
        command: String,
        #[source]
        error: sqlx::Error,
    },
    #[error("module registry is sealed; cannot register `{0}`")]
    RegistrySealed(String),
    #[error("failed to read password file {path}: {error}")]
    Credentials {
        path: PathBuf,
        #[source]
        error: io::Error,
    },
}

/// Storage for `BulkScan` and `ScanResult` documents.
#[async_trait]
pub trait PersistenceProvider: Send + Sync {
    async fn insert_bulk_scan(
        &self,
        db_name: &str,
        bulk_scan: &BulkScan,
    ) -> Result<(), PersistenceError>;

    /// Replace the stored bulk scan by id. Readers always see one version.
    async fn update_bulk_scan(
        &self,
        db_name: &str,
        bulk_scan: &BulkScan,
    ) -> Result<(), PersistenceError>;

    /// Write a result to the collection named by the job's bulk scan info.
    ///
    /// Precondition: `result.status == job.status`. A violation is a
    /// programming error and surfaces synchronously as
    /// [`PersistenceError::StatusMismatch`]. Duplicate ids are no-ops.
    async fn insert_scan_result(
        &self,
        result: &ScanResult,
        job: &ScanJobDescription,
    ) -> Result<(), PersistenceError>;

    async fn get_scan_result_by_id(
        &self,
        db_name: &str,
        collection_name: &str,
        id: Uuid,
    ) -> Result<Option<ScanResult>, PersistenceError>;

    async fn get_scan_results_by_target(
        &self,
        db_name: &str,
        collection_name: &str,
        target: &str,
    ) -> Result<Vec<ScanResult>, PersistenceError>;
}

/// Check the status precondition shared by every store implementation.
pub(crate) fn check_status_match(
    result: &ScanResult,
    job: &ScanJobDescription,
) -> Result<(), PersistenceError> {
    if result.status != job.status {
        return Err(PersistenceError::StatusMismatch {
            result: result.status,
            job: job.status,
        });
    }
    Ok(())
}

/// Store a result, applying the bounded serialization recovery policy.
///
/// If the encoder rejects the payload, the job moves to
/// `SERIALIZATION_ERROR`, a minimal error document is written instead and
/// the write is retried exactly once. A second failure moves the job to
/// `INTERNAL_ERROR` and gives up; retrying a pathological payload forever
/// would wedge the worker.
pub async fn store_result_with_recovery(
    store: &dyn PersistenceProvider,
    job: &mut ScanJobDescription,
    result: ScanResult,
) -> Result<(), PersistenceError> {
    match store.insert_scan_result(&result, job).await {
        Ok(()) => Ok(()),
        Err(PersistenceError::Serialization(error)) => {
            warn!(
                job_id = %job.id,
                %error,
                "result document could not be encoded; storing error summary"
            );
            job.advance(JobStatus::SerializationError);
            let fallback = ScanResult::error_document(job, &error.to_string());
            match store.insert_scan_result(&fallback, job).await {
                Ok(()) => Ok(()),
                Err(second) => {
                    job.advance(JobStatus::InternalError);
                    Err(second)
                }
            }
        }
        Err(other) => Err(other),
    }
}

/// Credentials for the document store. The password file is read once, at
/// construction, and takes precedence over the inline password.
#[derive(Debug, Clone, Default)]
pub struct StoreCredentials {
    pub password: Option<String>,
    pub password_file: Option<PathBuf>,
}

impl StoreCredentials {
    pub fn resolve(&self) -> Result<Option<String>, PersistenceError> {
        if let Some(path) = &self.password_file {
            let contents = std::fs::read_to_string(path).map_err(|error| {
                PersistenceError::Credentials {
                    path: path.clone(),
                    error,
                }
            })?;
            return Ok(Some(contents.trim_end().to_owned()));
        }
        Ok(self.password.clone())
    }
}

/// A named transformation applied to every result document before storage.
pub type DocumentModule = Box<dyn Fn(serde_json::Value) -> serde_json::Value + Send + Sync>;

/// An append-only registry of document modules.
///
/// Modules are registered during startup; constructing a store seals the
/// registry and later registration fails fast. The registry is passed to
/// stores at construction rather than living in process-wide state.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: Mutex<Vec<(String, DocumentModule)>>,
    sealed: AtomicBool,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        name: &str,
        module: DocumentModule,
    ) -> Result<(), PersistenceError> {
        if self.sealed.load(Ordering::SeqCst) {
            return Err(PersistenceError::RegistrySealed(name.to_owned()));
        }
        self.modules
            .lock()
            .expect("module registry lock poisoned")
            .push((name.to_owned(), module));
        Ok(())
    }

    pub fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    /// Run a document through every registered module, in registration
    /// order.
    pub fn apply(&self, document: serde_json::Value) -> serde_json::Value {
        let modules = self.modules.lock().expect("module registry lock poisoned");
        modules
            .iter()
            .fold(document, |doc, (_, module)| module(doc))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    use super::*;
    use crate::bulkscan::ScanResult;
    use crate::job::{BulkScanInfo, ScanConfig, ScanTarget};
    use crate::persistence::memory::MemoryStore;
    use serde_json::json;

    /// A store whose encoder rejects the first `failures` writes.
    struct FlakyEncoderStore {
        inner: MemoryStore,
        failures: AtomicU32,
    }

    impl FlakyEncoderStore {
        fn failing(failures: u32) -> Self {
            Self {
                inner: MemoryStore::new(Arc::new(ModuleRegistry::new())),
                failures: AtomicU32::new(failures),
            }
        }
    }

    #[async_trait]
    impl PersistenceProvider for FlakyEncoderStore {
        async fn insert_bulk_scan(
            &self,
            db_name: &str,
            bulk_scan: &BulkScan,
        ) -> Result<(), PersistenceError> {
            self.inner.insert_bulk_scan(db_name, bulk_scan).await
        }

        async fn update_bulk_scan(
            &self,
            db_name: &str,
            bulk_scan: &BulkScan,
        ) -> Result<(), PersistenceError> {
            self.inner.update_bulk_scan(db_name, bulk_scan).await
        }

        async fn insert_scan_result(
            &self,
            result: &ScanResult,
            job: &ScanJobDescription,
        ) -> Result<(), PersistenceError> {
            check_status_match(result, job)?;
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                let encoder_error =
                    serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
                return Err(PersistenceError::Serialization(encoder_error));
            }
            self.inner.insert_scan_result(result, job).await
        }

        async fn get_scan_result_by_id(
            &self,
            db_name: &str,
            collection_name: &str,
            id: Uuid,
        ) -> Result<Option<ScanResult>, PersistenceError> {
            self.inner
                .get_scan_result_by_id(db_name, collection_name, id)
                .await
        }

        async fn get_scan_results_by_target(
            &self,
            db_name: &str,
            collection_name: &str,
            target: &str,
        ) -> Result<Vec<ScanResult>, PersistenceError> {
            self.inner
                .get_scan_results_by_target(db_name, collection_name, target)
                .await
        }
    }

    fn success_job() -> ScanJobDescription {
        let mut job = ScanJobDescription::new(
            ScanTarget::parse("192.0.2.30:443", 443).unwrap(),
            BulkScanInfo {
                bulk_scan_id: "bs".to_owned(),
                db_name: "db".to_owned(),
                collection_name: "results".to_owned(),
                scan_config: ScanConfig::default(),
            },
        );
        job.advance(JobStatus::Success);
        job
    }

    #[tokio::test]
    async fn encoder_failure_falls_back_to_serialization_error() {
        let store = FlakyEncoderStore::failing(1);
        let mut job = success_job();
        let result = ScanResult::for_job(&job, json!({"payload": "x"}));

        store_result_with_recovery(&store, &mut job, result)
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::SerializationError);
        let stored = store
            .get_scan_result_by_id("db", "results", job.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, JobStatus::SerializationError);
        assert!(stored.result_document["error"].is_string());
    }

    #[tokio::test]
    async fn second_encoder_failure_gives_up_as_internal_error() {
        let store = FlakyEncoderStore::failing(2);
        let mut job = success_job();
        let result = ScanResult::for_job(&job, json!({"payload": "x"}));

        let err = store_result_with_recovery(&store, &mut job, result)
            .await
            .unwrap_err();

        assert!(matches!(err, PersistenceError::Serialization(_)));
        assert_eq!(job.status, JobStatus::InternalError);
        assert!(store
            .get_scan_result_by_id("db", "results", job.id)
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn registry_seals_exactly_once() {
        let registry = ModuleRegistry::new();
        registry
            .register("stamp", Box::new(|mut doc| {
                doc["stamped"] = json!(true);
                doc
            }))
            .unwrap();

        registry.seal();
        assert!(registry.is_sealed());

        let err = registry
            .register("late", Box::new(|doc| doc))
            .unwrap_err();
        assert!(matches!(err, PersistenceError::RegistrySealed(name) if name == "late"));

        let out = registry.apply(json!({}));
        assert_eq!(out["stamped"], json!(true));
    }

    #[test]
    fn modules_apply_in_registration_order() {
        let registry = ModuleRegistry::new();
        registry
            .register("first", Box::new(|mut doc| {
                doc["trail"] = json!("a");
                doc
            }))
            .unwrap();
        registry
            .register("second", Box::new(|mut doc| {
                let trail = doc["trail"].as_str().unwrap_or_default().to_owned();
                doc["trail"] = json!(format!("{trail}b"));
                doc
            }))
            .unwrap();

        let out = registry.apply(json!({}));
        assert_eq!(out["trail"], json!("ab"));
    }

    #[test]
    fn password_file_takes_precedence() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("dragnet-pass-{}", std::process::id()));
        std::fs::write(&path, "s3cret\n").unwrap();

        let credentials = StoreCredentials {
            password: Some("inline".to_owned()),
            password_file: Some(path.clone()),
        };
        assert_eq!(credentials.resolve().unwrap().as_deref(), Some("s3cret"));
        std::fs::remove_file(path).ok();

        let inline_only = StoreCredentials {
            password: Some("inline".to_owned()),
            password_file: None,
        };
        assert_eq!(inline_only.resolve().unwrap().as_deref(), Some("inline"));
    }
}
