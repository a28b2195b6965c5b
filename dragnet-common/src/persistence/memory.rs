//! An in-process document store for tests and single-process runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use super::{check_status_match, ModuleRegistry, PersistenceError, PersistenceProvider};
use crate::bulkscan::{BulkScan, ScanResult};
use crate::job::ScanJobDescription;

#[derive(Default)]
struct Database {
    bulk_scans: HashMap<String, BulkScan>,
    collections: HashMap<String, BTreeMap<Uuid, ScanResult>>,
}

pub struct MemoryStore {
    modules: Arc<ModuleRegistry>,
    databases: Mutex<HashMap<String, Database>>,
}

impl MemoryStore {
    pub fn new(modules: Arc<ModuleRegistry>) -> Self {
        modules.seal();
        Self {
            modules,
            databases: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Database>> {
        self.databases.lock().expect("memory store lock poisoned")
    }

    /// Test helper: every result currently in a collection.
    pub fn results_in(&self, db_name: &str, collection_name: &str) -> Vec<ScanResult> {
        self.lock()
            .get(db_name)
            .and_then(|db| db.collections.get(collection_name))
            .map(|coll| coll.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Test helper: the stored form of one bulk scan.
    pub fn bulk_scan(&self, db_name: &str, id: &str) -> Option<BulkScan> {
        self.lock()
            .get(db_name)
            .and_then(|db| db.bulk_scans.get(id))
            .cloned()
    }
}

#[async_trait]
impl PersistenceProvider for MemoryStore {
    async fn insert_bulk_scan(
        &self,
        db_name: &str,
        bulk_scan: &BulkScan,
    ) -> Result<(), PersistenceError> {
        let mut databases = self.lock();
        databases
            .entry(db_name.to_owned())
            .or_default()
            .bulk_scans
            .insert(bulk_scan.id.clone(), bulk_scan.clone());
        Ok(())
    }

    async fn update_bulk_scan(
        &self,
        db_name: &str,
        bulk_scan: &BulkScan,
    ) -> Result<(), PersistenceError> {
        self.insert_bulk_scan(db_name, bulk_scan).await
    }

    async fn insert_scan_result(
        &self,
        result: &ScanResult,
        job: &ScanJobDescription,
    ) -> Result<(), PersistenceError> {
        check_status_match(result, job)?;

        // Mirror a real encoder: documents must survive a serialization
        // round trip, with modules applied, before they are accepted.
        let document = self.modules.apply(serde_json::to_value(result)?);
        let stored: ScanResult = serde_json::from_value(document)?;

        let mut databases = self.lock();
        let collection = databases
            .entry(job.bulk_scan_info.db_name.clone())
            .or_default()
            .collections
            .entry(job.bulk_scan_info.collection_name.clone())
            .or_default();
        // Duplicate inserts for the same job id are no-ops.
        collection.entry(stored.id).or_insert(stored);
        Ok(())
    }

    async fn get_scan_result_by_id(
        &self,
        db_name: &str,
        collection_name: &str,
        id: Uuid,
    ) -> Result<Option<ScanResult>, PersistenceError> {
        Ok(self
            .lock()
            .get(db_name)
            .and_then(|db| db.collections.get(collection_name))
            .and_then(|coll| coll.get(&id))
            .cloned())
    }

    async fn get_scan_results_by_target(
        &self,
        db_name: &str,
        collection_name: &str,
        target: &str,
    ) -> Result<Vec<ScanResult>, PersistenceError> {
        Ok(self
            .lock()
            .get(db_name)
            .and_then(|db| db.collections.get(collection_name))
            .map(|coll| {
                coll.values()
                    .filter(|result| {
                        result.target.hostname.as_deref() == Some(target)
                            || result
                                .target
                                .ip
                                .map(|ip| ip.to_string() == target)
                                .unwrap_or(false)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
