//! A document store implemented on PostgreSQL.
//!
//! Each logical database maps to a schema and each collection to a JSONB
//! table inside it. Collections are created on first write, together with
//! their indexes; creation is idempotent and remembered per collection so
//! the DDL runs once per process.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use uuid::Uuid;

use super::{
    check_status_match, ModuleRegistry, PersistenceError, PersistenceProvider, StoreCredentials,
};
use crate::bulkscan::{BulkScan, ScanResult};
use crate::job::ScanJobDescription;

/// The collection every bulk scan document lands in, per database.
const BULK_SCAN_COLLECTION: &str = "bulkScan";

pub struct PgDocumentStore {
    pool: PgPool,
    modules: Arc<ModuleRegistry>,
    /// Collections whose DDL already ran, keyed by `(schema, table)`.
    ready_collections: Mutex<HashSet<(String, String)>>,
}

impl PgDocumentStore {
    /// Connect to the store. Constructing the store seals the module
    /// registry: modules registered afterwards fail fast.
    pub async fn connect(
        url: &str,
        credentials: &StoreCredentials,
        max_connections: u32,
        modules: Arc<ModuleRegistry>,
    ) -> Result<Self, PersistenceError> {
        modules.seal();

        let mut options = PgConnectOptions::from_str(url)
            .map_err(|error| PersistenceError::Connection { error })?
            .application_name("dragnet");
        if let Some(password) = credentials.resolve()? {
            options = options.password(&password);
        }
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy_with(options);

        Ok(Self {
            pool,
            modules,
            ready_collections: Mutex::new(HashSet::new()),
        })
    }

    /// Quote an identifier for interpolation into DDL and queries; sqlx does
    /// not bind identifiers.
    fn quoted(name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn is_ready(&self, db_name: &str, collection_name: &str) -> bool {
        self.ready_collections
            .lock()
            .expect("collection cache lock poisoned")
            .contains(&(db_name.to_owned(), collection_name.to_owned()))
    }

    fn mark_ready(&self, db_name: &str, collection_name: &str) {
        self.ready_collections
            .lock()
            .expect("collection cache lock poisoned")
            .insert((db_name.to_owned(), collection_name.to_owned()));
    }

    /// Create the schema, table and indexes for a result collection. Safe to
    /// race: every statement is `IF NOT EXISTS`.
    async fn ensure_result_collection(
        &self,
        db_name: &str,
        collection_name: &str,
    ) -> Result<(), PersistenceError> {
        if self.is_ready(db_name, collection_name) {
            return Ok(());
        }

        let schema = Self::quoted(db_name);
        let table = format!("{}.{}", schema, Self::quoted(collection_name));
        let index_prefix = format!("{db_name}_{collection_name}")
            .replace(|c: char| !c.is_ascii_alphanumeric(), "_");

        let ddl = format!(
            r#"
CREATE SCHEMA IF NOT EXISTS {schema};
CREATE TABLE IF NOT EXISTS {table} (
    id UUID PRIMARY KEY,
    bulk_scan_id TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    status TEXT NOT NULL,
    target_hostname TEXT,
    target_ip TEXT,
    document JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS "{index_prefix}_hostname_idx" ON {table} (target_hostname);
CREATE INDEX IF NOT EXISTS "{index_prefix}_ip_idx" ON {table} (target_ip);
CREATE INDEX IF NOT EXISTS "{index_prefix}_bulk_scan_idx" ON {table} (bulk_scan_id);
            "#
        );

        sqlx::raw_sql(&ddl)
            .execute(&self.pool)
            .await
            .map_err(|error| PersistenceError::Query {
                command: "CREATE".to_owned(),
                error,
            })?;

        self.mark_ready(db_name, collection_name);
        Ok(())
    }

    async fn ensure_bulk_scan_collection(&self, db_name: &str) -> Result<(), PersistenceError> {
        if self.is_ready(db_name, BULK_SCAN_COLLECTION) {
            return Ok(());
        }

        let schema = Self::quoted(db_name);
        let table = format!("{}.{}", schema, Self::quoted(BULK_SCAN_COLLECTION));
        let ddl = format!(
            r#"
CREATE SCHEMA IF NOT EXISTS {schema};
CREATE TABLE IF NOT EXISTS {table} (
    id TEXT PRIMARY KEY,
    document JSONB NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
            "#
        );

        sqlx::raw_sql(&ddl)
            .execute(&self.pool)
            .await
            .map_err(|error| PersistenceError::Query {
                command: "CREATE".to_owned(),
                error,
            })?;

        self.mark_ready(db_name, BULK_SCAN_COLLECTION);
        Ok(())
    }

    fn result_table(db_name: &str, collection_name: &str) -> String {
        format!(
            "{}.{}",
            Self::quoted(db_name),
            Self::quoted(collection_name)
        )
    }

    fn decode_result(document: serde_json::Value) -> Result<ScanResult, PersistenceError> {
        Ok(serde_json::from_value(document)?)
    }
}

#[async_trait]
impl PersistenceProvider for PgDocumentStore {
    async fn insert_bulk_scan(
        &self,
        db_name: &str,
        bulk_scan: &BulkScan,
    ) -> Result<(), PersistenceError> {
        self.ensure_bulk_scan_collection(db_name).await?;

        let table = format!(
            "{}.{}",
            Self::quoted(db_name),
            Self::quoted(BULK_SCAN_COLLECTION)
        );
        let query = format!(
            r#"
INSERT INTO {table} (id, document, updated_at)
VALUES ($1, $2, NOW())
ON CONFLICT (id) DO UPDATE SET document = EXCLUDED.document, updated_at = NOW()
            "#
        );

        sqlx::query(&query)
            .bind(&bulk_scan.id)
            .bind(serde_json::to_value(bulk_scan)?)
            .execute(&self.pool)
            .await
            .map_err(|error| PersistenceError::Query {
                command: "INSERT".to_owned(),
                error,
            })?;
        Ok(())
    }

    async fn update_bulk_scan(
        &self,
        db_name: &str,
        bulk_scan: &BulkScan,
    ) -> Result<(), PersistenceError> {
        // The insert is already a replace-by-id; readers see one version.
        self.insert_bulk_scan(db_name, bulk_scan).await
    }

    async fn insert_scan_result(
        &self,
        result: &ScanResult,
        job: &ScanJobDescription,
    ) -> Result<(), PersistenceError> {
        check_status_match(result, job)?;

        let db_name = &job.bulk_scan_info.db_name;
        let collection_name = &job.bulk_scan_info.collection_name;
        let document = self.modules.apply(serde_json::to_value(result)?);

        self.ensure_result_collection(db_name, collection_name).await?;

        let table = Self::result_table(db_name, collection_name);
        let query = format!(
            r#"
INSERT INTO {table}
    (id, bulk_scan_id, created_at, status, target_hostname, target_ip, document)
VALUES
    ($1, $2, $3, $4, $5, $6, $7)
ON CONFLICT (id) DO NOTHING
            "#
        );

        sqlx::query(&query)
            .bind(result.id)
            .bind(&result.bulk_scan_id)
            .bind(result.timestamp)
            .bind(result.status.to_string())
            .bind(result.target.hostname.as_deref())
            .bind(result.target.ip.map(|ip| ip.to_string()))
            .bind(&document)
            .execute(&self.pool)
            .await
            .map_err(|error| PersistenceError::Query {
                command: "INSERT".to_owned(),
                error,
            })?;
        Ok(())
    }

    async fn get_scan_result_by_id(
        &self,
        db_name: &str,
        collection_name: &str,
        id: Uuid,
    ) -> Result<Option<ScanResult>, PersistenceError> {
        self.ensure_result_collection(db_name, collection_name).await?;

        let table = Self::result_table(db_name, collection_name);
        let query = format!("SELECT document FROM {table} WHERE id = $1");

        let row: Option<(serde_json::Value,)> = sqlx::query_as(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| PersistenceError::Query {
                command: "SELECT".to_owned(),
                error,
            })?;

        row.map(|(document,)| Self::decode_result(document)).transpose()
    }

    async fn get_scan_results_by_target(
        &self,
        db_name: &str,
        collection_name: &str,
        target: &str,
    ) -> Result<Vec<ScanResult>, PersistenceError> {
        self.ensure_result_collection(db_name, collection_name).await?;

        let table = Self::result_table(db_name, collection_name);
        let query = format!(
            "SELECT document FROM {table} WHERE target_hostname = $1 OR target_ip = $1"
        );

        let rows: Vec<(serde_json::Value,)> = sqlx::query_as(&query)
            .bind(target)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| PersistenceError::Query {
                command: "SELECT".to_owned(),
                error,
            })?;

        rows.into_iter()
            .map(|(document,)| Self::decode_result(document))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(PgDocumentStore::quoted("tls_scans"), "\"tls_scans\"");
        assert_eq!(
            PgDocumentStore::quoted("odd\"name"),
            "\"odd\"\"name\""
        );
        assert_eq!(
            PgDocumentStore::result_table("tls-2026", "results"),
            "\"tls-2026\".\"results\""
        );
    }
}
