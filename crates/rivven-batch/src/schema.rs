//! Schema discovery seam
//!
//! The scanner reads table definitions from a [`SchemaProvider`]; where the
//! definitions come from (information_schema, a schema registry, a static
//! list) is up to the caller.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

use crate::error::Result;
use crate::types::{TableDefinition, TableIdentity};

/// Schema provider for read-only schema discovery
#[async_trait]
pub trait SchemaProvider: Send + Sync {
    /// List all tables in a schema
    async fn list_tables(&self, schema: &str) -> Result<Vec<String>>;

    /// Get table definition
    async fn get_table(&self, schema: &str, table: &str) -> Result<Option<TableDefinition>>;

    /// Check if a table exists
    async fn table_exists(&self, schema: &str, table: &str) -> Result<bool> {
        Ok(self.get_table(schema, table).await?.is_some())
    }
}

/// In-memory schema provider backed by a fixed set of definitions
#[derive(Debug, Default)]
pub struct StaticSchemaProvider {
    tables: RwLock<BTreeMap<TableIdentity, TableDefinition>>,
}

impl StaticSchemaProvider {
    /// Create an empty provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a provider from a list of definitions
    pub fn from_tables(tables: impl IntoIterator<Item = TableDefinition>) -> Self {
        let provider = Self::new();
        for table in tables {
            provider.add_table(table);
        }
        provider
    }

    /// Register or replace a table definition
    pub fn add_table(&self, table: TableDefinition) {
        self.tables.write().insert(table.identity.clone(), table);
    }
}

#[async_trait]
impl SchemaProvider for StaticSchemaProvider {
    async fn list_tables(&self, schema: &str) -> Result<Vec<String>> {
        Ok(self
            .tables
            .read()
            .keys()
            .filter(|id| id.schema == schema)
            .map(|id| id.table.clone())
            .collect())
    }

    async fn get_table(&self, schema: &str, table: &str) -> Result<Option<TableDefinition>> {
        Ok(self
            .tables
            .read()
            .get(&TableIdentity::new(schema, table))
            .cloned())
    }
}
