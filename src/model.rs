//! Descriptors consumed from external collaborators.
//!
//! The core never declares model attributes or validators; it only reads a
//! [`ModelDescriptor`] handed to it by whatever layer owns those concerns
//! (spec.md §1, "Deliberately out of scope").

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::query::AssociationPath;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub sql_type: String,
    pub nullable: bool,
    pub pk: bool,
    pub auto: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub table: String,
    pub primary_key: Vec<String>,
    pub columns: Vec<ColumnDescriptor>,
    #[serde(default)]
    pub shard_key_columns: Vec<String>,
    #[serde(default)]
    pub lock_version_column: Option<String>,
    #[serde(default)]
    pub default_scope: Option<String>,
    #[serde(default)]
    pub associations: Vec<AssociationPath>,
    /// Minimum replica age before a read for this model may hit a replica;
    /// falls back to the registry-wide default when unset.
    #[serde(default)]
    pub lag_threshold_ms: Option<u64>,
}

impl ModelDescriptor {
    pub fn is_sharded(&self) -> bool {
        !self.shard_key_columns.is_empty()
    }

    pub fn has_lock_version(&self) -> bool {
        self.lock_version_column.is_some()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Callback event names, in firing order, around a write (spec.md §4.15).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackStage {
    BeforeValidation,
    AfterValidation,
    BeforeSave,
    BeforeCreate,
    BeforeUpdate,
    AfterCreate,
    AfterUpdate,
    AfterSave,
    AfterCommit,
    AfterRollback,
}

pub type Callback = std::sync::Arc<dyn Fn() -> Result<(), ()> + Send + Sync>;

#[derive(Default, Clone)]
pub struct CallbackTable {
    stages: HashMap<CallbackStage, Vec<Callback>>,
}

impl CallbackTable {
    pub fn register(&mut self, stage: CallbackStage, cb: Callback) {
        self.stages.entry(stage).or_default().push(cb);
    }

    pub fn for_stage(&self, stage: CallbackStage) -> &[Callback] {
        self.stages.get(&stage).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

impl std::fmt::Debug for CallbackTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackTable")
            .field("stages", &self.stages.keys().collect::<Vec<_>>())
            .finish()
    }
}

pub trait Validator: Send + Sync {
    fn validate(&self, instance_json: &serde_json::Value, context: &str) -> Result<(), Vec<String>>;
}
