//! Dirty tracking and lifecycle hook firing order (spec.md §4.15).

use std::collections::HashMap;

use crate::error::{OrmError, OrmResult};
use crate::model::CallbackStage;
use crate::value::Value;

/// Per-instance record of `(original, changed, saved_changes)`, keyed by
/// column name. The core has no static column types, so values travel as
/// [`Value`].
#[derive(Debug, Clone, Default)]
pub struct DirtyTracker {
    original: HashMap<String, Value>,
    changed: HashMap<String, Value>,
    saved_changes: HashMap<String, (Value, Value)>,
    previous_changes: HashMap<String, (Value, Value)>,
}

impl DirtyTracker {
    pub fn loaded(attributes: HashMap<String, Value>) -> Self {
        Self {
            original: attributes,
            changed: HashMap::new(),
            saved_changes: HashMap::new(),
            previous_changes: HashMap::new(),
        }
    }

    pub fn set(&mut self, column: impl Into<String>, value: Value) {
        let column = column.into();
        let original = self.original.get(&column).cloned().unwrap_or(Value::Null);
        if original == value {
            self.changed.remove(&column);
        } else {
            self.changed.insert(column, value);
        }
    }

    pub fn is_changed(&self) -> bool {
        !self.changed.is_empty()
    }

    pub fn column_changed(&self, column: &str) -> bool {
        self.changed.contains_key(column)
    }

    /// `(old, new)` per changed column.
    pub fn changes(&self) -> HashMap<String, (Value, Value)> {
        self.changed
            .iter()
            .map(|(col, new)| {
                let old = self.original.get(col).cloned().unwrap_or(Value::Null);
                (col.clone(), (old, new.clone()))
            })
            .collect()
    }

    pub fn changed_attributes(&self) -> Vec<String> {
        self.changed.keys().cloned().collect()
    }

    /// Discards pending changes for `columns`, or all of them if `None`.
    pub fn restore_attributes(&mut self, columns: Option<&[String]>) {
        match columns {
            None => self.changed.clear(),
            Some(cols) => {
                for col in cols {
                    self.changed.remove(col);
                }
            }
        }
    }

    pub fn saved_changes(&self) -> &HashMap<String, (Value, Value)> {
        &self.saved_changes
    }

    pub fn previous_changes(&self) -> &HashMap<String, (Value, Value)> {
        &self.previous_changes
    }

    /// Called on successful commit: folds pending changes into `original`,
    /// snapshots them as `saved_changes`/`previous_changes`, and clears the
    /// pending set.
    pub fn commit(&mut self) {
        let changes = self.changes();
        for (col, (_, new)) in &changes {
            self.original.insert(col.clone(), new.clone());
        }
        self.previous_changes = changes.clone();
        self.saved_changes = changes;
        self.changed.clear();
    }
}

/// Fires `stage`'s registered callbacks in registration order. The first
/// callback to return `Err(())` aborts the chain; the caller surfaces
/// that as `OrmError::Abort` ("save failed, no exception" per spec.md).
pub fn fire(table: &crate::model::CallbackTable, stage: CallbackStage) -> OrmResult<()> {
    for callback in table.for_stage(stage) {
        if callback().is_err() {
            return Err(OrmError::Abort);
        }
    }
    Ok(())
}

/// Runs the full around-a-write callback sequence (spec.md §4.15):
/// `before_validation -> after_validation -> before_save ->
/// (before_create|before_update) -> [DB I/O] -> (after_create|after_update)
/// -> after_save -> after_commit | after_rollback`. `io` performs the
/// actual write; `committed` tells the caller which terminal stage to
/// fire (only the outermost transaction's commit fires `after_commit`).
pub fn run_write_callbacks<IO>(
    table: &crate::model::CallbackTable,
    is_create: bool,
    io: IO,
) -> OrmResult<WriteOutcome>
where
    IO: FnOnce() -> OrmResult<()>,
{
    fire(table, CallbackStage::BeforeValidation)?;
    fire(table, CallbackStage::AfterValidation)?;
    fire(table, CallbackStage::BeforeSave)?;
    fire(table, if is_create { CallbackStage::BeforeCreate } else { CallbackStage::BeforeUpdate })?;

    io()?;

    fire(table, if is_create { CallbackStage::AfterCreate } else { CallbackStage::AfterUpdate })?;
    fire(table, CallbackStage::AfterSave)?;

    Ok(WriteOutcome { table_has_commit_hooks: !table.for_stage(CallbackStage::AfterCommit).is_empty() })
}

pub struct WriteOutcome {
    pub table_has_commit_hooks: bool,
}

/// Fires `after_commit` only on the outermost transaction's commit, or
/// `after_rollback` if the enclosing transaction rolled back instead.
pub fn fire_terminal(table: &crate::model::CallbackTable, outermost: bool, committed: bool) -> OrmResult<()> {
    if !outermost {
        return Ok(());
    }
    if committed {
        fire(table, CallbackStage::AfterCommit)
    } else {
        fire(table, CallbackStage::AfterRollback)
    }
}
