//! Dialect-aware SQL executor wrapping a connection pool (spec.md §4.1).
//!
//! Confines every Postgres/MySQL/SQLite difference to this module:
//! identifier/value quoting, lock-suffix emission, and capability flags.
//! Everything above the adapter (assembler, router, transaction manager)
//! is dialect-agnostic.

pub mod driver;

use std::sync::Arc;
use std::time::Instant;

use crate::adapter::driver::ExecResult;
use crate::error::{OrmError, OrmResult};
use crate::events::{self, Event};
use crate::pool::Pool;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    Postgres,
    MySql,
    Sqlite,
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Dialect::Postgres => "postgres",
            Dialect::MySql => "mysql",
            Dialect::Sqlite => "sqlite",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Update,
    Share,
    UpdateNoWait,
    UpdateSkipLocked,
    ShareNoWait,
    ShareSkipLocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Isolation {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl Dialect {
    pub fn quote_identifier(&self, name: &str) -> String {
        match self {
            Dialect::MySql => format!("`{}`", name.replace('`', "``")),
            Dialect::Postgres | Dialect::Sqlite => format!("\"{}\"", name.replace('"', "\"\"")),
        }
    }

    pub fn quote_value(&self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => {
                if matches!(self, Dialect::Sqlite) {
                    if *b { "1".to_string() } else { "0".to_string() }
                } else {
                    b.to_string()
                }
            }
            Value::Int(i) => i.to_string(),
            Value::Float(x) => x.to_string(),
            Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
            Value::Bytes(b) => format!("x'{}'", b.iter().map(|x| format!("{x:02x}")).collect::<String>()),
        }
    }

    pub fn supports_lock_mode(&self, mode: LockMode) -> bool {
        match self {
            Dialect::Postgres => true,
            Dialect::MySql => matches!(mode, LockMode::Update | LockMode::Share),
            Dialect::Sqlite => false,
        }
    }

    pub fn supports_isolation(&self, isolation: Isolation) -> bool {
        match self {
            Dialect::Postgres => true,
            Dialect::MySql => true,
            Dialect::Sqlite => matches!(isolation, Isolation::Serializable),
        }
    }

    pub fn supports_savepoints(&self) -> bool {
        true // Postgres, MySQL, and SQLite all support SAVEPOINT
    }

    pub fn supports_skip_locked(&self) -> bool {
        matches!(self, Dialect::Postgres)
    }

    pub fn supports_nowait(&self) -> bool {
        matches!(self, Dialect::Postgres)
    }

    /// Emits the lock suffix for `mode`, or an empty string when the
    /// dialect has no row-level lock syntax (SQLite). Never silently
    /// downgrades an unsupported *combination* (NOWAIT/SKIP LOCKED on a
    /// dialect that lacks it) — that raises [`OrmError::UnsupportedLockMode`].
    pub fn emit_lock_suffix(&self, mode: LockMode) -> OrmResult<String> {
        if matches!(self, Dialect::Sqlite) {
            return Ok(String::new());
        }
        if !self.supports_lock_mode(mode) {
            return Err(OrmError::UnsupportedLockMode {
                mode: format!("{mode:?}"),
                dialect: self.to_string(),
            });
        }
        let needs_nowait = matches!(mode, LockMode::UpdateNoWait | LockMode::ShareNoWait);
        let needs_skip = matches!(mode, LockMode::UpdateSkipLocked | LockMode::ShareSkipLocked);
        if needs_nowait && !self.supports_nowait() {
            return Err(OrmError::UnsupportedLockMode {
                mode: format!("{mode:?}"),
                dialect: self.to_string(),
            });
        }
        if needs_skip && !self.supports_skip_locked() {
            return Err(OrmError::UnsupportedLockMode {
                mode: format!("{mode:?}"),
                dialect: self.to_string(),
            });
        }
        Ok(match (self, mode) {
            (Dialect::MySql, LockMode::Share) => "LOCK IN SHARE MODE".to_string(),
            (Dialect::MySql, LockMode::Update) => "FOR UPDATE".to_string(),
            (Dialect::Postgres, LockMode::Update) => "FOR UPDATE".to_string(),
            (Dialect::Postgres, LockMode::Share) => "FOR SHARE".to_string(),
            (Dialect::Postgres, LockMode::UpdateNoWait) => "FOR UPDATE NOWAIT".to_string(),
            (Dialect::Postgres, LockMode::UpdateSkipLocked) => "FOR UPDATE SKIP LOCKED".to_string(),
            (Dialect::Postgres, LockMode::ShareNoWait) => "FOR SHARE NOWAIT".to_string(),
            (Dialect::Postgres, LockMode::ShareSkipLocked) => "FOR SHARE SKIP LOCKED".to_string(),
            _ => unreachable!("capability checks above exhaust unsupported combinations"),
        })
    }

    pub fn begin_sql(&self, isolation: Option<Isolation>) -> OrmResult<String> {
        match isolation {
            None => Ok("BEGIN".to_string()),
            Some(iso) => {
                if !self.supports_isolation(iso) {
                    return Err(OrmError::UnsupportedIsolation {
                        isolation: format!("{iso:?}"),
                        dialect: self.to_string(),
                    });
                }
                let level = match iso {
                    Isolation::ReadUncommitted => "READ UNCOMMITTED",
                    Isolation::ReadCommitted => "READ COMMITTED",
                    Isolation::RepeatableRead => "REPEATABLE READ",
                    Isolation::Serializable => "SERIALIZABLE",
                };
                Ok(format!("BEGIN ISOLATION LEVEL {level}"))
            }
        }
    }
}

/// A named, pooled, dialect-aware adapter: `(database, role, shard)`
/// identity plus the pool and dialect that serve it.
pub struct Adapter {
    pub key: String,
    pub dialect: Dialect,
    pub pool: Arc<Pool>,
}

impl Adapter {
    pub fn new(key: impl Into<String>, dialect: Dialect, pool: Arc<Pool>) -> Arc<Self> {
        Arc::new(Self {
            key: key.into(),
            dialect,
            pool,
        })
    }

    /// `is_write` gates the `prevent_writes` context scope (spec.md §4.7):
    /// a write issued anywhere under [`crate::context::while_preventing_writes`]
    /// is rejected before it reaches the pool, whether or not it is also
    /// wrapped in an explicit transaction.
    pub async fn execute(&self, sql: &str, params: &[Value], is_write: bool) -> OrmResult<ExecResult> {
        let ctx = crate::context::current();
        if let Some(open) = ctx.open_tx_adapter {
            if open != self.key {
                return Err(OrmError::CrossAdapterWriteInTransaction);
            }
        }
        if is_write && ctx.prevent_writes {
            return Err(OrmError::ReadOnlyError);
        }
        let start = Instant::now();
        let mut guard = self.pool.checkout().await?;
        let result = guard.connection().execute(sql, params)?;
        events::emit(Event::SqlExecuted {
            database: self.key.clone(),
            role: String::new(),
            shard: None,
            sql: sql.to_string(),
            duration: start.elapsed(),
        });
        Ok(result)
    }

    pub fn quote_identifier(&self, name: &str) -> String {
        self.dialect.quote_identifier(name)
    }

    pub fn quote_value(&self, value: &Value) -> String {
        self.dialect.quote_value(value)
    }
}

impl std::fmt::Debug for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapter")
            .field("key", &self.key)
            .field("dialect", &self.dialect)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_has_no_lock_suffix() {
        assert_eq!(Dialect::Sqlite.emit_lock_suffix(LockMode::Update).unwrap(), "");
    }

    #[test]
    fn mysql_rejects_skip_locked() {
        let err = Dialect::MySql.emit_lock_suffix(LockMode::UpdateSkipLocked).unwrap_err();
        assert!(matches!(err, OrmError::UnsupportedLockMode { .. }));
    }

    #[test]
    fn postgres_emits_for_share_nowait() {
        assert_eq!(
            Dialect::Postgres.emit_lock_suffix(LockMode::ShareNoWait).unwrap(),
            "FOR SHARE NOWAIT"
        );
    }

    #[test]
    fn mysql_share_uses_legacy_syntax() {
        assert_eq!(
            Dialect::MySql.emit_lock_suffix(LockMode::Share).unwrap(),
            "LOCK IN SHARE MODE"
        );
    }

    #[test]
    fn quoting_is_dialect_specific() {
        assert_eq!(Dialect::MySql.quote_identifier("user"), "`user`");
        assert_eq!(Dialect::Postgres.quote_identifier("user"), "\"user\"");
    }
}
