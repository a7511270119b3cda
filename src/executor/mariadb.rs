//! MariaDB Executor
//!
//! Applies data events to a MariaDB/MySQL server. The payload of each event
//! is SQL text; all events of a group run inside one transaction that is
//! committed when the group ends.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::{MySqlDatabaseError, MySqlPoolOptions};
use sqlx::{MySql, MySqlPool, Transaction};
use tokio::sync::Mutex;

use super::{ApplyEvent, ExecOutcome, Executor};
use crate::config::DatabaseConfig;
use crate::error::Result;

/// MySQL error numbers that warrant retrying the whole group
const ER_LOCK_WAIT_TIMEOUT: u16 = 1205;
const ER_LOCK_DEADLOCK: u16 = 1213;

struct OpenGroup {
    tx: Transaction<'static, MySql>,
    /// Schema selected with `USE` inside the transaction
    schema: Option<String>,
}

/// MariaDB executor for applying replicated events
pub struct MariaDbExecutor {
    pool: MySqlPool,
    group: Mutex<Option<OpenGroup>>,
}

impl MariaDbExecutor {
    /// Create a new executor with a connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        // Server-level URL; each event selects its own schema
        let url = format!(
            "mysql://{}:{}@{}:{}",
            config.user, config.password, config.host, config.port
        );

        let pool = MySqlPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&url)
            .await?;

        tracing::info!("Connected executor to {}:{}", config.host, config.port);
        Ok(Self {
            pool,
            group: Mutex::new(None),
        })
    }

    /// Check if connection is healthy
    pub async fn health_check(&self) -> Result<bool> {
        let result: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(result.0 == 1)
    }

    /// Close the connection pool
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn apply(&self, event: &ApplyEvent) -> std::result::Result<(), sqlx::Error> {
        let mut guard = self.group.lock().await;
        if guard.is_none() {
            *guard = Some(OpenGroup {
                tx: self.pool.begin().await?,
                schema: None,
            });
        }
        let Some(group) = guard.as_mut() else {
            return Err(sqlx::Error::PoolClosed);
        };

        if group.schema.as_deref() != Some(event.schema.as_str()) {
            sqlx::query(&format!("USE `{}`", event.schema.replace('`', "``")))
                .execute(&mut *group.tx)
                .await?;
            group.schema = Some(event.schema.clone());
        }

        let sql = std::str::from_utf8(&event.payload)
            .map_err(|e| sqlx::Error::Protocol(format!("payload is not UTF-8: {}", e)))?;
        for stmt in split_sql_statements(sql) {
            tracing::trace!("Executing: {}", statement_preview(stmt));
            sqlx::query(stmt).execute(&mut *group.tx).await?;
        }

        if event.ends_group {
            if let Some(group) = guard.take() {
                group.tx.commit().await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Executor for MariaDbExecutor {
    async fn execute(&self, event: &ApplyEvent) -> ExecOutcome {
        match self.apply(event).await {
            Ok(()) => ExecOutcome::Committed,
            Err(e) => classify(e),
        }
    }

    async fn finish_group(&self) -> ExecOutcome {
        let group = self.group.lock().await.take();
        match group {
            None => ExecOutcome::Committed,
            Some(group) => match group.tx.commit().await {
                Ok(()) => ExecOutcome::Committed,
                Err(e) => classify(e),
            },
        }
    }

    async fn rollback(&self) {
        if let Some(group) = self.group.lock().await.take() {
            if let Err(e) = group.tx.rollback().await {
                tracing::warn!("Rollback failed: {}", e);
            }
        }
    }

    fn name(&self) -> &'static str {
        "mariadb"
    }
}

/// Map a database error to an apply outcome
fn classify(err: sqlx::Error) -> ExecOutcome {
    let transient = match &err {
        sqlx::Error::Database(db) => db
            .try_downcast_ref::<MySqlDatabaseError>()
            .map_or(false, |e| is_transient_number(e.number())),
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        _ => false,
    };
    if transient {
        ExecOutcome::TransientConflict(err.to_string())
    } else {
        ExecOutcome::Fatal(err.to_string())
    }
}

fn is_transient_number(number: u16) -> bool {
    matches!(number, ER_LOCK_WAIT_TIMEOUT | ER_LOCK_DEADLOCK)
}

/// First 100 characters of a statement, cut on a character boundary
fn statement_preview(stmt: &str) -> &str {
    stmt.char_indices().nth(100).map_or(stmt, |(i, _)| &stmt[..i])
}

/// Split SQL string on semicolons, respecting string literals
/// This handles cases like: "INSERT INTO t VALUES ('a;b'); UPDATE t SET x = 1"
fn split_sql_statements(sql: &str) -> Vec<&str> {
    let mut statements = Vec::new();
    let mut start = 0;
    let mut in_string = false;
    let mut string_char = '"';
    let mut chars = sql.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if in_string {
            // Backslash escapes the next character inside quoted strings
            if c == '\\' && string_char != '`' {
                chars.next();
            } else if c == string_char {
                // Doubled quote is an escaped quote
                if chars.peek().map_or(false, |(_, nc)| *nc == string_char) {
                    chars.next();
                } else {
                    in_string = false;
                }
            }
        } else {
            match c {
                '\'' | '"' | '`' => {
                    in_string = true;
                    string_char = c;
                }
                ';' => {
                    let stmt = sql[start..i].trim();
                    if !stmt.is_empty() {
                        statements.push(stmt);
                    }
                    start = i + 1;
                }
                _ => {}
            }
        }
    }

    let remaining = sql[start..].trim();
    if !remaining.is_empty() {
        statements.push(remaining);
    }

    statements
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_respects_literals() {
        let parts = split_sql_statements("INSERT INTO t VALUES ('a;b'); UPDATE `x;y` SET c = 1;");
        assert_eq!(parts, vec!["INSERT INTO t VALUES ('a;b')", "UPDATE `x;y` SET c = 1"]);
    }

    #[test]
    fn test_split_handles_doubled_quotes() {
        let parts = split_sql_statements("SELECT 'it''s; fine'; SELECT 2");
        assert_eq!(parts, vec!["SELECT 'it''s; fine'", "SELECT 2"]);
    }

    #[test]
    fn test_split_handles_backslash_escapes() {
        let parts = split_sql_statements(r"INSERT INTO t VALUES ('it\'s; x'); SELECT 2");
        assert_eq!(parts, vec![r"INSERT INTO t VALUES ('it\'s; x')", "SELECT 2"]);

        let parts = split_sql_statements(r#"SELECT "a\\"; SELECT 'b'"#);
        assert_eq!(parts, vec![r#"SELECT "a\\""#, "SELECT 'b'"]);
    }

    #[test]
    fn test_statement_preview_stops_on_char_boundary() {
        let stmt = format!("INSERT INTO t VALUES ('{}')", "é".repeat(120));
        let preview = statement_preview(&stmt);
        assert_eq!(preview.chars().count(), 100);
        assert!(stmt.starts_with(preview));

        assert_eq!(statement_preview("SELECT 1"), "SELECT 1");
    }

    #[test]
    fn test_lock_errors_are_transient() {
        assert!(is_transient_number(1213));
        assert!(is_transient_number(1205));
        // duplicate key
        assert!(!is_transient_number(1062));
    }

    #[test]
    fn test_connection_loss_is_transient() {
        let io = sqlx::Error::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"));
        assert!(matches!(classify(io), ExecOutcome::TransientConflict(_)));
        assert!(matches!(
            classify(sqlx::Error::RowNotFound),
            ExecOutcome::Fatal(_)
        ));
    }
}
