use async_trait::async_trait;
use scylla::client::session::Session;
use scylla::errors::{DbError, ExecutionError, RequestAttemptError};
use std::sync::Arc;

use crate::errors::StorageError;
use crate::models::User;

/// Persists validated records. Implementations must upsert on the record's
/// logical key so redelivery never duplicates rows.
#[async_trait]
pub trait Writer<T>: Send + Sync {
    async fn write(&self, record: &T) -> Result<(), StorageError>;
}

// ============================================================================
// ScyllaDB Writer
// ============================================================================
//
// CQL INSERT on a primary key is an upsert: writing the same user twice
// leaves exactly one row with the same column values.
//
// ============================================================================

pub struct ScyllaUserWriter {
    session: Arc<Session>,
    statement: String,
}

impl ScyllaUserWriter {
    pub fn new(session: Arc<Session>, table: &str) -> Self {
        Self {
            session,
            statement: upsert_statement(table),
        }
    }
}

pub(crate) fn upsert_statement(table: &str) -> String {
    format!(
        "INSERT INTO {table} (id, username, email, phone, date_of_birth) VALUES (?, ?, ?, ?, ?)"
    )
}

#[async_trait]
impl Writer<User> for ScyllaUserWriter {
    async fn write(&self, user: &User) -> Result<(), StorageError> {
        self.session
            .query_unpaged(
                self.statement.as_str(),
                (
                    &user.id,
                    &user.username,
                    &user.email,
                    &user.phone,
                    user.date_of_birth,
                ),
            )
            .await
            .map_err(classify)?;

        tracing::debug!(user_id = %user.id, "User upserted");
        Ok(())
    }
}

/// Requests the store will never accept are permanent; everything else
/// (timeouts, overload, lost connections) is worth retrying.
pub(crate) fn classify(err: ExecutionError) -> StorageError {
    let permanent = match &err {
        ExecutionError::BadQuery(_) => true,
        ExecutionError::LastAttemptError(RequestAttemptError::DbError(db_error, _)) => {
            is_permanent_db_error(db_error)
        }
        _ => false,
    };

    if permanent {
        StorageError::Permanent(err.to_string())
    } else {
        StorageError::Unavailable(err.to_string())
    }
}

fn is_permanent_db_error(err: &DbError) -> bool {
    matches!(
        err,
        DbError::SyntaxError | DbError::Invalid | DbError::Unauthorized | DbError::ConfigError
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_user, MemoryWriter};

    #[test]
    fn test_upsert_statement_is_plain_insert() {
        let statement = upsert_statement("users");
        assert!(statement.starts_with("INSERT INTO users (id,"));
        assert!(!statement.contains("IF NOT EXISTS"));
        assert_eq!(statement.matches('?').count(), 5);
    }

    #[test]
    fn test_db_error_classification() {
        assert!(is_permanent_db_error(&DbError::SyntaxError));
        assert!(is_permanent_db_error(&DbError::Invalid));
        assert!(!is_permanent_db_error(&DbError::Overloaded));
        assert!(!is_permanent_db_error(&DbError::ServerError));
    }

    #[tokio::test]
    async fn test_repeated_write_keeps_one_record() {
        let writer = MemoryWriter::default();
        let user = sample_user("u-1");

        writer.write(&user).await.unwrap();
        writer.write(&user).await.unwrap();

        assert_eq!(writer.len(), 1);
        assert_eq!(writer.get("u-1"), Some(user));
    }
}
