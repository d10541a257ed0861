use scylla::client::session::Session;
use scylla::client::session_builder::SessionBuilder;
use std::sync::Arc;

use crate::config::StoreConfig;
use crate::errors::ConnectivityError;

// ============================================================================
// ScyllaDB Session & Schema
// ============================================================================
//
// The session is created once at startup and shared (Arc) by the writer,
// the dead-letter table sink and the store health check. The driver pools
// connections internally, so a single session is safe for concurrent use.
//
// ============================================================================

pub async fn connect(cfg: &StoreConfig) -> Result<Arc<Session>, ConnectivityError> {
    tracing::info!(nodes = ?cfg.nodes, keyspace = %cfg.keyspace, "Connecting to ScyllaDB...");

    let mut builder = SessionBuilder::new().known_nodes(&cfg.nodes);
    if let (Some(user), Some(password)) = (&cfg.username, &cfg.password) {
        builder = builder.user(user, password);
    }

    let session: Session = builder.build().await.map_err(|e| {
        tracing::error!(error = %e, "Cannot connect to ScyllaDB");
        ConnectivityError::new("store", e)
    })?;

    ensure_schema(&session, cfg)
        .await
        .map_err(|e| ConnectivityError::new("store", e))?;

    session
        .use_keyspace(&cfg.keyspace, false)
        .await
        .map_err(|e| ConnectivityError::new("store", e))?;

    tracing::info!(keyspace = %cfg.keyspace, "Connected to ScyllaDB");
    Ok(Arc::new(session))
}

async fn ensure_schema(session: &Session, cfg: &StoreConfig) -> anyhow::Result<()> {
    for statement in schema_statements(cfg) {
        tracing::debug!(statement = %statement, "Applying schema");
        session.query_unpaged(statement, &[]).await?;
    }
    Ok(())
}

/// Identifiers are validated by `AppConfig::validate` before they get here.
pub(crate) fn schema_statements(cfg: &StoreConfig) -> Vec<String> {
    let ks = &cfg.keyspace;
    vec![
        format!(
            "CREATE KEYSPACE IF NOT EXISTS {ks} WITH REPLICATION = \
             {{'class': 'SimpleStrategy', 'replication_factor': {}}}",
            cfg.replication_factor
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {ks}.{} (
                id text PRIMARY KEY,
                username text,
                email text,
                phone text,
                date_of_birth timestamp
            )",
            cfg.table
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {ks}.{} (
                id uuid PRIMARY KEY,
                message_id text,
                record_kind text,
                reason text,
                payload text,
                headers map<text, text>,
                violations text,
                error_message text,
                retry_count int,
                first_seen_at timestamp,
                rejected_at timestamp
            )",
            cfg.dead_letter_table
        ),
    ]
}
