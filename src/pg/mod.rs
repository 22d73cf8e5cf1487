//! PostgreSQL implementations of the catalog source and the gate.
//!
//! Both speak to the server through `tokio-postgres`. [`PgCatalog`] reads
//! view dependencies from the system catalogs; [`PgGate`] materializes
//! views with statement-level change triggers and per-table version
//! counters.

mod catalog;
mod gate;

pub use catalog::PgCatalog;
pub use gate::PgGate;

use tokio_postgres::{Client, NoTls};
use tracing::error;

use crate::error::ViewMatError;

/// Connect to `url` and drive the connection on a background task.
pub async fn connect(url: &str) -> Result<Client, ViewMatError> {
    let (client, connection) = tokio_postgres::connect(url, NoTls)
        .await
        .map_err(|e| ViewMatError::Connection(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!(error = %e, "pg_viewmat: postgres connection closed");
        }
    });

    Ok(client)
}

/// Quote a string literal for SQL text that cannot take bind parameters
/// (DDL, PL/pgSQL bodies).
pub(crate) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
