//! Materialization gate with trigger-based change tracking.
//!
//! # Architecture
//!
//! - One statement-level AFTER INSERT/UPDATE/DELETE/TRUNCATE trigger per
//!   tracked table bumps that table's counter in `<work>.table_versions`.
//!   Statement-level triggers keep the write overhead at one row update per
//!   statement regardless of how many rows it touches.
//! - `<work>.refresh_state` stores, per view, a *fingerprint* of its last
//!   successful refresh: the counters of every table it read, the OID of
//!   the output table it wrote, and a hash of the view definition. A
//!   recreated output table, a different materialized schema, or a
//!   redefined view all change the fingerprint, so state left over from an
//!   earlier process never skips work the current output table needs.
//! - A refresh recomputes the output table only when the current
//!   fingerprint differs from the stored one; otherwise it is a no-op.
//! - Output tables are tracked like any other table, so refreshing a view
//!   moves the fingerprint of every view that reads it.
//!
//! The full refresh (`DELETE` + `INSERT ... SELECT`) and the fingerprint
//! update commit in one transaction. Requires PostgreSQL 14 or newer
//! (`CREATE OR REPLACE TRIGGER`).

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_postgres::Client;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::catalog::{RelName, Table, View, quote_ident};
use crate::dag::output_table_for;
use crate::error::ViewMatError;
use crate::pg::quote_literal;
use crate::refresh::{MaterializationGate, RefreshOutcome};

const TRIGGER_NAME: &str = "pg_viewmat_track_changes";

/// Bookkeeping tables and the trigger function, all idempotent.
pub(crate) fn work_schema_ddl(work_schema: &str) -> String {
    let w = quote_ident(work_schema);
    format!(
        "CREATE SCHEMA IF NOT EXISTS {w};
         CREATE TABLE IF NOT EXISTS {w}.table_versions (
             table_schema TEXT NOT NULL,
             table_name   TEXT NOT NULL,
             version      BIGINT NOT NULL DEFAULT 0,
             changed_at   TIMESTAMPTZ,
             PRIMARY KEY (table_schema, table_name)
         );
         CREATE TABLE IF NOT EXISTS {w}.refresh_state (
             view_schema  TEXT NOT NULL,
             view_name    TEXT NOT NULL,
             fingerprint  TEXT NOT NULL,
             refreshed_at TIMESTAMPTZ NOT NULL DEFAULT now(),
             PRIMARY KEY (view_schema, view_name)
         );
         CREATE OR REPLACE FUNCTION {w}.bump_table_version()
         RETURNS trigger LANGUAGE plpgsql AS $$
         BEGIN
             UPDATE {w}.table_versions
                SET version = version + 1, changed_at = now()
              WHERE table_schema = TG_TABLE_SCHEMA AND table_name = TG_TABLE_NAME;
             RETURN NULL;
         END;
         $$;"
    )
}

/// Register `table` and attach the change trigger to it.
pub(crate) fn tracking_ddl(table: &Table, work_schema: &str) -> String {
    let w = quote_ident(work_schema);
    format!(
        "INSERT INTO {w}.table_versions (table_schema, table_name)
         VALUES ({schema}, {name})
         ON CONFLICT DO NOTHING;
         CREATE OR REPLACE TRIGGER {trigger}
         AFTER INSERT OR UPDATE OR DELETE OR TRUNCATE ON {table}
         FOR EACH STATEMENT EXECUTE FUNCTION {w}.bump_table_version();",
        schema = quote_literal(table.schema()),
        name = quote_literal(table.name()),
        trigger = quote_ident(TRIGGER_NAME),
        table = table.rel().quoted(),
    )
}

/// Kind of `table` as `pg_class.relkind`. Bind `$1` to the schema and `$2`
/// to the name.
const RELKIND_SQL: &str = "\
    SELECT c.relkind::text \
    FROM pg_class c \
    JOIN pg_namespace n ON n.oid = c.relnamespace \
    WHERE n.nspname = $1 AND c.relname = $2";

/// Only tables fire statement-level change triggers for every write.
pub(crate) fn check_trackable(relkind: &str) -> Result<(), String> {
    let kind = match relkind {
        "r" | "p" => return Ok(()),
        "m" => "a materialized view",
        "f" => "a foreign table",
        "v" => "a view",
        other => return Err(format!("relation kind '{other}' cannot be tracked")),
    };
    Err(format!(
        "it is {kind}; change tracking needs a table or a partitioned table"
    ))
}

/// Create the output table with the view's shape and no rows.
pub(crate) fn output_table_ddl(view: &View, materialized_schema: &str) -> String {
    let output = output_table_for(view, materialized_schema);
    format!(
        "CREATE SCHEMA IF NOT EXISTS {schema};
         CREATE TABLE IF NOT EXISTS {output} AS SELECT * FROM {view} WITH NO DATA;",
        schema = quote_ident(materialized_schema),
        output = output.rel().quoted(),
        view = view.rel().quoted(),
    )
}

/// Current fingerprint of a refresh: `schema.name=version` pairs of the
/// source tables in name order, then the output table's OID, then the md5
/// of the view definition.
///
/// Bind `$1` to the source schemas, `$2` to the source names, `$3` to the
/// quoted output table and `$4` to the quoted view.
pub(crate) fn fingerprint_sql(work_schema: &str) -> String {
    format!(
        "SELECT concat_ws('|', \
             (SELECT coalesce(string_agg(format('%s.%s=%s', table_schema, table_name, version), ',' \
                                         ORDER BY table_schema, table_name), '') \
              FROM {w}.table_versions \
              WHERE (table_schema, table_name) IN (SELECT * FROM unnest($1::text[], $2::text[]))), \
             'out=' || $3::text::regclass::oid::text, \
             'def=' || md5(pg_get_viewdef($4::text::regclass)))",
        w = quote_ident(work_schema)
    )
}

pub(crate) fn load_fingerprint_sql(work_schema: &str) -> String {
    format!(
        "SELECT fingerprint FROM {w}.refresh_state WHERE view_schema = $1 AND view_name = $2",
        w = quote_ident(work_schema)
    )
}

pub(crate) fn store_fingerprint_sql(work_schema: &str) -> String {
    format!(
        "INSERT INTO {w}.refresh_state (view_schema, view_name, fingerprint) \
         VALUES ($1, $2, $3) \
         ON CONFLICT (view_schema, view_name) \
         DO UPDATE SET fingerprint = EXCLUDED.fingerprint, refreshed_at = now()",
        w = quote_ident(work_schema)
    )
}

/// Gate that materializes views into plain tables of a live database.
pub struct PgGate {
    client: Mutex<Client>,
}

impl PgGate {
    pub fn new(client: Client) -> Self {
        PgGate {
            client: Mutex::new(client),
        }
    }
}

#[async_trait]
impl MaterializationGate for PgGate {
    async fn ensure_output_table(
        &self,
        view: &View,
        materialized_schema: &str,
    ) -> Result<(), ViewMatError> {
        let output = output_table_for(view, materialized_schema);
        self.client
            .lock()
            .await
            .batch_execute(&output_table_ddl(view, materialized_schema))
            .await
            .map_err(|e| ViewMatError::ddl(&output, e))
    }

    async fn enable_change_tracking(
        &self,
        table: &Table,
        work_schema: &str,
    ) -> Result<(), ViewMatError> {
        let client = self.client.lock().await;

        let relkind: String = client
            .query_opt(RELKIND_SQL, &[&table.schema(), &table.name()])
            .await
            .map_err(|e| ViewMatError::ddl(table, e))?
            .ok_or_else(|| ViewMatError::ddl(table, "relation does not exist"))?
            .try_get(0)
            .map_err(|e| ViewMatError::ddl(table, e))?;
        check_trackable(&relkind).map_err(|msg| ViewMatError::ddl(table, msg))?;

        client
            .batch_execute(&work_schema_ddl(work_schema))
            .await
            .map_err(|e| ViewMatError::ddl(RelName::new(work_schema, "table_versions"), e))?;
        client
            .batch_execute(&tracking_ddl(table, work_schema))
            .await
            .map_err(|e| ViewMatError::ddl(table, e))
    }

    async fn refresh(
        &self,
        view: &View,
        tables: &[Table],
        materialized_schema: &str,
        work_schema: &str,
        _cancel: &CancellationToken,
    ) -> Result<RefreshOutcome, ViewMatError> {
        let fail = |e: tokio_postgres::Error| ViewMatError::refresh(view, e);

        let schemas: Vec<String> = tables.iter().map(|t| t.schema().to_string()).collect();
        let names: Vec<String> = tables.iter().map(|t| t.name().to_string()).collect();

        let mut client = self.client.lock().await;
        let tx = client.transaction().await.map_err(fail)?;

        let output = output_table_for(view, materialized_schema).rel().quoted();
        let source = view.rel().quoted();

        let current: String = tx
            .query_one(
                &fingerprint_sql(work_schema),
                &[&schemas, &names, &output, &source],
            )
            .await
            .map_err(fail)?
            .try_get(0)
            .map_err(fail)?;

        let previous: Option<String> = match tx
            .query_opt(&load_fingerprint_sql(work_schema), &[&view.schema(), &view.name()])
            .await
            .map_err(fail)?
        {
            Some(row) => Some(row.try_get(0).map_err(fail)?),
            None => None,
        };

        if previous.as_deref() == Some(current.as_str()) {
            tx.commit().await.map_err(fail)?;
            return Ok(RefreshOutcome::Skipped);
        }

        // A write committed after the fingerprint was read may already be in
        // the copy; the next pass then sees a newer fingerprint and
        // refreshes again.
        tx.execute(&format!("DELETE FROM {output}"), &[])
            .await
            .map_err(fail)?;
        let rows = tx
            .execute(
                &format!("INSERT INTO {output} SELECT * FROM {source}"),
                &[],
            )
            .await
            .map_err(fail)?;
        tx.execute(
            &store_fingerprint_sql(work_schema),
            &[&view.schema(), &view.name(), &current],
        )
        .await
        .map_err(fail)?;
        tx.commit().await.map_err(fail)?;

        debug!(view = %view, rows, fingerprint = %current, "pg_viewmat: recomputed output table");
        Ok(RefreshOutcome::Refreshed { rows })
    }
}
