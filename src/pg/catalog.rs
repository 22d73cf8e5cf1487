//! Catalog source backed by `pg_class` / `pg_rewrite` / `pg_depend`.

use async_trait::async_trait;
use tokio_postgres::Client;

use crate::catalog::{CatalogSource, Table, View};
use crate::error::ViewMatError;

/// Views in a schema, by name.
const LIST_VIEWS_SQL: &str = "\
    SELECT n.nspname::text, c.relname::text \
    FROM pg_class c \
    JOIN pg_namespace n ON n.oid = c.relnamespace \
    WHERE c.relkind = 'v' AND n.nspname = $1 \
    ORDER BY c.relname";

/// Relations a view reads, with intermediate views expanded down to the
/// relations they read in turn. Views themselves are never returned: they
/// hold no rows to track. `UNION` keeps the recursion finite even if the
/// rules reference each other.
const LIST_SOURCE_TABLES_SQL: &str = "\
    WITH RECURSIVE reads(relid) AS ( \
        SELECT d.refobjid \
        FROM pg_rewrite r \
        JOIN pg_depend d ON d.classid = 'pg_rewrite'::regclass \
                        AND d.objid = r.oid \
                        AND d.refclassid = 'pg_class'::regclass \
        JOIN pg_class v ON v.oid = r.ev_class \
        JOIN pg_namespace vn ON vn.oid = v.relnamespace \
        WHERE vn.nspname = $1 AND v.relname = $2 \
          AND d.refobjid <> r.ev_class \
      UNION \
        SELECT d.refobjid \
        FROM reads \
        JOIN pg_class c ON c.oid = reads.relid AND c.relkind = 'v' \
        JOIN pg_rewrite r ON r.ev_class = c.oid \
        JOIN pg_depend d ON d.classid = 'pg_rewrite'::regclass \
                        AND d.objid = r.oid \
                        AND d.refclassid = 'pg_class'::regclass \
        WHERE d.refobjid <> r.ev_class \
    ) \
    SELECT DISTINCT n.nspname::text, c.relname::text \
    FROM reads \
    JOIN pg_class c ON c.oid = reads.relid \
    JOIN pg_namespace n ON n.oid = c.relnamespace \
    WHERE c.relkind IN ('r', 'p', 'm', 'f') \
    ORDER BY 1, 2";

/// Reads views and their source tables from a live database.
pub struct PgCatalog {
    client: Client,
}

impl PgCatalog {
    pub fn new(client: Client) -> Self {
        PgCatalog { client }
    }
}

#[async_trait]
impl CatalogSource for PgCatalog {
    async fn list_views(&self, view_schema: &str) -> Result<Vec<View>, ViewMatError> {
        let rows = self
            .client
            .query(LIST_VIEWS_SQL, &[&view_schema])
            .await
            .map_err(|e| ViewMatError::CatalogUnavailable(format!("listing views: {e}")))?;

        rows.iter()
            .map(|row| {
                let schema: String = row
                    .try_get(0)
                    .map_err(|e| ViewMatError::CatalogUnavailable(e.to_string()))?;
                let name: String = row
                    .try_get(1)
                    .map_err(|e| ViewMatError::CatalogUnavailable(e.to_string()))?;
                Ok(View::new(schema, name))
            })
            .collect()
    }

    async fn list_source_tables(&self, view: &View) -> Result<Vec<Table>, ViewMatError> {
        let rows = self
            .client
            .query(LIST_SOURCE_TABLES_SQL, &[&view.schema(), &view.name()])
            .await
            .map_err(|e| {
                ViewMatError::CatalogUnavailable(format!("listing sources of {view}: {e}"))
            })?;

        rows.iter()
            .map(|row| {
                let schema: String = row
                    .try_get(0)
                    .map_err(|e| ViewMatError::CatalogUnavailable(e.to_string()))?;
                let name: String = row
                    .try_get(1)
                    .map_err(|e| ViewMatError::CatalogUnavailable(e.to_string()))?;
                Ok(Table::new(schema, name))
            })
            .collect()
    }
}
