//! Catalog snapshot: views, the tables they read, and the source trait.
//!
//! The scheduler never inspects SQL. It asks a [`CatalogSource`] which views
//! exist in the view schema and which tables each one reads, once, at
//! startup. The result is an ordered `Vec<ViewSources>` whose order is the
//! discovery order used for deterministic tie-breaking later on.

use std::collections::HashSet;
use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::error::ViewMatError;

/// Quote a SQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// A schema-qualified relation name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RelName {
    pub schema: String,
    pub name: String,
}

impl RelName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        RelName {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// `"schema"."name"`, safe to splice into SQL.
    pub fn quoted(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
    }
}

impl fmt::Display for RelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// A logical view to materialize.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct View(RelName);

impl View {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        View(RelName::new(schema, name))
    }

    pub fn schema(&self) -> &str {
        &self.0.schema
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn rel(&self) -> &RelName {
        &self.0
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A table a view reads: either a raw source table or the materialized
/// output table of another view.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Table(RelName);

impl Table {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Table(RelName::new(schema, name))
    }

    pub fn schema(&self) -> &str {
        &self.0.schema
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn rel(&self) -> &RelName {
        &self.0
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A view together with every table it reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViewSources {
    pub view: View,
    /// In catalog order, without duplicates.
    pub tables: Vec<Table>,
}

impl ViewSources {
    pub fn new(view: View, tables: impl IntoIterator<Item = Table>) -> Self {
        let mut seen = HashSet::new();
        let tables = tables
            .into_iter()
            .filter(|t| seen.insert(t.clone()))
            .collect();
        ViewSources { view, tables }
    }
}

/// Read access to the database catalog.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// List the views defined in `view_schema`, in a stable order.
    async fn list_views(&self, view_schema: &str) -> Result<Vec<View>, ViewMatError>;

    /// List every table `view` reads.
    async fn list_source_tables(&self, view: &View) -> Result<Vec<Table>, ViewMatError>;
}

/// Read the catalog snapshot the schedule is built from.
///
/// Fails with [`ViewMatError::EmptyCatalog`] when the view schema holds no
/// views; there is nothing to schedule.
pub async fn load_snapshot(
    catalog: &dyn CatalogSource,
    view_schema: &str,
) -> Result<Vec<ViewSources>, ViewMatError> {
    let views = catalog.list_views(view_schema).await?;
    if views.is_empty() {
        return Err(ViewMatError::EmptyCatalog(view_schema.to_string()));
    }

    let mut snapshot = Vec::with_capacity(views.len());
    for view in views {
        let tables = catalog.list_source_tables(&view).await?;
        debug!(view = %view, tables = tables.len(), "pg_viewmat: read view sources");
        snapshot.push(ViewSources::new(view, tables));
    }
    Ok(snapshot)
}
