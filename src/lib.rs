//! pg_viewmat — dependency-aware materialization of PostgreSQL views.
//!
//! Every view in a configured schema is copied into a plain table of the
//! same name in a materialized schema. Views may read other views' output
//! tables, so refreshes run in dependency order: a view is recomputed only
//! after every output table it reads has been refreshed in the same pass.
//!
//! # Pipeline
//!
//! 1. [`catalog`] loads a snapshot of views and the tables each one reads.
//! 2. [`dag`] builds the dependency graph and ranks it into a [`Schedule`].
//! 3. [`scheduler`] prepares output tables and change tracking through a
//!    [`MaterializationGate`], then runs refresh passes whenever its
//!    [`PassTrigger`] fires.
//! 4. [`pg`] provides the PostgreSQL-backed catalog source and gate.
//!
//! The catalog is read once at startup. Views created or dropped later are
//! picked up by restarting the process.

pub mod catalog;
pub mod config;
pub mod dag;
pub mod error;
pub mod monitor;
pub mod pg;
pub mod policy;
pub mod refresh;
pub mod scheduler;

pub use catalog::{CatalogSource, Table, View, ViewSources};
pub use config::SchedulerConfig;
pub use dag::{Schedule, ScheduleEntry, ViewDag, output_table_for};
pub use error::ViewMatError;
pub use policy::{PassTrigger, SchedulePolicy};
pub use refresh::{MaterializationGate, RefreshOutcome};
pub use scheduler::{RunSummary, Scheduler};
