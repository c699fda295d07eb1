//! Connector traits - abstract interface for sources and the warehouse
//!
//! Implementations:
//! - `PgSource` / `PgWarehouse`: PostgreSQL through sqlx
//! - `SqliteSource` / `SqliteWarehouse`: local SQLite files through rusqlite

use crate::config::SourceConfig;
use crate::error::Result;
use crate::etl::records::{BranchRecord, FactRow, MovieRecord, RawSale, SalesAggregate};
use async_trait::async_trait;
use chrono::NaiveDate;
use futures::stream::BoxStream;

/// What an insert does when the row collides with an existing one
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// A unique-key collision is reported as `EtlError::InsertConflict`
    Fail,
    /// A unique-key collision is absorbed and the row is not written
    IgnoreDuplicate,
    /// Plain insert; the table is not expected to enforce uniqueness
    None,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Ignored,
}

/// Row accepted by [`WarehouseConnector::insert`]
#[derive(Clone, Copy, Debug)]
pub enum WarehouseRow<'a> {
    Movie(&'a MovieRecord),
    Branch {
        country_id: i32,
        branch: &'a BranchRecord,
    },
    Fact(&'a FactRow),
}

impl WarehouseRow<'_> {
    pub fn table(&self) -> WarehouseTable {
        match self {
            WarehouseRow::Movie(_) => WarehouseTable::Movies,
            WarehouseRow::Branch { .. } => WarehouseTable::Branches,
            WarehouseRow::Fact(_) => WarehouseTable::Facts,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WarehouseTable {
    Movies,
    Branches,
    Facts,
}

impl WarehouseTable {
    pub fn name(&self) -> &'static str {
        match self {
            WarehouseTable::Movies => "dim_pelicula",
            WarehouseTable::Branches => "dim_sucursal",
            WarehouseTable::Facts => "fact_ventas",
        }
    }
}

/// Read-only connection to one regional database.
///
/// Every `stream_*` call re-executes its query; rows are yielded lazily
/// where the backend allows it.
#[async_trait]
pub trait SourceConnector: Send {
    /// Country code of the source
    fn code(&self) -> &str;

    fn stream_movies(&mut self) -> BoxStream<'_, Result<MovieRecord>>;

    fn stream_branches(&mut self) -> BoxStream<'_, Result<BranchRecord>>;

    /// Sales grouped server-side by (date, movie, branch), ascending date
    fn stream_sales(&mut self) -> BoxStream<'_, Result<SalesAggregate>>;

    /// Ungrouped sales joined to their showing
    fn stream_raw_sales(&mut self) -> BoxStream<'_, Result<RawSale>>;

    /// Whether `stream_sales` should be used instead of grouping in the pipeline
    fn supports_grouping(&self) -> bool {
        true
    }

    /// Release the connection.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Read/write connection to the warehouse.
///
/// Writes accumulate in an open transaction until `commit`; dropping the
/// connector without committing discards them.
#[async_trait]
pub trait WarehouseConnector: Send {
    async fn time_key(&mut self, date: NaiveDate) -> Result<Option<i64>>;

    async fn movie_key(&mut self, movie: &MovieRecord) -> Result<Option<i64>>;

    /// Lowest surrogate key among branch rows matching (country, name, city)
    async fn branch_key(&mut self, country_id: i32, branch: &BranchRecord) -> Result<Option<i64>>;

    async fn insert(&mut self, row: WarehouseRow<'_>, policy: ConflictPolicy) -> Result<InsertOutcome>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    async fn count_rows(&mut self, table: WarehouseTable) -> Result<i64>;

    /// Release the connection. Uncommitted writes are rolled back.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Opens connectors for the orchestrator's stages.
#[async_trait]
pub trait ConnectorFactory: Send + Sync {
    async fn open_source(&self, source: &SourceConfig) -> Result<Box<dyn SourceConnector>>;

    async fn open_warehouse(&self) -> Result<Box<dyn WarehouseConnector>>;
}
