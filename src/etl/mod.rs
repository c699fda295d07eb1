//! ETL Module - moves regional sales into the dimensional warehouse
//!
//! - Source/warehouse connectors (Postgres and SQLite)
//! - Dimension loading with per-dimension conflict policies
//! - Fact aggregation and surrogate-key resolution
//! - Batched, per-batch transactional fact loading
//! - Stage orchestration and verification

pub mod connector;
pub mod dimension_loader;
pub mod fact_aggregator;
pub mod fact_loader;
pub mod orchestrator;
pub mod postgres;
pub mod records;
pub mod sql;
pub mod sqlite;

pub use connector::{
    ConflictPolicy, ConnectorFactory, InsertOutcome, SourceConnector, WarehouseConnector, WarehouseRow,
    WarehouseTable,
};
pub use dimension_loader::{DimensionLoadReport, DimensionLoader};
pub use fact_aggregator::{group_sales, FactAggregator, Resolution};
pub use fact_loader::{FactLoadReport, FactLoader};
pub use orchestrator::{DimensionReports, Orchestrator, RunReport, Stage, VerificationReport};
pub use postgres::{PgConnectorFactory, PgSource, PgWarehouse};
pub use records::{BranchRecord, FactRow, MovieRecord, RawSale, SalesAggregate, SkipReason, SkippedFact};
pub use sqlite::{SqliteConnectorFactory, SqliteSource, SqliteWarehouse};
