//! ETL Orchestrator - runs the fixed stage sequence over every source
//!
//! INIT -> LOAD_DIMENSIONS(each source) -> LOAD_FACTS(each source) -> VERIFY -> DONE
//!
//! Every stage opens its own connections and closes them before returning,
//! whatever the outcome. The first failing stage aborts the run; work that
//! earlier stages committed stays in the warehouse.

use crate::config::{Backend, EtlConfig, SourceConfig};
use crate::error::{EtlError, Result};
use crate::etl::connector::{ConnectorFactory, SourceConnector, WarehouseConnector, WarehouseTable};
use crate::etl::dimension_loader::{DimensionLoadReport, DimensionLoader};
use crate::etl::fact_aggregator::FactAggregator;
use crate::etl::fact_loader::{FactLoadReport, FactLoader};
use crate::etl::postgres::PgConnectorFactory;
use crate::etl::sqlite::SqliteConnectorFactory;
use crate::observability::{CountryCounters, EtlMetrics};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Stage {
    Init,
    LoadDimensions(String),
    LoadFacts(String),
    Verify,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Init => write!(f, "INIT"),
            Stage::LoadDimensions(code) => write!(f, "LOAD_DIMENSIONS({})", code),
            Stage::LoadFacts(code) => write!(f, "LOAD_FACTS({})", code),
            Stage::Verify => write!(f, "VERIFY"),
            Stage::Done => write!(f, "DONE"),
        }
    }
}

/// Movie and branch results of one LOAD_DIMENSIONS stage
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionReports {
    pub movies: DimensionLoadReport,
    pub branches: DimensionLoadReport,
}

/// Row counts read back in the VERIFY stage
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub movies: i64,
    pub branches: i64,
    pub facts: i64,
}

#[derive(Clone, Debug)]
pub struct RunReport {
    pub run_id: String,
    pub dimensions: BTreeMap<String, DimensionReports>,
    pub facts: BTreeMap<String, FactLoadReport>,
    pub verification: VerificationReport,
    pub metrics: BTreeMap<String, CountryCounters>,
    pub elapsed: Duration,
}

#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<EtlConfig>,
    factory: Arc<dyn ConnectorFactory>,
    metrics: EtlMetrics,
}

impl Orchestrator {
    pub fn new(config: EtlConfig, factory: Arc<dyn ConnectorFactory>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            factory,
            metrics: EtlMetrics::new(),
        })
    }

    /// Orchestrator wired to the connectors of `config.backend`.
    pub fn from_config(config: EtlConfig) -> Result<Self> {
        let factory: Arc<dyn ConnectorFactory> = match config.backend {
            Backend::Postgres => Arc::new(PgConnectorFactory::new(config.warehouse_url.clone())),
            Backend::Sqlite => Arc::new(SqliteConnectorFactory::new(config.warehouse_url.clone())),
        };
        Self::new(config, factory)
    }

    pub fn config(&self) -> &EtlConfig {
        &self.config
    }

    pub fn metrics(&self) -> &EtlMetrics {
        &self.metrics
    }

    pub async fn run(&self) -> Result<RunReport> {
        let started = Instant::now();
        let run_id = Uuid::new_v4().to_string();
        info!(run_id = %run_id, stage = %Stage::Init, sources = self.config.sources.len(), "ETL run starting");

        let mut dimensions = BTreeMap::new();
        for source in &self.config.sources {
            let stage = Stage::LoadDimensions(source.code.clone());
            info!(run_id = %run_id, stage = %stage, "stage starting");
            let report = self
                .load_dimensions(source)
                .await
                .map_err(|e| self.fail(&run_id, &stage, e))?;
            dimensions.insert(source.code.clone(), report);
        }

        let facts = if self.config.concurrent_sources {
            self.load_facts_concurrently(&run_id).await?
        } else {
            self.load_facts_sequentially(&run_id).await?
        };

        info!(run_id = %run_id, stage = %Stage::Verify, "stage starting");
        let verification = self
            .verify()
            .await
            .map_err(|e| self.fail(&run_id, &Stage::Verify, e))?;

        let elapsed = started.elapsed();
        info!(
            run_id = %run_id,
            stage = %Stage::Done,
            elapsed_secs = elapsed.as_secs_f64(),
            "ETL run completed"
        );

        Ok(RunReport {
            run_id,
            dimensions,
            facts,
            verification,
            metrics: self.metrics.snapshot(),
            elapsed,
        })
    }

    async fn load_facts_sequentially(&self, run_id: &str) -> Result<BTreeMap<String, FactLoadReport>> {
        let mut facts = BTreeMap::new();
        for source in &self.config.sources {
            let stage = Stage::LoadFacts(source.code.clone());
            info!(run_id = %run_id, stage = %stage, "stage starting");
            let report = self
                .load_facts(source)
                .await
                .and_then(|report| self.check_skipped(source, report))
                .map_err(|e| self.fail(run_id, &stage, e))?;
            facts.insert(source.code.clone(), report);
        }
        Ok(facts)
    }

    /// One task per source, joined before VERIFY. Each task writes through
    /// its own warehouse connection.
    async fn load_facts_concurrently(&self, run_id: &str) -> Result<BTreeMap<String, FactLoadReport>> {
        let mut tasks = JoinSet::new();
        for source in &self.config.sources {
            let this = self.clone();
            let source = source.clone();
            info!(run_id = %run_id, stage = %Stage::LoadFacts(source.code.clone()), "stage starting");
            tasks.spawn(async move {
                let result = this
                    .load_facts(&source)
                    .await
                    .and_then(|report| this.check_skipped(&source, report));
                (source.code, result)
            });
        }

        let mut facts = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            let (code, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    tasks.abort_all();
                    return Err(EtlError::Task(e.to_string()));
                }
            };
            match result {
                Ok(report) => {
                    facts.insert(code, report);
                }
                Err(e) => {
                    tasks.abort_all();
                    return Err(self.fail(run_id, &Stage::LoadFacts(code), e));
                }
            }
        }
        Ok(facts)
    }

    fn fail(&self, run_id: &str, stage: &Stage, err: EtlError) -> EtlError {
        error!(run_id = %run_id, stage = %stage, error = %err, "stage failed, aborting run");
        err.in_stage(stage)
    }

    fn check_skipped(&self, source: &SourceConfig, report: FactLoadReport) -> Result<FactLoadReport> {
        match self.config.max_skipped_ratio {
            Some(limit) if report.skipped_ratio() > limit => Err(EtlError::SkipThresholdExceeded {
                country: source.code.clone(),
                skipped: report.skipped.len() as u64,
                read: report.aggregates_read,
                limit,
            }),
            _ => Ok(report),
        }
    }

    /// LOAD_DIMENSIONS for one source: movies, then branches.
    pub async fn load_dimensions(&self, source_config: &SourceConfig) -> Result<DimensionReports> {
        let (mut source, mut warehouse) = self.open_stage_connectors(source_config).await?;
        let loader = DimensionLoader::new(self.config.dedupe_branches, self.metrics.clone());

        let result = async {
            let movies = loader.load_movies(source.as_mut(), warehouse.as_mut()).await?;
            let branches = loader
                .load_branches(source_config, source.as_mut(), warehouse.as_mut())
                .await?;
            Ok::<_, EtlError>(DimensionReports { movies, branches })
        }
        .await;

        release(&source_config.code, source, warehouse, result).await
    }

    /// LOAD_FACTS for one source.
    pub async fn load_facts(&self, source_config: &SourceConfig) -> Result<FactLoadReport> {
        let (mut source, mut warehouse) = self.open_stage_connectors(source_config).await?;
        let loader = FactLoader::new(
            self.config.batch_size,
            self.config.progress_every,
            self.metrics.clone(),
        );
        let mut aggregator = FactAggregator::new(source_config);

        let result = loader
            .load(&mut aggregator, source.as_mut(), warehouse.as_mut())
            .await;

        release(&source_config.code, source, warehouse, result).await
    }

    /// Read-only row counts of the warehouse tables this pipeline writes.
    pub async fn verify(&self) -> Result<VerificationReport> {
        let mut warehouse = self.factory.open_warehouse().await?;

        let result = async {
            Ok::<_, EtlError>(VerificationReport {
                movies: warehouse.count_rows(WarehouseTable::Movies).await?,
                branches: warehouse.count_rows(WarehouseTable::Branches).await?,
                facts: warehouse.count_rows(WarehouseTable::Facts).await?,
            })
        }
        .await;

        let closed = warehouse.close().await;
        let report = result?;
        closed?;

        info!(
            dim_pelicula = report.movies,
            dim_sucursal = report.branches,
            fact_ventas = report.facts,
            "warehouse row counts"
        );
        Ok(report)
    }

    async fn open_stage_connectors(
        &self,
        source_config: &SourceConfig,
    ) -> Result<(Box<dyn SourceConnector>, Box<dyn WarehouseConnector>)> {
        let source = self.factory.open_source(source_config).await?;
        match self.factory.open_warehouse().await {
            Ok(warehouse) => Ok((source, warehouse)),
            Err(e) => {
                if let Err(close_err) = source.close().await {
                    error!(source = %source_config.code, error = %close_err, "closing source failed");
                }
                Err(e)
            }
        }
    }
}

/// Close both connectors, then surface the stage result ahead of any
/// close error. Close errors behind a failed stage are logged.
async fn release<T>(
    code: &str,
    source: Box<dyn SourceConnector>,
    warehouse: Box<dyn WarehouseConnector>,
    result: Result<T>,
) -> Result<T> {
    let source_closed = source.close().await;
    let warehouse_closed = warehouse.close().await;
    if result.is_err() {
        if let Err(e) = &source_closed {
            warn!(source = %code, error = %e, "closing source after failed stage");
        }
        if let Err(e) = &warehouse_closed {
            warn!(source = %code, error = %e, "closing warehouse after failed stage");
        }
    }
    let value = result?;
    source_closed?;
    warehouse_closed?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names() {
        assert_eq!(Stage::Init.to_string(), "INIT");
        assert_eq!(Stage::LoadDimensions("GT".to_string()).to_string(), "LOAD_DIMENSIONS(GT)");
        assert_eq!(Stage::LoadFacts("SV".to_string()).to_string(), "LOAD_FACTS(SV)");
        assert_eq!(Stage::Verify.to_string(), "VERIFY");
        assert_eq!(Stage::Done.to_string(), "DONE");
    }

    #[test]
    fn test_new_validates_config() {
        let mut config = EtlConfig::default();
        config.batch_size = 0;
        assert!(matches!(Orchestrator::from_config(config), Err(EtlError::Config(_))));
    }
}
