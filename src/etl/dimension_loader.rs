//! Dimension Loader - copies movies and branches from a source into the
//! warehouse dimensions.
//!
//! Movies are idempotent through the warehouse's natural-key constraint.
//! Branches are appended on every run unless `dedupe_branches` is set.

use crate::config::SourceConfig;
use crate::error::Result;
use crate::etl::connector::{ConflictPolicy, InsertOutcome, SourceConnector, WarehouseConnector, WarehouseRow};
use crate::observability::EtlMetrics;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Counts for one dimension of one source
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionLoadReport {
    pub extracted: u64,
    pub inserted: u64,
    pub ignored: u64,
}

impl DimensionLoadReport {
    fn record(&mut self, outcome: InsertOutcome) {
        match outcome {
            InsertOutcome::Inserted => self.inserted += 1,
            InsertOutcome::Ignored => self.ignored += 1,
        }
    }
}

pub struct DimensionLoader {
    dedupe_branches: bool,
    metrics: EtlMetrics,
}

impl DimensionLoader {
    pub fn new(dedupe_branches: bool, metrics: EtlMetrics) -> Self {
        Self {
            dedupe_branches,
            metrics,
        }
    }

    /// Load every movie of `source`, ignoring natural-key duplicates, then commit.
    pub async fn load_movies(
        &self,
        source: &mut dyn SourceConnector,
        warehouse: &mut dyn WarehouseConnector,
    ) -> Result<DimensionLoadReport> {
        let code = source.code().to_string();
        info!(source = %code, "extracting movies");

        let mut report = DimensionLoadReport::default();
        let mut movies = source.stream_movies();
        while let Some(movie) = movies.next().await {
            let movie = movie?;
            report.extracted += 1;
            let outcome = warehouse
                .insert(WarehouseRow::Movie(&movie), ConflictPolicy::IgnoreDuplicate)
                .await?;
            report.record(outcome);
        }
        drop(movies);

        warehouse.commit().await?;
        self.metrics.record_movies_extracted(&code, report.extracted);

        info!(
            source = %code,
            extracted = report.extracted,
            inserted = report.inserted,
            ignored = report.ignored,
            "movies loaded into dim_pelicula"
        );
        Ok(report)
    }

    /// Load every branch of `source` tagged with its country id, then commit.
    pub async fn load_branches(
        &self,
        source_config: &SourceConfig,
        source: &mut dyn SourceConnector,
        warehouse: &mut dyn WarehouseConnector,
    ) -> Result<DimensionLoadReport> {
        let code = source_config.code.as_str();
        info!(source = %code, "extracting branches");

        if !self.dedupe_branches {
            warn!(
                source = %code,
                "dim_sucursal has no natural-key constraint; re-running this source appends duplicate branch rows"
            );
        }

        let mut report = DimensionLoadReport::default();
        let mut branches = source.stream_branches();
        while let Some(branch) = branches.next().await {
            let branch = branch?;
            report.extracted += 1;

            if self.dedupe_branches
                && warehouse
                    .branch_key(source_config.country_id, &branch)
                    .await?
                    .is_some()
            {
                report.ignored += 1;
                continue;
            }

            let row = WarehouseRow::Branch {
                country_id: source_config.country_id,
                branch: &branch,
            };
            let outcome = warehouse.insert(row, ConflictPolicy::None).await?;
            report.record(outcome);
        }
        drop(branches);

        warehouse.commit().await?;
        self.metrics.record_branches_extracted(code, report.extracted);

        info!(
            source = %code,
            extracted = report.extracted,
            inserted = report.inserted,
            ignored = report.ignored,
            "branches loaded into dim_sucursal"
        );
        Ok(report)
    }
}
