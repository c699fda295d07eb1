//! Fact Loader - writes resolved fact rows in fixed-size, individually
//! committed batches.
//!
//! A batch covers `batch_size` aggregated rows, skipped ones included. Each
//! row is its own INSERT; the batch is one transaction. When any row of a
//! batch fails the batch is rolled back and the error returned, leaving
//! earlier batches committed.

use crate::error::Result;
use crate::etl::connector::{ConflictPolicy, SourceConnector, WarehouseConnector, WarehouseRow};
use crate::etl::fact_aggregator::{FactAggregator, Resolution};
use crate::etl::records::{SalesAggregate, SkipReason, SkippedFact};
use crate::observability::EtlMetrics;
use chrono::NaiveDate;
use futures::StreamExt;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Result of loading one source's facts
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FactLoadReport {
    pub aggregates_read: u64,
    pub rows_committed: u64,
    pub batches_committed: u64,
    pub skipped: Vec<SkippedFact>,
}

impl FactLoadReport {
    /// Share of aggregated rows that were dropped, 0 when nothing was read
    pub fn skipped_ratio(&self) -> f64 {
        if self.aggregates_read == 0 {
            return 0.0;
        }
        self.skipped.len() as f64 / self.aggregates_read as f64
    }

    pub fn skipped_by_reason(&self) -> BTreeMap<SkipReason, u64> {
        let mut counts = BTreeMap::new();
        for skipped in &self.skipped {
            *counts.entry(skipped.reason).or_insert(0) += 1;
        }
        counts
    }
}

#[derive(Clone)]
pub struct FactLoader {
    batch_size: usize,
    progress_every: u64,
    metrics: EtlMetrics,
}

/// What one batch contributed before its commit
#[derive(Default)]
struct BatchOutcome {
    loaded: u64,
    last_date: Option<NaiveDate>,
}

impl FactLoader {
    pub fn new(batch_size: usize, progress_every: u64, metrics: EtlMetrics) -> Self {
        Self {
            batch_size: batch_size.max(1),
            progress_every,
            metrics,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Stream `source`'s aggregated sales through `aggregator` into `fact_ventas`.
    pub async fn load(
        &self,
        aggregator: &mut FactAggregator,
        source: &mut dyn SourceConnector,
        warehouse: &mut dyn WarehouseConnector,
    ) -> Result<FactLoadReport> {
        let code = aggregator.source_code().to_string();
        info!(source = %code, batch_size = self.batch_size, "loading fact_ventas");

        let mut report = FactLoadReport::default();
        let mut batches = aggregator.aggregates(source).chunks(self.batch_size);

        while let Some(batch) = batches.next().await {
            let outcome = match self.load_batch(aggregator, warehouse, batch, &mut report).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    if let Err(rollback_err) = warehouse.rollback().await {
                        warn!(source = %code, error = %rollback_err, "rollback after failed batch also failed");
                    }
                    return Err(e);
                }
            };

            warehouse.commit().await?;
            self.metrics.record_commit(&code);
            self.metrics.record_facts_loaded(&code, outcome.loaded);

            let before = report.rows_committed;
            report.rows_committed += outcome.loaded;
            report.batches_committed += 1;
            debug!(
                source = %code,
                batch = report.batches_committed,
                rows = outcome.loaded,
                "batch committed"
            );

            if self.progress_every > 0
                && report.rows_committed / self.progress_every > before / self.progress_every
            {
                info!(
                    source = %code,
                    committed = report.rows_committed,
                    through = ?outcome.last_date,
                    "fact load progress"
                );
            }
        }

        if !report.skipped.is_empty() {
            warn!(
                source = %code,
                skipped = report.skipped.len(),
                read = report.aggregates_read,
                by_reason = ?report.skipped_by_reason(),
                "aggregated rows dropped during key resolution"
            );
        }
        info!(
            source = %code,
            read = report.aggregates_read,
            committed = report.rows_committed,
            batches = report.batches_committed,
            "facts loaded into fact_ventas"
        );
        Ok(report)
    }

    async fn load_batch(
        &self,
        aggregator: &mut FactAggregator,
        warehouse: &mut dyn WarehouseConnector,
        batch: Vec<Result<SalesAggregate>>,
        report: &mut FactLoadReport,
    ) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();

        let code = aggregator.source_code().to_string();
        for aggregate in batch {
            let aggregate = aggregate?;
            report.aggregates_read += 1;
            self.metrics.record_aggregate_read(&code);
            outcome.last_date = Some(aggregate.sale_date);

            match aggregator.resolve(warehouse, aggregate).await? {
                Resolution::Resolved(fact) => {
                    warehouse
                        .insert(WarehouseRow::Fact(&fact), ConflictPolicy::None)
                        .await?;
                    outcome.loaded += 1;
                }
                Resolution::Skipped(skipped) => {
                    self.metrics.record_skipped(&code, skipped.reason);
                    report.skipped.push(skipped);
                }
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skipped(reason: SkipReason) -> SkippedFact {
        SkippedFact {
            source_code: "GT".to_string(),
            sale_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            movie_title: "A".to_string(),
            branch_name: "b1".to_string(),
            reason,
        }
    }

    #[test]
    fn test_skipped_ratio() {
        let mut report = FactLoadReport::default();
        assert_eq!(report.skipped_ratio(), 0.0);

        report.aggregates_read = 4;
        report.skipped.push(skipped(SkipReason::MissingTimeKey));
        assert_eq!(report.skipped_ratio(), 0.25);
    }

    #[test]
    fn test_skipped_by_reason() {
        let report = FactLoadReport {
            aggregates_read: 3,
            skipped: vec![
                skipped(SkipReason::MissingTimeKey),
                skipped(SkipReason::MissingTimeKey),
                skipped(SkipReason::MissingBranchKey),
            ],
            ..Default::default()
        };
        let counts = report.skipped_by_reason();
        assert_eq!(counts.get(&SkipReason::MissingTimeKey), Some(&2));
        assert_eq!(counts.get(&SkipReason::MissingBranchKey), Some(&1));
        assert_eq!(counts.get(&SkipReason::MissingMovieKey), None);
    }

    #[test]
    fn test_zero_batch_size_is_clamped() {
        let loader = FactLoader::new(0, 10, EtlMetrics::new());
        assert_eq!(loader.batch_size(), 1);
    }
}
