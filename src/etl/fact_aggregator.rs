//! Fact Aggregator - turns per-sale rows into fact-grain rows and resolves
//! their warehouse keys.
//!
//! Rows whose date, movie or branch has no warehouse key are dropped. The
//! drop never fails the run here; it is counted, logged and handed back as
//! a [`SkippedFact`] so the orchestrator can judge it.

use crate::config::SourceConfig;
use crate::error::Result;
use crate::etl::connector::{SourceConnector, WarehouseConnector};
use crate::etl::records::{
    BranchRecord, FactRow, MovieRecord, RawSale, SalesAggregate, SkipReason, SkippedFact,
};
use chrono::NaiveDate;
use futures::stream::{self, BoxStream, StreamExt};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Outcome of resolving one aggregated row
#[derive(Clone, Debug, PartialEq)]
pub enum Resolution {
    Resolved(FactRow),
    Skipped(SkippedFact),
}

/// Per-source aggregator. Key lookups are cached for the lifetime of the
/// aggregator, i.e. one fact stage.
pub struct FactAggregator {
    source_code: String,
    country_id: i32,
    time_keys: HashMap<NaiveDate, Option<i64>>,
    movie_keys: HashMap<MovieRecord, Option<i64>>,
    branch_keys: HashMap<BranchRecord, Option<i64>>,
}

impl FactAggregator {
    pub fn new(source: &SourceConfig) -> Self {
        Self {
            source_code: source.code.clone(),
            country_id: source.country_id,
            time_keys: HashMap::new(),
            movie_keys: HashMap::new(),
            branch_keys: HashMap::new(),
        }
    }

    pub fn source_code(&self) -> &str {
        &self.source_code
    }

    /// Aggregated sales of `source` in ascending date order.
    ///
    /// Grouping happens in the source database when it supports it,
    /// otherwise raw sales are grouped here one day at a time.
    pub fn aggregates<'a>(
        &self,
        source: &'a mut dyn SourceConnector,
    ) -> BoxStream<'a, Result<SalesAggregate>> {
        if source.supports_grouping() {
            return source.stream_sales();
        }

        debug!(source = %self.source_code, "grouping sales in the pipeline");
        group_by_day(source.stream_raw_sales())
    }

    /// Resolve the warehouse keys of one aggregated row.
    pub async fn resolve(
        &mut self,
        warehouse: &mut dyn WarehouseConnector,
        aggregate: SalesAggregate,
    ) -> Result<Resolution> {
        let Some(time_key) = self.time_key(warehouse, aggregate.sale_date).await? else {
            return Ok(self.skip(&aggregate, SkipReason::MissingTimeKey));
        };
        let Some(movie_key) = self.movie_key(warehouse, &aggregate.movie).await? else {
            return Ok(self.skip(&aggregate, SkipReason::MissingMovieKey));
        };
        let Some(branch_key) = self.branch_key(warehouse, &aggregate.branch).await? else {
            return Ok(self.skip(&aggregate, SkipReason::MissingBranchKey));
        };

        Ok(Resolution::Resolved(FactRow {
            time_key,
            movie_key,
            branch_key,
            country_id: self.country_id,
            source_code: self.source_code.clone(),
            tickets: aggregate.tickets,
            revenue: aggregate.revenue,
            average_price: aggregate.average_price(),
        }))
    }

    fn skip(&self, aggregate: &SalesAggregate, reason: SkipReason) -> Resolution {
        debug!(
            source = %self.source_code,
            date = %aggregate.sale_date,
            movie = %aggregate.movie.title,
            branch = %aggregate.branch.name,
            %reason,
            "dropping aggregated row"
        );
        Resolution::Skipped(SkippedFact {
            source_code: self.source_code.clone(),
            sale_date: aggregate.sale_date,
            movie_title: aggregate.movie.title.clone(),
            branch_name: aggregate.branch.name.clone(),
            reason,
        })
    }

    async fn time_key(
        &mut self,
        warehouse: &mut dyn WarehouseConnector,
        date: NaiveDate,
    ) -> Result<Option<i64>> {
        if let Some(key) = self.time_keys.get(&date) {
            return Ok(*key);
        }
        let key = warehouse.time_key(date).await?;
        self.time_keys.insert(date, key);
        Ok(key)
    }

    async fn movie_key(
        &mut self,
        warehouse: &mut dyn WarehouseConnector,
        movie: &MovieRecord,
    ) -> Result<Option<i64>> {
        if let Some(key) = self.movie_keys.get(movie) {
            return Ok(*key);
        }
        let key = warehouse.movie_key(movie).await?;
        self.movie_keys.insert(movie.clone(), key);
        Ok(key)
    }

    async fn branch_key(
        &mut self,
        warehouse: &mut dyn WarehouseConnector,
        branch: &BranchRecord,
    ) -> Result<Option<i64>> {
        if let Some(key) = self.branch_keys.get(branch) {
            return Ok(*key);
        }
        let key = warehouse.branch_key(self.country_id, branch).await?;
        self.branch_keys.insert(branch.clone(), key);
        Ok(key)
    }
}

/// Raw-sale stream plus the first sale of the next day, read ahead
struct DayGrouper<'a> {
    raw: BoxStream<'a, Result<RawSale>>,
    next_day: Option<RawSale>,
    done: bool,
}

/// Group a raw-sale stream ordered by payment time, emitting each day's
/// aggregates as soon as the next day starts.
pub fn group_by_day<'a>(raw: BoxStream<'a, Result<RawSale>>) -> BoxStream<'a, Result<SalesAggregate>> {
    let state = DayGrouper {
        raw,
        next_day: None,
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }

        let mut day: Vec<RawSale> = state.next_day.take().into_iter().collect();
        loop {
            match state.raw.next().await {
                Some(Ok(sale)) => {
                    let day_over = day
                        .first()
                        .is_some_and(|first| first.paid_at.date() != sale.paid_at.date());
                    if day_over {
                        state.next_day = Some(sale);
                        return Some((Ok(group_sales(day)), state));
                    }
                    day.push(sale);
                }
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(e), state));
                }
                None => {
                    state.done = true;
                    if day.is_empty() {
                        return None;
                    }
                    return Some((Ok(group_sales(day)), state));
                }
            }
        }
    })
    .flat_map(|day: Result<Vec<SalesAggregate>>| match day {
        Ok(rows) => stream::iter(rows.into_iter().map(Ok)).boxed(),
        Err(e) => stream::iter(std::iter::once(Err(e))).boxed(),
    })
    .boxed()
}

/// Group raw sales by (calendar day, source movie id, source branch id),
/// ordered the same way.
pub fn group_sales(sales: impl IntoIterator<Item = RawSale>) -> Vec<SalesAggregate> {
    let mut groups: BTreeMap<(NaiveDate, i64, i64), SalesAggregate> = BTreeMap::new();

    for sale in sales {
        let key = (sale.paid_at.date(), sale.movie_id, sale.branch_id);
        let entry = groups.entry(key).or_insert_with(|| SalesAggregate {
            sale_date: sale.paid_at.date(),
            movie: sale.movie.clone(),
            branch: sale.branch.clone(),
            tickets: 0,
            revenue: Decimal::ZERO,
        });
        entry.tickets += sale.tickets;
        entry.revenue += sale.total;
    }

    groups.into_values().collect()
}
