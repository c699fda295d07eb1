//! Row types moved between sources, the pipeline and the warehouse

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Movie as described by its natural key
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MovieRecord {
    pub title: String,
    pub genre: String,
    pub rating: String,
    pub duration_minutes: i32,
}

/// Branch as stored in a source; the country comes from the source itself
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BranchRecord {
    pub name: String,
    pub city: String,
}

/// One operational sale joined to its showing
#[derive(Clone, Debug, PartialEq)]
pub struct RawSale {
    pub showing_id: i64,
    /// Source-side `pelicula_id` of the showing
    pub movie_id: i64,
    /// Source-side `sucursal_id` of the showing
    pub branch_id: i64,
    pub customer_id: Option<i64>,
    pub tickets: i64,
    pub total: Decimal,
    pub paid_at: NaiveDateTime,
    pub movie: MovieRecord,
    pub branch: BranchRecord,
}

/// Sales summed to the fact grain (date x movie x branch) for one source
#[derive(Clone, Debug, PartialEq)]
pub struct SalesAggregate {
    pub sale_date: NaiveDate,
    pub movie: MovieRecord,
    pub branch: BranchRecord,
    pub tickets: i64,
    pub revenue: Decimal,
}

impl SalesAggregate {
    pub fn average_price(&self) -> Decimal {
        average_price(self.revenue, self.tickets)
    }
}

/// Revenue per ticket rounded to cents, ties to even; zero when nothing
/// was sold.
pub fn average_price(revenue: Decimal, tickets: i64) -> Decimal {
    if tickets == 0 {
        return Decimal::ZERO;
    }
    (revenue / Decimal::from(tickets)).round_dp_with_strategy(2, RoundingStrategy::MidpointNearestEven)
}

/// Fact row with every key resolved against the warehouse
#[derive(Clone, Debug, PartialEq)]
pub struct FactRow {
    pub time_key: i64,
    pub movie_key: i64,
    pub branch_key: i64,
    pub country_id: i32,
    pub source_code: String,
    pub tickets: i64,
    pub revenue: Decimal,
    pub average_price: Decimal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    MissingTimeKey,
    MissingMovieKey,
    MissingBranchKey,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SkipReason::MissingTimeKey => "missing time key",
            SkipReason::MissingMovieKey => "missing movie key",
            SkipReason::MissingBranchKey => "missing branch key",
        };
        f.write_str(label)
    }
}

/// Aggregated row dropped during key resolution
#[derive(Clone, Debug, PartialEq)]
pub struct SkippedFact {
    pub source_code: String,
    pub sale_date: NaiveDate,
    pub movie_title: String,
    pub branch_name: String,
    pub reason: SkipReason,
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_average_price_rounds_to_cents() {
        assert_eq!(average_price(dec("25"), 5), dec("5.00"));
        assert_eq!(average_price(dec("10"), 3), dec("3.33"));
        assert_eq!(average_price(dec("20"), 3), dec("6.67"));
    }

    #[test]
    fn test_average_price_half_cent_ties_go_to_even() {
        assert_eq!(average_price(dec("45.00"), 8), dec("5.62"));
        assert_eq!(average_price(dec("12.65"), 2), dec("6.32"));
        assert_eq!(average_price(dec("0.125"), 1), dec("0.12"));
        assert_eq!(average_price(dec("0.135"), 1), dec("0.14"));
    }

    #[test]
    fn test_average_price_zero_tickets() {
        assert_eq!(average_price(dec("12.5"), 0), Decimal::ZERO);
        assert_eq!(average_price(Decimal::ZERO, 0), Decimal::ZERO);
    }
}
