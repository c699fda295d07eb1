//! PostgreSQL connectors (sqlx)

use crate::config::SourceConfig;
use crate::db::connection::connect_postgres;
use crate::error::{EtlError, Result};
use crate::etl::connector::{
    ConflictPolicy, ConnectorFactory, InsertOutcome, SourceConnector, WarehouseConnector, WarehouseRow,
    WarehouseTable,
};
use crate::etl::records::{BranchRecord, MovieRecord, RawSale, SalesAggregate};
use crate::etl::sql::{self, Placeholder};
use async_trait::async_trait;
use chrono::NaiveDate;
use futures::stream::{BoxStream, StreamExt};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::sync::OnceLock;
use tracing::debug;

const PH: Placeholder = Placeholder::Dollar;

const SELECT_RAW_SALES: &str = r#"
    SELECT
        CAST(v.funcion_id AS BIGINT) AS funcion_id,
        CAST(f.pelicula_id AS BIGINT) AS pelicula_id,
        CAST(f.sucursal_id AS BIGINT) AS sucursal_id,
        CAST(v.cliente_id AS BIGINT) AS cliente_id,
        CAST(v.cantidad_boletos AS BIGINT) AS cantidad_boletos,
        CAST(v.total AS NUMERIC) AS total,
        CAST(v.fecha_venta AS TIMESTAMP) AS fecha_venta,
        p.titulo,
        p.genero,
        p.clasificacion,
        CAST(p.duracion_minutos AS INTEGER) AS duracion_minutos,
        s.nombre,
        s.ciudad
    FROM ventas v
    JOIN funciones f ON v.funcion_id = f.funcion_id
    JOIN peliculas p ON f.pelicula_id = p.pelicula_id
    JOIN sucursales s ON f.sucursal_id = s.sucursal_id
    ORDER BY v.fecha_venta
"#;

fn grouped_sales_query() -> &'static str {
    static QUERY: OnceLock<String> = OnceLock::new();
    QUERY.get_or_init(|| sql::select_grouped_sales("NUMERIC"))
}

fn movie_from_row(row: &PgRow) -> std::result::Result<MovieRecord, sqlx::Error> {
    Ok(MovieRecord {
        title: row.try_get("titulo")?,
        genre: row.try_get("genero")?,
        rating: row.try_get("clasificacion")?,
        duration_minutes: row.try_get("duracion_minutos")?,
    })
}

fn branch_from_row(row: &PgRow) -> std::result::Result<BranchRecord, sqlx::Error> {
    Ok(BranchRecord {
        name: row.try_get("nombre")?,
        city: row.try_get("ciudad")?,
    })
}

fn aggregate_from_row(row: &PgRow) -> std::result::Result<SalesAggregate, sqlx::Error> {
    Ok(SalesAggregate {
        sale_date: row.try_get("fecha")?,
        movie: movie_from_row(row)?,
        branch: branch_from_row(row)?,
        tickets: row.try_get::<Option<i64>, _>("total_boletos")?.unwrap_or(0),
        revenue: row
            .try_get::<Option<Decimal>, _>("total_ingresos")?
            .unwrap_or(Decimal::ZERO),
    })
}

fn raw_sale_from_row(row: &PgRow) -> std::result::Result<RawSale, sqlx::Error> {
    Ok(RawSale {
        showing_id: row.try_get("funcion_id")?,
        movie_id: row.try_get("pelicula_id")?,
        branch_id: row.try_get("sucursal_id")?,
        customer_id: row.try_get("cliente_id")?,
        tickets: row.try_get("cantidad_boletos")?,
        total: row.try_get("total")?,
        paid_at: row.try_get("fecha_venta")?,
        movie: movie_from_row(row)?,
        branch: branch_from_row(row)?,
    })
}

/// Regional database reached over Postgres
pub struct PgSource {
    code: String,
    pool: PgPool,
    server_side_grouping: bool,
}

impl PgSource {
    pub async fn connect(source: &SourceConfig) -> Result<Self> {
        let pool = connect_postgres(&source.code, &source.url).await?;
        debug!(source = %source.code, "source connection opened");
        Ok(Self {
            code: source.code.clone(),
            pool,
            server_side_grouping: source.server_side_grouping,
        })
    }

    fn stream_rows<'a, T, F>(&'a mut self, query: &'static str, map: F) -> BoxStream<'a, Result<T>>
    where
        T: Send + 'a,
        F: Fn(&PgRow) -> std::result::Result<T, sqlx::Error> + Send + 'a,
    {
        sqlx::query(query)
            .fetch(&self.pool)
            .map(move |row| row.and_then(|r| map(&r)).map_err(EtlError::from))
            .boxed()
    }
}

#[async_trait]
impl SourceConnector for PgSource {
    fn code(&self) -> &str {
        &self.code
    }

    fn stream_movies(&mut self) -> BoxStream<'_, Result<MovieRecord>> {
        self.stream_rows(sql::SELECT_MOVIES, movie_from_row)
    }

    fn stream_branches(&mut self) -> BoxStream<'_, Result<BranchRecord>> {
        self.stream_rows(sql::SELECT_BRANCHES, branch_from_row)
    }

    fn stream_sales(&mut self) -> BoxStream<'_, Result<SalesAggregate>> {
        self.stream_rows(grouped_sales_query(), aggregate_from_row)
    }

    fn stream_raw_sales(&mut self) -> BoxStream<'_, Result<RawSale>> {
        self.stream_rows(SELECT_RAW_SALES, raw_sale_from_row)
    }

    fn supports_grouping(&self) -> bool {
        self.server_side_grouping
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.pool.close().await;
        debug!(source = %self.code, "source connection closed");
        Ok(())
    }
}

/// Warehouse reached over Postgres. Inserts open a transaction that
/// `commit`/`rollback` end; lookups join it while it is open and run on
/// the pool otherwise.
pub struct PgWarehouse {
    pool: PgPool,
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgWarehouse {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = connect_postgres("warehouse", database_url).await?;
        debug!("warehouse connection opened");
        Ok(Self { pool, tx: None })
    }

    async fn tx(&mut self) -> Result<&mut Transaction<'static, Postgres>> {
        let tx = match self.tx.take() {
            Some(tx) => tx,
            None => self.pool.begin().await?,
        };
        Ok(self.tx.insert(tx))
    }
}

fn insert_error(table: WarehouseTable, policy: ConflictPolicy, err: sqlx::Error) -> EtlError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() && policy == ConflictPolicy::Fail {
            return EtlError::InsertConflict {
                table: table.name().to_string(),
                detail: db_err.message().to_string(),
            };
        }
    }
    EtlError::InsertFailed {
        table: table.name().to_string(),
        message: err.to_string(),
    }
}

#[async_trait]
impl WarehouseConnector for PgWarehouse {
    async fn time_key(&mut self, date: NaiveDate) -> Result<Option<i64>> {
        let query = sql::select_time_key(PH);
        let lookup = sqlx::query_scalar::<_, i64>(&query).bind(date);
        let key = match self.tx.as_mut() {
            Some(tx) => lookup.fetch_optional(&mut **tx).await?,
            None => lookup.fetch_optional(&self.pool).await?,
        };
        Ok(key)
    }

    async fn movie_key(&mut self, movie: &MovieRecord) -> Result<Option<i64>> {
        let query = sql::select_movie_key(PH);
        let lookup = sqlx::query_scalar::<_, i64>(&query)
            .bind(&movie.title)
            .bind(&movie.genre)
            .bind(&movie.rating)
            .bind(movie.duration_minutes);
        let key = match self.tx.as_mut() {
            Some(tx) => lookup.fetch_optional(&mut **tx).await?,
            None => lookup.fetch_optional(&self.pool).await?,
        };
        Ok(key)
    }

    async fn branch_key(&mut self, country_id: i32, branch: &BranchRecord) -> Result<Option<i64>> {
        let query = sql::select_branch_key(PH);
        let lookup = sqlx::query_scalar::<_, Option<i64>>(&query)
            .bind(country_id)
            .bind(&branch.name)
            .bind(&branch.city);
        let key = match self.tx.as_mut() {
            Some(tx) => lookup.fetch_one(&mut **tx).await?,
            None => lookup.fetch_one(&self.pool).await?,
        };
        Ok(key)
    }

    async fn insert(&mut self, row: WarehouseRow<'_>, policy: ConflictPolicy) -> Result<InsertOutcome> {
        let table = row.table();
        let statement = sql::insert(table, policy, PH);
        let query = sqlx::query(&statement);
        let query = match row {
            WarehouseRow::Movie(movie) => query
                .bind(&movie.title)
                .bind(&movie.genre)
                .bind(&movie.rating)
                .bind(movie.duration_minutes),
            WarehouseRow::Branch { country_id, branch } => {
                query.bind(country_id).bind(&branch.name).bind(&branch.city)
            }
            WarehouseRow::Fact(fact) => query
                .bind(fact.time_key)
                .bind(fact.movie_key)
                .bind(fact.branch_key)
                .bind(fact.country_id)
                .bind(fact.tickets)
                .bind(fact.revenue)
                .bind(fact.average_price)
                .bind(&fact.source_code),
        };

        let tx = self.tx().await?;
        let result = query
            .execute(&mut **tx)
            .await
            .map_err(|e| insert_error(table, policy, e))?;

        Ok(if result.rows_affected() == 0 {
            InsertOutcome::Ignored
        } else {
            InsertOutcome::Inserted
        })
    }

    async fn commit(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        Ok(())
    }

    async fn count_rows(&mut self, table: WarehouseTable) -> Result<i64> {
        let query = sql::count_rows(table);
        let count = match self.tx.as_mut() {
            Some(tx) => sqlx::query_scalar::<_, i64>(&query).fetch_one(&mut **tx).await?,
            None => sqlx::query_scalar::<_, i64>(&query).fetch_one(&self.pool).await?,
        };
        Ok(count)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let mut this = self;
        let rolled_back = this.rollback().await;
        this.pool.close().await;
        debug!("warehouse connection closed");
        rolled_back
    }
}

/// Opens a fresh Postgres connection per stage.
pub struct PgConnectorFactory {
    warehouse_url: String,
}

impl PgConnectorFactory {
    pub fn new(warehouse_url: impl Into<String>) -> Self {
        Self {
            warehouse_url: warehouse_url.into(),
        }
    }
}

#[async_trait]
impl ConnectorFactory for PgConnectorFactory {
    async fn open_source(&self, source: &SourceConfig) -> Result<Box<dyn SourceConnector>> {
        Ok(Box::new(PgSource::connect(source).await?))
    }

    async fn open_warehouse(&self) -> Result<Box<dyn WarehouseConnector>> {
        Ok(Box::new(PgWarehouse::connect(&self.warehouse_url).await?))
    }
}
