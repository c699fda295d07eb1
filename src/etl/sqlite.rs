//! SQLite connectors (rusqlite)
//!
//! Used for local runs against database files and by the test-suite.
//! Source queries run on a blocking thread with their own read-only
//! connection and hand rows over through a bounded channel. Money leaves
//! SQLite as text and is parsed into `Decimal`.

use crate::config::SourceConfig;
use crate::db::connection::connect_sqlite;
use crate::error::{EtlError, Result};
use crate::etl::connector::{
    ConflictPolicy, ConnectorFactory, InsertOutcome, SourceConnector, WarehouseConnector, WarehouseRow,
    WarehouseTable,
};
use crate::etl::records::{BranchRecord, MovieRecord, RawSale, SalesAggregate};
use crate::etl::sql::{self, Placeholder};
use async_trait::async_trait;
use chrono::NaiveDate;
use futures::stream::{self, BoxStream, StreamExt};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::OnceLock;
use tokio::sync::mpsc;
use tracing::debug;

const PH: Placeholder = Placeholder::Question;

/// Rows buffered between the reading thread and the consumer
const STREAM_BUFFER: usize = 256;

const SELECT_RAW_SALES: &str = r#"
    SELECT
        v.funcion_id,
        f.pelicula_id,
        f.sucursal_id,
        v.cliente_id,
        v.cantidad_boletos,
        CAST(v.total AS TEXT) AS total,
        v.fecha_venta,
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
    QUERY.get_or_init(|| sql::select_grouped_sales("TEXT"))
}

fn decimal_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let Some(text) = row.get::<_, Option<String>>(idx)? else {
        return Ok(None);
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map(Some)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn movie_at(row: &Row<'_>, offset: usize) -> rusqlite::Result<MovieRecord> {
    Ok(MovieRecord {
        title: row.get(offset)?,
        genre: row.get(offset + 1)?,
        rating: row.get(offset + 2)?,
        duration_minutes: row.get(offset + 3)?,
    })
}

fn branch_at(row: &Row<'_>, offset: usize) -> rusqlite::Result<BranchRecord> {
    Ok(BranchRecord {
        name: row.get(offset)?,
        city: row.get(offset + 1)?,
    })
}

fn aggregate_from_row(row: &Row<'_>) -> rusqlite::Result<SalesAggregate> {
    Ok(SalesAggregate {
        sale_date: row.get(0)?,
        movie: movie_at(row, 1)?,
        branch: branch_at(row, 5)?,
        tickets: row.get::<_, Option<i64>>(7)?.unwrap_or(0),
        revenue: decimal_at(row, 8)?.unwrap_or(Decimal::ZERO),
    })
}

fn raw_sale_from_row(row: &Row<'_>) -> rusqlite::Result<RawSale> {
    Ok(RawSale {
        showing_id: row.get(0)?,
        movie_id: row.get(1)?,
        branch_id: row.get(2)?,
        customer_id: row.get(3)?,
        tickets: row.get(4)?,
        total: decimal_at(row, 5)?.unwrap_or(Decimal::ZERO),
        paid_at: row.get(6)?,
        movie: movie_at(row, 7)?,
        branch: branch_at(row, 11)?,
    })
}

/// Run `query` on a fresh read-only connection and push each mapped row
/// into `tx` until the rows or the receiver run out.
fn send_rows<T, F>(
    code: &str,
    path: &str,
    query: &str,
    map: F,
    tx: &mpsc::Sender<Result<T>>,
) -> Result<()>
where
    F: Fn(&Row<'_>) -> rusqlite::Result<T>,
{
    let conn = connect_sqlite(code, path, true)?;
    let mut stmt = conn.prepare(query)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        if tx.blocking_send(Ok(map(row)?)).is_err() {
            // consumer dropped the stream
            break;
        }
    }
    Ok(())
}

/// Regional database stored in a SQLite file
pub struct SqliteSource {
    code: String,
    path: String,
    server_side_grouping: bool,
}

impl SqliteSource {
    pub fn open(source: &SourceConfig) -> Result<Self> {
        // Fail at open time when the file is unreachable.
        connect_sqlite(&source.code, &source.url, true)?;
        debug!(source = %source.code, "source database reachable");
        Ok(Self {
            code: source.code.clone(),
            path: source.url.clone(),
            server_side_grouping: source.server_side_grouping,
        })
    }

    fn stream_query<T, F>(&self, query: &'static str, map: F) -> BoxStream<'static, Result<T>>
    where
        T: Send + 'static,
        F: Fn(&Row<'_>) -> rusqlite::Result<T> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let code = self.code.clone();
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || {
            if let Err(e) = send_rows(&code, &path, query, map, &tx) {
                let _ = tx.blocking_send(Err(e));
            }
        });

        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
    }
}

#[async_trait]
impl SourceConnector for SqliteSource {
    fn code(&self) -> &str {
        &self.code
    }

    fn stream_movies(&mut self) -> BoxStream<'_, Result<MovieRecord>> {
        self.stream_query(sql::SELECT_MOVIES, |row| movie_at(row, 0))
    }

    fn stream_branches(&mut self) -> BoxStream<'_, Result<BranchRecord>> {
        self.stream_query(sql::SELECT_BRANCHES, |row| branch_at(row, 0))
    }

    fn stream_sales(&mut self) -> BoxStream<'_, Result<SalesAggregate>> {
        self.stream_query(grouped_sales_query(), aggregate_from_row)
    }

    fn stream_raw_sales(&mut self) -> BoxStream<'_, Result<RawSale>> {
        self.stream_query(SELECT_RAW_SALES, raw_sale_from_row)
    }

    fn supports_grouping(&self) -> bool {
        self.server_side_grouping
    }

    async fn close(self: Box<Self>) -> Result<()> {
        debug!(source = %self.code, "source closed");
        Ok(())
    }
}

/// Warehouse stored in a SQLite file. The first insert opens a
/// `BEGIN IMMEDIATE` transaction; lookups and counts outside it run in
/// autocommit mode and take no write lock.
pub struct SqliteWarehouse {
    conn: Connection,
    in_tx: bool,
}

impl SqliteWarehouse {
    pub fn open(path: &str) -> Result<Self> {
        let conn = connect_sqlite("warehouse", path, false)?;
        debug!("warehouse connection opened");
        Ok(Self { conn, in_tx: false })
    }

    fn begin(&mut self) -> Result<()> {
        if !self.in_tx {
            self.conn.execute_batch("BEGIN IMMEDIATE")?;
            self.in_tx = true;
        }
        Ok(())
    }

    fn execute_insert(&self, row: WarehouseRow<'_>, statement: &str) -> rusqlite::Result<usize> {
        match row {
            WarehouseRow::Movie(movie) => self.conn.execute(
                statement,
                params![movie.title, movie.genre, movie.rating, movie.duration_minutes],
            ),
            WarehouseRow::Branch { country_id, branch } => {
                self.conn.execute(statement, params![country_id, branch.name, branch.city])
            }
            WarehouseRow::Fact(fact) => self.conn.execute(
                statement,
                params![
                    fact.time_key,
                    fact.movie_key,
                    fact.branch_key,
                    fact.country_id,
                    fact.tickets,
                    fact.revenue.to_string(),
                    fact.average_price.to_string(),
                    fact.source_code
                ],
            ),
        }
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.code == ErrorCode::ConstraintViolation
                && (e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
        }
        _ => false,
    }
}

#[async_trait]
impl WarehouseConnector for SqliteWarehouse {
    async fn time_key(&mut self, date: NaiveDate) -> Result<Option<i64>> {
        let key = self
            .conn
            .query_row(&sql::select_time_key(PH), params![date], |row| row.get(0))
            .optional()?;
        Ok(key)
    }

    async fn movie_key(&mut self, movie: &MovieRecord) -> Result<Option<i64>> {
        let key = self
            .conn
            .query_row(
                &sql::select_movie_key(PH),
                params![movie.title, movie.genre, movie.rating, movie.duration_minutes],
                |row| row.get(0),
            )
            .optional()?;
        Ok(key)
    }

    async fn branch_key(&mut self, country_id: i32, branch: &BranchRecord) -> Result<Option<i64>> {
        let key: Option<i64> = self.conn.query_row(
            &sql::select_branch_key(PH),
            params![country_id, branch.name, branch.city],
            |row| row.get(0),
        )?;
        Ok(key)
    }

    async fn insert(&mut self, row: WarehouseRow<'_>, policy: ConflictPolicy) -> Result<InsertOutcome> {
        self.begin()?;
        let table = row.table();
        let statement = sql::insert(table, policy, PH);

        match self.execute_insert(row, &statement) {
            Ok(0) => Ok(InsertOutcome::Ignored),
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(e) if policy == ConflictPolicy::Fail && is_unique_violation(&e) => {
                Err(EtlError::InsertConflict {
                    table: table.name().to_string(),
                    detail: e.to_string(),
                })
            }
            Err(e) => Err(EtlError::InsertFailed {
                table: table.name().to_string(),
                message: e.to_string(),
            }),
        }
    }

    async fn commit(&mut self) -> Result<()> {
        if self.in_tx {
            self.conn.execute_batch("COMMIT")?;
            self.in_tx = false;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if self.in_tx {
            self.in_tx = false;
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    async fn count_rows(&mut self, table: WarehouseTable) -> Result<i64> {
        let count = self.conn.query_row(&sql::count_rows(table), [], |row| row.get(0))?;
        Ok(count)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let mut this = self;
        this.rollback().await?;
        this.conn.close().map_err(|(_, e)| EtlError::from(e))?;
        debug!("warehouse connection closed");
        Ok(())
    }
}

/// Opens SQLite files named by the configuration; URLs are file paths.
pub struct SqliteConnectorFactory {
    warehouse_path: String,
}

impl SqliteConnectorFactory {
    pub fn new(warehouse_path: impl Into<String>) -> Self {
        Self {
            warehouse_path: warehouse_path.into(),
        }
    }
}

#[async_trait]
impl ConnectorFactory for SqliteConnectorFactory {
    async fn open_source(&self, source: &SourceConfig) -> Result<Box<dyn SourceConnector>> {
        Ok(Box::new(SqliteSource::open(source)?))
    }

    async fn open_warehouse(&self) -> Result<Box<dyn WarehouseConnector>> {
        Ok(Box::new(SqliteWarehouse::open(&self.warehouse_path)?))
    }
}
