#![allow(dead_code)]

use async_trait::async_trait;
use chrono::NaiveDate;
use cine_etl::config::{Backend, EtlConfig, SourceConfig};
use cine_etl::error::{EtlError, Result};
use cine_etl::etl::{
    BranchRecord, ConflictPolicy, ConnectorFactory, InsertOutcome, MovieRecord, SourceConnector,
    SqliteConnectorFactory, SqliteWarehouse, WarehouseConnector, WarehouseRow, WarehouseTable,
};
use rusqlite::{params, Connection};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const SOURCE_SCHEMA: &str = r#"
    CREATE TABLE peliculas (
        pelicula_id INTEGER PRIMARY KEY,
        titulo TEXT NOT NULL,
        genero TEXT NOT NULL,
        clasificacion TEXT NOT NULL,
        duracion_minutos INTEGER NOT NULL
    );
    CREATE TABLE sucursales (
        sucursal_id INTEGER PRIMARY KEY,
        nombre TEXT NOT NULL,
        ciudad TEXT NOT NULL
    );
    CREATE TABLE funciones (
        funcion_id INTEGER PRIMARY KEY,
        pelicula_id INTEGER NOT NULL REFERENCES peliculas(pelicula_id),
        sucursal_id INTEGER NOT NULL REFERENCES sucursales(sucursal_id)
    );
    CREATE TABLE ventas (
        venta_id INTEGER PRIMARY KEY,
        funcion_id INTEGER NOT NULL REFERENCES funciones(funcion_id),
        cliente_id INTEGER,
        cantidad_boletos INTEGER NOT NULL,
        total REAL NOT NULL,
        fecha_venta TEXT NOT NULL
    );
"#;

const WAREHOUSE_SCHEMA: &str = r#"
    CREATE TABLE dim_tiempo (
        tiempo_id INTEGER PRIMARY KEY,
        fecha TEXT NOT NULL UNIQUE
    );
    CREATE TABLE dim_pelicula (
        pelicula_id INTEGER PRIMARY KEY AUTOINCREMENT,
        titulo TEXT NOT NULL,
        genero TEXT NOT NULL,
        clasificacion TEXT NOT NULL,
        duracion_minutos INTEGER NOT NULL,
        UNIQUE (titulo, genero, clasificacion, duracion_minutos)
    );
    CREATE TABLE dim_sucursal (
        sucursal_id INTEGER PRIMARY KEY AUTOINCREMENT,
        pais_id INTEGER NOT NULL,
        nombre TEXT NOT NULL,
        ciudad TEXT NOT NULL
    );
    CREATE TABLE fact_ventas (
        venta_id INTEGER PRIMARY KEY AUTOINCREMENT,
        tiempo_id INTEGER NOT NULL REFERENCES dim_tiempo(tiempo_id),
        pelicula_id INTEGER NOT NULL REFERENCES dim_pelicula(pelicula_id),
        sucursal_id INTEGER NOT NULL REFERENCES dim_sucursal(sucursal_id),
        pais_id INTEGER NOT NULL,
        cantidad_boletos INTEGER NOT NULL,
        ingreso_total REAL NOT NULL,
        precio_promedio REAL NOT NULL,
        fuente TEXT NOT NULL
    );
"#;

pub fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

/// Warehouse file plus any number of source files in one temp directory
pub struct Fixture {
    pub dir: TempDir,
    pub warehouse_path: String,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let warehouse_path = dir.path().join("cine_dw.db").to_str().unwrap().to_string();
        let conn = Connection::open(&warehouse_path).unwrap();
        conn.execute_batch(WAREHOUSE_SCHEMA).unwrap();
        Self { dir, warehouse_path }
    }

    /// Insert consecutive calendar days into `dim_tiempo`.
    pub fn populate_time(&self, first: &str, days: i64) {
        let conn = Connection::open(&self.warehouse_path).unwrap();
        let start = date(first);
        for offset in 0..days {
            let day = start + chrono::Duration::days(offset);
            conn.execute("INSERT INTO dim_tiempo (fecha) VALUES (?1)", params![day])
                .unwrap();
        }
    }

    pub fn source(&self, code: &str, country_id: i32) -> SourceDb {
        let path = self
            .dir
            .path()
            .join(format!("cine_{}.db", code.to_lowercase()))
            .to_str()
            .unwrap()
            .to_string();
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(SOURCE_SCHEMA).unwrap();
        SourceDb {
            config: SourceConfig {
                code: code.to_string(),
                country_id,
                name: code.to_string(),
                url: path,
                server_side_grouping: true,
            },
            conn,
        }
    }

    pub fn config(&self, sources: &[&SourceDb]) -> EtlConfig {
        EtlConfig {
            backend: Backend::Sqlite,
            warehouse_url: self.warehouse_path.clone(),
            sources: sources.iter().map(|s| s.config.clone()).collect(),
            batch_size: 1000,
            progress_every: 10_000,
            max_skipped_ratio: None,
            concurrent_sources: false,
            dedupe_branches: false,
        }
    }

    pub fn warehouse(&self) -> SqliteWarehouse {
        SqliteWarehouse::open(&self.warehouse_path).unwrap()
    }

    /// Run arbitrary SQL against the warehouse file.
    pub fn execute(&self, sql: &str) {
        let conn = Connection::open(&self.warehouse_path).unwrap();
        conn.execute_batch(sql).unwrap();
    }

    pub fn count(&self, sql: &str) -> i64 {
        let conn = Connection::open(&self.warehouse_path).unwrap();
        conn.query_row(sql, [], |row| row.get(0)).unwrap()
    }
}

/// One regional source database file
pub struct SourceDb {
    pub config: SourceConfig,
    conn: Connection,
}

impl SourceDb {
    pub fn add_movie(&self, id: i64, title: &str, genre: &str, rating: &str, duration: i32) {
        self.conn
            .execute(
                "INSERT INTO peliculas (pelicula_id, titulo, genero, clasificacion, duracion_minutos) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, title, genre, rating, duration],
            )
            .unwrap();
    }

    pub fn add_branch(&self, id: i64, name: &str, city: &str) {
        self.conn
            .execute(
                "INSERT INTO sucursales (sucursal_id, nombre, ciudad) VALUES (?1, ?2, ?3)",
                params![id, name, city],
            )
            .unwrap();
    }

    pub fn add_showing(&self, id: i64, movie_id: i64, branch_id: i64) {
        self.conn
            .execute(
                "INSERT INTO funciones (funcion_id, pelicula_id, sucursal_id) VALUES (?1, ?2, ?3)",
                params![id, movie_id, branch_id],
            )
            .unwrap();
    }

    pub fn add_sale(&self, showing_id: i64, tickets: i64, total: f64, paid_at: &str) {
        self.conn
            .execute(
                "INSERT INTO ventas (funcion_id, cliente_id, cantidad_boletos, total, fecha_venta) \
                 VALUES (?1, NULL, ?2, ?3, ?4)",
                params![showing_id, tickets, total, paid_at],
            )
            .unwrap();
    }

    /// One movie, one branch, one showing tying them together (id 1 each).
    pub fn seed_single_showing(&self, title: &str, branch: &str, city: &str) {
        self.add_movie(1, title, "Drama", "PG-13", 120);
        self.add_branch(1, branch, city);
        self.add_showing(1, 1, 1);
    }
}

/// Warehouse double that records commits and can fail a chosen fact insert
pub struct RecordingWarehouse {
    inner: SqliteWarehouse,
    fail_on_fact: Option<usize>,
    fail_close_after_failure: bool,
    failed: bool,
    facts_seen: usize,
    pending: usize,
    pub commits: Arc<Mutex<Vec<usize>>>,
}

impl RecordingWarehouse {
    pub fn new(inner: SqliteWarehouse) -> Self {
        Self {
            inner,
            fail_on_fact: None,
            fail_close_after_failure: false,
            failed: false,
            facts_seen: 0,
            pending: 0,
            commits: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Fail the `n`-th fact insert (1-based).
    pub fn failing_on_fact(mut self, n: usize) -> Self {
        self.fail_on_fact = Some(n);
        self
    }

    /// Also fail `close` once an injected insert failure has happened.
    pub fn failing_close_after_failure(mut self) -> Self {
        self.fail_close_after_failure = true;
        self
    }
}

#[async_trait]
impl WarehouseConnector for RecordingWarehouse {
    async fn time_key(&mut self, date: NaiveDate) -> Result<Option<i64>> {
        self.inner.time_key(date).await
    }

    async fn movie_key(&mut self, movie: &MovieRecord) -> Result<Option<i64>> {
        self.inner.movie_key(movie).await
    }

    async fn branch_key(&mut self, country_id: i32, branch: &BranchRecord) -> Result<Option<i64>> {
        self.inner.branch_key(country_id, branch).await
    }

    async fn insert(&mut self, row: WarehouseRow<'_>, policy: ConflictPolicy) -> Result<InsertOutcome> {
        if let WarehouseRow::Fact(_) = row {
            self.facts_seen += 1;
            if self.fail_on_fact == Some(self.facts_seen) {
                self.failed = true;
                return Err(EtlError::InsertFailed {
                    table: "fact_ventas".to_string(),
                    message: "injected failure".to_string(),
                });
            }
            self.pending += 1;
        }
        self.inner.insert(row, policy).await
    }

    async fn commit(&mut self) -> Result<()> {
        self.inner.commit().await?;
        self.commits.lock().unwrap().push(self.pending);
        self.pending = 0;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.pending = 0;
        self.inner.rollback().await
    }

    async fn count_rows(&mut self, table: WarehouseTable) -> Result<i64> {
        self.inner.count_rows(table).await
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let fail = self.fail_close_after_failure && self.failed;
        Box::new(self.inner).close().await?;
        if fail {
            return Err(EtlError::Connection {
                target: "warehouse".to_string(),
                message: "injected close failure".to_string(),
            });
        }
        Ok(())
    }
}

/// SQLite factory whose warehouses fail the `n`-th fact insert of a stage
/// and then fail to close.
pub struct FaultyFactory {
    inner: SqliteConnectorFactory,
    warehouse_path: String,
    fail_on_fact: usize,
}

impl FaultyFactory {
    pub fn new(warehouse_path: &str, fail_on_fact: usize) -> Self {
        Self {
            inner: SqliteConnectorFactory::new(warehouse_path),
            warehouse_path: warehouse_path.to_string(),
            fail_on_fact,
        }
    }
}

#[async_trait]
impl ConnectorFactory for FaultyFactory {
    async fn open_source(&self, source: &SourceConfig) -> Result<Box<dyn SourceConnector>> {
        self.inner.open_source(source).await
    }

    async fn open_warehouse(&self) -> Result<Box<dyn WarehouseConnector>> {
        let inner = SqliteWarehouse::open(&self.warehouse_path)?;
        Ok(Box::new(
            RecordingWarehouse::new(inner)
                .failing_on_fact(self.fail_on_fact)
                .failing_close_after_failure(),
        ))
    }
}
