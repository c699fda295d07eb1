//! SQL shared by the Postgres and SQLite connectors
//!
//! Only portable syntax lives here. Statements that need backend-specific
//! casts stay in their connector module.

use crate::etl::connector::{ConflictPolicy, WarehouseTable};

/// Bind parameter syntax of a backend
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placeholder {
    /// `$1`, `$2`, ... (Postgres)
    Dollar,
    /// `?1`, `?2`, ... (SQLite)
    Question,
}

impl Placeholder {
    pub fn nth(&self, n: usize) -> String {
        match self {
            Placeholder::Dollar => format!("${}", n),
            Placeholder::Question => format!("?{}", n),
        }
    }

    fn list(&self, count: usize) -> String {
        (1..=count).map(|n| self.nth(n)).collect::<Vec<_>>().join(", ")
    }
}

pub const SELECT_MOVIES: &str = r#"
    SELECT titulo, genero, clasificacion, CAST(duracion_minutos AS INTEGER) AS duracion_minutos
    FROM peliculas
"#;

pub const SELECT_BRANCHES: &str = "SELECT nombre, ciudad FROM sucursales";

/// Sales per (day, source movie id, source branch id), oldest day first.
///
/// `money_type` is the backend's exact type for the revenue sum.
pub fn select_grouped_sales(money_type: &str) -> String {
    format!(
        r#"
    SELECT
        DATE(v.fecha_venta) AS fecha,
        p.titulo,
        p.genero,
        p.clasificacion,
        CAST(p.duracion_minutos AS INTEGER) AS duracion_minutos,
        s.nombre,
        s.ciudad,
        CAST(SUM(v.cantidad_boletos) AS BIGINT) AS total_boletos,
        CAST(SUM(v.total) AS {money}) AS total_ingresos
    FROM ventas v
    JOIN funciones f ON v.funcion_id = f.funcion_id
    JOIN peliculas p ON f.pelicula_id = p.pelicula_id
    JOIN sucursales s ON f.sucursal_id = s.sucursal_id
    GROUP BY DATE(v.fecha_venta), f.pelicula_id, f.sucursal_id,
             p.titulo, p.genero, p.clasificacion, p.duracion_minutos,
             s.nombre, s.ciudad
    ORDER BY fecha, f.pelicula_id, f.sucursal_id
"#,
        money = money_type
    )
}

pub fn select_time_key(ph: Placeholder) -> String {
    format!(
        "SELECT CAST(tiempo_id AS BIGINT) FROM dim_tiempo WHERE fecha = {}",
        ph.nth(1)
    )
}

pub fn select_movie_key(ph: Placeholder) -> String {
    format!(
        "SELECT CAST(pelicula_id AS BIGINT) FROM dim_pelicula \
         WHERE titulo = {} AND genero = {} AND clasificacion = {} AND duracion_minutos = {}",
        ph.nth(1),
        ph.nth(2),
        ph.nth(3),
        ph.nth(4)
    )
}

pub fn select_branch_key(ph: Placeholder) -> String {
    format!(
        "SELECT CAST(MIN(sucursal_id) AS BIGINT) FROM dim_sucursal \
         WHERE pais_id = {} AND nombre = {} AND ciudad = {}",
        ph.nth(1),
        ph.nth(2),
        ph.nth(3)
    )
}

pub fn count_rows(table: WarehouseTable) -> String {
    format!("SELECT CAST(COUNT(*) AS BIGINT) FROM {}", table.name())
}

/// INSERT statement for `table`; `IgnoreDuplicate` appends `ON CONFLICT DO NOTHING`.
pub fn insert(table: WarehouseTable, policy: ConflictPolicy, ph: Placeholder) -> String {
    let (columns, count) = match table {
        WarehouseTable::Movies => ("titulo, genero, clasificacion, duracion_minutos", 4),
        WarehouseTable::Branches => ("pais_id, nombre, ciudad", 3),
        WarehouseTable::Facts => (
            "tiempo_id, pelicula_id, sucursal_id, pais_id, cantidad_boletos, \
             ingreso_total, precio_promedio, fuente",
            8,
        ),
    };

    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table.name(),
        columns,
        ph.list(count)
    );
    if policy == ConflictPolicy::IgnoreDuplicate {
        sql.push_str(" ON CONFLICT DO NOTHING");
    }
    sql
}
