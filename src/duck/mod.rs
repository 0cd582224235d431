use anyhow::{Context, Result};
use duckdb::Connection;
use std::path::Path;
use tracing::debug;

use crate::table::CsvTable;

/// Open a DuckDB database on disk at `path`, then run each `init_sql`
/// statement (e.g. `INSTALL postgres; ATTACH '...' AS wh (TYPE postgres)`).
pub fn open_disk_db(path: &Path, init_sql: &[String]) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("opening DuckDB database {}", path.display()))?;
    run_init_sql(&conn, init_sql)?;
    Ok(conn)
}

/// Open a DuckDB in‐memory database
pub fn open_mem_db(init_sql: &[String]) -> Result<Connection> {
    let conn = Connection::open_in_memory().context("opening in-memory DuckDB")?;
    run_init_sql(&conn, init_sql)?;
    Ok(conn)
}

fn run_init_sql(conn: &Connection, init_sql: &[String]) -> Result<()> {
    for stmt in init_sql {
        debug!(sql = %stmt, "running init statement");
        conn.execute_batch(stmt)
            .with_context(|| format!("init statement failed: {}", stmt))?;
    }
    Ok(())
}

/// Quote an identifier for interpolation into SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal for interpolation into SQL.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Run `sql` and collect the result with every column cast to VARCHAR.
///
/// Column names come from `DESCRIBE <sql>`, so any SELECT works without
/// knowing its schema up front. NULL becomes the empty string.
pub fn query_table(conn: &Connection, sql: &str) -> Result<CsvTable> {
    let sql = sql.trim().trim_end_matches(';');

    let columns: Vec<String> = {
        let mut stmt = conn
            .prepare(&format!("DESCRIBE {}", sql))
            .with_context(|| format!("describing query: {}", sql))?;
        let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let names: Vec<String> = names.collect::<Result<_, _>>()?;
        names
    };

    let projection = columns
        .iter()
        .map(|c| format!("CAST({} AS VARCHAR)", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");
    let wrapped = format!("SELECT {} FROM ({}) AS q", projection, sql);

    let width = columns.len();
    let mut table = CsvTable::new(columns);
    let mut stmt = conn
        .prepare(&wrapped)
        .with_context(|| format!("preparing query: {}", sql))?;
    let rows = stmt.query_map([], |row| {
        (0..width)
            .map(|i| row.get::<_, Option<String>>(i).map(Option::unwrap_or_default))
            .collect::<Result<Vec<String>, _>>()
    })?;
    for row in rows {
        table.push_row(row?);
    }
    debug!(rows = table.len(), "query returned");
    Ok(table)
}
