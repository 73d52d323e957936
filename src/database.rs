//! SQL-backed database items.
//!
//! Each database item owns one SQLite file (`databases/<id>.sqlite`). Queries
//! are arbitrary SQL typed by the owner; results come back as loosely typed
//! [`Cell`]s for display and plotting.

use anyhow::{bail, Context, Result};
use futures_util::TryStreamExt;
use serde::{Serialize, Serializer};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Executor, Row, Statement, TypeInfo, ValueRef};
use std::fmt;
use std::path::Path;

use crate::config::Config;
use crate::models::{ItemKind, ItemRef};
use crate::plot;
use crate::store::ItemStore;

/// A single result value.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    /// Blobs are summarized by their length.
    Blob(usize),
}

impl Cell {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Integer(v) => Some(*v as f64),
            Cell::Real(v) => Some(*v).filter(|v| v.is_finite()),
            Cell::Text(t) => t.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
            Cell::Null | Cell::Blob(_) => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Null => f.write_str("NULL"),
            Cell::Integer(v) => write!(f, "{}", v),
            Cell::Real(v) => write!(f, "{}", v),
            Cell::Text(t) => f.write_str(t),
            Cell::Blob(n) => write!(f, "<{} bytes>", n),
        }
    }
}

impl Serialize for Cell {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Cell::Null => serializer.serialize_none(),
            Cell::Integer(v) => serializer.serialize_i64(*v),
            Cell::Real(v) => serializer.serialize_f64(*v),
            Cell::Text(t) => serializer.serialize_str(t),
            Cell::Blob(_) => serializer.collect_str(self),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryOutcome {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
    /// Set for statements that do not return rows.
    pub rows_affected: Option<u64>,
    /// True when more than `max_rows` rows were produced.
    pub truncated: bool,
}

impl QueryOutcome {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<String>,
}

pub struct DatabaseHandle {
    pool: SqlitePool,
}

impl DatabaseHandle {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        Ok(Self { pool })
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    pub async fn execute(&self, sql: &str, max_rows: usize) -> Result<QueryOutcome> {
        if sql.trim().is_empty() {
            bail!("query must not be empty");
        }

        if !returns_rows(sql) {
            let result = sqlx::raw_sql(sql).execute(&self.pool).await?;
            return Ok(QueryOutcome {
                rows_affected: Some(result.rows_affected()),
                ..Default::default()
            });
        }

        // Column names come from the statement so empty results keep their header.
        let statement = (&self.pool).prepare(sql).await?;
        let columns: Vec<String> = statement
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();

        let mut stream = sqlx::query(sql).fetch(&self.pool);
        let mut rows = Vec::new();
        let mut truncated = false;
        while let Some(row) = stream.try_next().await? {
            if rows.len() == max_rows {
                truncated = true;
                break;
            }
            let mut cells = Vec::with_capacity(row.len());
            for idx in 0..row.len() {
                cells.push(decode_cell(&row, idx)?);
            }
            rows.push(cells);
        }

        Ok(QueryOutcome {
            columns,
            rows,
            rows_affected: None,
            truncated,
        })
    }

    /// User tables and their column names, sorted by table name.
    pub async fn tables(&self) -> Result<Vec<TableInfo>> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut tables = Vec::with_capacity(names.len());
        for name in names {
            let columns: Vec<String> =
                sqlx::query_scalar("SELECT name FROM pragma_table_info(?) ORDER BY cid")
                    .bind(&name)
                    .fetch_all(&self.pool)
                    .await?;
            tables.push(TableInfo { name, columns });
        }
        Ok(tables)
    }

    /// Creates `table` from CSV text (header row names the columns, every
    /// column is TEXT) and inserts all rows in one transaction.
    pub async fn import_csv(&self, table: &str, csv_text: &str) -> Result<usize> {
        let records = parse_csv(csv_text)?;
        let Some((header, rows)) = records.split_first() else {
            bail!("CSV input is empty");
        };
        let table = sanitize_identifier(table, "imported");
        let columns = unique_columns(header);

        for (i, row) in rows.iter().enumerate() {
            if row.len() != columns.len() {
                bail!(
                    "CSV row {} has {} fields, header has {}",
                    i + 2,
                    row.len(),
                    columns.len()
                );
            }
        }

        let column_defs = columns
            .iter()
            .map(|c| format!("\"{}\" TEXT", c))
            .collect::<Vec<_>>()
            .join(", ");
        let column_list = columns
            .iter()
            .map(|c| format!("\"{}\"", c))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = vec!["?"; columns.len()].join(", ");
        let create = format!("CREATE TABLE \"{}\" ({})", table, column_defs);
        let insert = format!(
            "INSERT INTO \"{}\" ({}) VALUES ({})",
            table, column_list, placeholders
        );

        let mut tx = self.pool.begin().await?;
        sqlx::query(&create).execute(&mut *tx).await?;
        for row in rows {
            let mut q = sqlx::query(&insert);
            for value in row {
                q = q.bind(value.as_str());
            }
            q.execute(&mut *tx).await?;
        }
        tx.commit().await?;

        tracing::info!(table = %table, rows = rows.len(), "imported CSV");
        Ok(rows.len())
    }
}

fn decode_cell(row: &SqliteRow, idx: usize) -> Result<Cell> {
    let type_name = {
        let raw = row.try_get_raw(idx)?;
        if raw.is_null() {
            return Ok(Cell::Null);
        }
        raw.type_info().name().to_ascii_uppercase()
    };

    let cell = match type_name.as_str() {
        "INTEGER" | "INT" | "BIGINT" | "BOOLEAN" => Cell::Integer(row.try_get_unchecked(idx)?),
        "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" => Cell::Real(row.try_get_unchecked(idx)?),
        "BLOB" => Cell::Blob(row.try_get_unchecked::<Vec<u8>, _>(idx)?.len()),
        _ => Cell::Text(row.try_get_unchecked(idx)?),
    };
    Ok(cell)
}

/// Whether the statement produces a result set.
fn returns_rows(sql: &str) -> bool {
    let mut rest = sql.trim_start();
    // Skip leading line comments.
    while let Some(stripped) = rest.strip_prefix("--") {
        rest = stripped
            .split_once('\n')
            .map(|(_, tail)| tail.trim_start())
            .unwrap_or("");
    }
    let first = rest
        .split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();
    matches!(
        first.as_str(),
        "SELECT" | "WITH" | "PRAGMA" | "VALUES" | "EXPLAIN"
    )
}

/// Minimal RFC 4180 reader: quoted fields, doubled quotes, CRLF or LF.
pub fn parse_csv(text: &str) -> Result<Vec<Vec<String>>> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' if field.is_empty() => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                if !(record.len() == 1 && record[0].is_empty()) {
                    records.push(std::mem::take(&mut record));
                } else {
                    record.clear();
                }
            }
            _ => field.push(c),
        }
    }

    if in_quotes {
        bail!("CSV input ends inside a quoted field");
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    Ok(records)
}

fn sanitize_identifier(raw: &str, fallback: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_matches('_').to_string();
    if cleaned.is_empty() {
        fallback.to_string()
    } else {
        cleaned
    }
}

fn unique_columns(header: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(header.len());
    for (i, name) in header.iter().enumerate() {
        let base = sanitize_identifier(name, &format!("col_{}", i + 1));
        let mut candidate = base.clone();
        let mut n = 2;
        while out.iter().any(|c| c.eq_ignore_ascii_case(&candidate)) {
            candidate = format!("{}_{}", base, n);
            n += 1;
        }
        out.push(candidate);
    }
    out
}

async fn open_item(config: &Config, id: &str) -> Result<(ItemStore, DatabaseHandle)> {
    let store = ItemStore::new(&config.storage.root);
    let item_ref = ItemRef::new(ItemKind::Database, id)?;
    store.get(&item_ref)?;
    let handle = DatabaseHandle::open(&store.database_path(id)).await?;
    Ok((store, handle))
}

/// `chaos query <id> <sql>`
pub async fn run_query(config: &Config, id: &str, sql: &str) -> Result<()> {
    let (_store, handle) = open_item(config, id).await?;
    let outcome = handle.execute(sql, config.database.max_rows).await;
    handle.close().await;
    let outcome = outcome?;

    if let Some(n) = outcome.rows_affected {
        println!("rows affected: {}", n);
        return Ok(());
    }

    println!("{}", outcome.columns.join("\t"));
    for row in &outcome.rows {
        let line = row.iter().map(|c| c.to_string()).collect::<Vec<_>>();
        println!("{}", line.join("\t"));
    }
    if outcome.truncated {
        println!("(truncated at {} rows)", config.database.max_rows);
    }
    Ok(())
}

/// `chaos plot <id>`: renders the item's saved plot of its saved query.
pub async fn run_plot(config: &Config, id: &str, output: Option<&Path>) -> Result<()> {
    let (store, handle) = open_item(config, id).await?;
    let item = store.get(&ItemRef::new(ItemKind::Database, id)?)?;
    let (Some(query), Some(spec)) = (item.meta.query.as_deref(), item.meta.plot.as_ref()) else {
        handle.close().await;
        bail!("database {} has no saved query and plot", id);
    };

    let outcome = handle.execute(query, config.database.max_rows).await;
    handle.close().await;
    let svg = plot::render_svg(spec, &outcome?, config.plot.width, config.plot.height)?;

    match output {
        Some(path) => {
            std::fs::write(path, &svg)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("Wrote plot to {}", path.display());
        }
        None => println!("{}", svg),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_temp() -> (TempDir, DatabaseHandle) {
        let tmp = TempDir::new().unwrap();
        let handle = DatabaseHandle::open(&tmp.path().join("db.sqlite"))
            .await
            .unwrap();
        (tmp, handle)
    }

    #[tokio::test]
    async fn create_insert_select() {
        let (_tmp, db) = open_temp().await;
        let created = db
            .execute(
                "CREATE TABLE weight (day TEXT, kg REAL, note TEXT, raw BLOB); \
                 INSERT INTO weight VALUES ('2024-01-01', 80.5, NULL, x'0102');",
                100,
            )
            .await
            .unwrap();
        assert!(created.rows_affected.is_some());

        let inserted = db
            .execute("INSERT INTO weight (day, kg) VALUES ('2024-01-02', 80)", 100)
            .await
            .unwrap();
        assert_eq!(inserted.rows_affected, Some(1));

        let out = db
            .execute("SELECT day, kg, note, raw, 7 AS seven FROM weight ORDER BY day", 100)
            .await
            .unwrap();
        assert_eq!(out.columns, vec!["day", "kg", "note", "raw", "seven"]);
        assert_eq!(out.rows.len(), 2);
        assert_eq!(out.rows[0][0], Cell::Text("2024-01-01".to_string()));
        assert_eq!(out.rows[0][1], Cell::Real(80.5));
        assert!(out.rows[0][2].is_null());
        assert_eq!(out.rows[0][3], Cell::Blob(2));
        assert_eq!(out.rows[0][4], Cell::Integer(7));
        assert!(!out.truncated);
        db.close().await;
    }

    #[tokio::test]
    async fn truncates_and_reports_errors() {
        let (_tmp, db) = open_temp().await;
        let out = db
            .execute(
                "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < 20) SELECT x FROM n",
                5,
            )
            .await
            .unwrap();
        assert_eq!(out.rows.len(), 5);
        assert!(out.truncated);

        let exact = db
            .execute(
                "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < 5) SELECT x FROM n",
                5,
            )
            .await
            .unwrap();
        assert_eq!(exact.rows.len(), 5);
        assert!(!exact.truncated);

        assert!(db.execute("SELECT * FROM missing", 5).await.is_err());
        assert!(db.execute("   ", 5).await.is_err());
        db.close().await;
    }

    #[tokio::test]
    async fn empty_result_keeps_column_names() {
        let (_tmp, db) = open_temp().await;
        db.execute("CREATE TABLE t (a TEXT, b INTEGER)", 10)
            .await
            .unwrap();
        let out = db.execute("SELECT a, b AS total FROM t", 10).await.unwrap();
        assert_eq!(out.columns, vec!["a", "total"]);
        assert!(out.rows.is_empty());
        assert!(!out.truncated);
        db.close().await;
    }

    #[tokio::test]
    async fn import_csv_and_list_tables() {
        let (_tmp, db) = open_temp().await;
        let csv = "month,sales,sales\njan,10,\"1,000\"\nfeb,12,\"say \"\"hi\"\"\"\n";
        assert_eq!(db.import_csv("Monthly Sales!", csv).await.unwrap(), 2);

        let tables = db.tables().await.unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].name, "Monthly_Sales");
        assert_eq!(tables[0].columns, vec!["month", "sales", "sales_2"]);

        let out = db
            .execute("SELECT sales_2 FROM Monthly_Sales ORDER BY month DESC", 10)
            .await
            .unwrap();
        assert_eq!(out.rows[0][0], Cell::Text("1,000".to_string()));
        assert_eq!(out.rows[1][0], Cell::Text("say \"hi\"".to_string()));

        assert!(db.import_csv("ragged", "a,b\n1\n").await.is_err());
        db.close().await;
    }

    #[test]
    fn detects_row_returning_statements() {
        assert!(returns_rows("  select 1"));
        assert!(returns_rows("-- comment\nWITH x AS (SELECT 1) SELECT * FROM x"));
        assert!(returns_rows("pragma table_info(t)"));
        assert!(!returns_rows("INSERT INTO t VALUES (1)"));
        assert!(!returns_rows("create table t(x)"));
    }

    #[test]
    fn csv_parsing_edge_cases() {
        let rows = parse_csv("a,b\r\n\r\n1,\"x\ny\"\n").unwrap();
        assert_eq!(rows, vec![vec!["a", "b"], vec!["1", "x\ny"]]);
        assert_eq!(parse_csv("a,b").unwrap(), vec![vec!["a", "b"]]);
        assert!(parse_csv("\"open").is_err());
        assert!(parse_csv("").unwrap().is_empty());
    }

    #[test]
    fn cell_serialization() {
        let json = serde_json::to_string(&vec![
            Cell::Null,
            Cell::Integer(3),
            Cell::Text("x".to_string()),
            Cell::Blob(4),
        ])
        .unwrap();
        assert_eq!(json, r#"[null,3,"x","<4 bytes>"]"#);
        assert_eq!(Cell::Text(" 2.5 ".to_string()).as_f64(), Some(2.5));
    }

    #[test]
    fn non_finite_values_are_not_numbers() {
        assert_eq!(Cell::Text("inf".to_string()).as_f64(), None);
        assert_eq!(Cell::Text("-Infinity".to_string()).as_f64(), None);
        assert_eq!(Cell::Text("NaN".to_string()).as_f64(), None);
        assert_eq!(Cell::Real(f64::NAN).as_f64(), None);
        assert_eq!(Cell::Real(f64::INFINITY).as_f64(), None);
        assert_eq!(Cell::Real(-1.5).as_f64(), Some(-1.5));
    }
}
