use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};

use crate::error::{PipelineError, Result};
use crate::transform::NormalizedListing;

const FACT_TABLE_PREFIX: &str = "listings_";

pub fn connect(path: &str) -> Result<Connection> {
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    // Other pipeline processes may hold the write lock briefly.
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS websites (
            id         INTEGER PRIMARY KEY,
            name       TEXT UNIQUE NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        ",
    )
    .map_err(|source| PipelineError::Schema {
        table: "websites".into(),
        source,
    })
}

/// Fact table holding the records of `category`. Category names end up in
/// SQL identifiers, so only ASCII letters, digits and `_` are allowed.
pub fn fact_table(category: &str) -> Result<String> {
    let name = category.trim().to_ascii_lowercase().replace([' ', '-'], "_");
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(PipelineError::InvalidCategory(category.to_string()));
    }
    Ok(format!("{FACT_TABLE_PREFIX}{name}"))
}

pub fn ensure_fact_table(conn: &Connection, category: &str) -> Result<String> {
    let table = fact_table(category)?;
    init_schema(conn)?;
    conn.execute_batch(&format!(
        "
        CREATE TABLE IF NOT EXISTS {table} (
            id           INTEGER PRIMARY KEY,
            website_id   INTEGER NOT NULL REFERENCES websites(id),
            product_name TEXT NOT NULL,
            price_usd    TEXT NOT NULL,
            recorded_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_{table}_website ON {table}(website_id);
        "
    ))
    .map_err(|source| PipelineError::Schema {
        table: table.clone(),
        source,
    })?;
    Ok(table)
}

// ── Dimensions ──

/// Id of the website row named `name`, inserting it if missing.
///
/// The IMMEDIATE transaction takes the write lock before the lookup, so two
/// processes cannot both miss and insert.
pub fn get_or_create_website(conn: &Connection, name: &str) -> Result<i64> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let existing: Option<i64> = tx
        .query_row("SELECT id FROM websites WHERE name = ?1", [name], |r| r.get(0))
        .optional()?;
    let id = match existing {
        Some(id) => id,
        None => tx.query_row(
            "INSERT INTO websites (name) VALUES (?1)
             ON CONFLICT(name) DO UPDATE SET name = excluded.name
             RETURNING id",
            [name],
            |r| r.get(0),
        )?,
    };
    tx.commit()?;
    Ok(id)
}

// ── Facts ──

/// Insert all listings in one transaction: either every row lands or none.
pub fn insert_listings(
    conn: &Connection,
    table: &str,
    website_id: i64,
    listings: &[NormalizedListing],
    recorded_at: DateTime<Utc>,
) -> Result<usize> {
    let recorded_at = recorded_at.to_rfc3339_opts(SecondsFormat::Secs, true);
    let tx = conn.unchecked_transaction()?;
    let mut count = 0;
    {
        let mut stmt = tx.prepare(&format!(
            "INSERT INTO {table} (website_id, product_name, price_usd, recorded_at)
             VALUES (?1, ?2, ?3, ?4)"
        ))?;
        for l in listings {
            count += stmt.execute(rusqlite::params![
                website_id,
                l.name,
                l.price_usd.to_string(),
                recorded_at,
            ])?;
        }
    }
    tx.commit()?;
    Ok(count)
}

pub fn persist(
    conn: &Connection,
    website: &str,
    category: &str,
    listings: &[NormalizedListing],
) -> Result<usize> {
    let table = ensure_fact_table(conn, category)?;
    let website_id = get_or_create_website(conn, website)?;
    insert_listings(conn, &table, website_id, listings, Utc::now())
}

// ── Queries ──

pub struct RecordRow {
    pub id: i64,
    pub website: String,
    pub product_name: String,
    pub price_usd: String,
    pub recorded_at: String,
}

pub fn fetch_records(conn: &Connection, category: &str, limit: usize) -> Result<Vec<RecordRow>> {
    let table = fact_table(category)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT f.id, w.name, f.product_name, f.price_usd, f.recorded_at
         FROM {table} f
         JOIN websites w ON w.id = f.website_id
         ORDER BY f.id DESC
         LIMIT {limit}"
    ))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(RecordRow {
                id: row.get(0)?,
                website: row.get(1)?,
                product_name: row.get(2)?,
                price_usd: row.get(3)?,
                recorded_at: row.get(4)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub struct Stats {
    pub websites: usize,
    /// (category, record count)
    pub categories: Vec<(String, usize)>,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    init_schema(conn)?;
    let websites: usize = conn.query_row("SELECT COUNT(*) FROM websites", [], |r| r.get(0))?;

    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name LIKE 'listings\\_%' ESCAPE '\\'
         ORDER BY name",
    )?;
    let tables = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut categories = Vec::with_capacity(tables.len());
    for table in tables {
        let count: usize =
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?;
        let category = table.trim_start_matches(FACT_TABLE_PREFIX).to_string();
        categories.push((category, count));
    }
    Ok(Stats {
        websites,
        categories,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::dec;

    fn listing(name: &str, price: &str) -> NormalizedListing {
        NormalizedListing {
            name: name.into(),
            price_usd: dec(price),
        }
    }

    fn memory() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
        conn
    }

    fn count(conn: &Connection, sql: &str) -> i64 {
        conn.query_row(sql, [], |r| r.get(0)).unwrap()
    }

    #[test]
    fn fact_table_names() {
        assert_eq!(fact_table("smartphone").unwrap(), "listings_smartphone");
        assert_eq!(fact_table(" Smart-Watch ").unwrap(), "listings_smart_watch");
        assert!(matches!(
            fact_table("phones; DROP TABLE websites"),
            Err(PipelineError::InvalidCategory(_))
        ));
        assert!(fact_table("").is_err());
    }

    #[test]
    fn schema_creation_is_idempotent() {
        let conn = memory();
        ensure_fact_table(&conn, "smartphone").unwrap();
        ensure_fact_table(&conn, "smartphone").unwrap();
        assert_eq!(
            count(&conn, "SELECT COUNT(*) FROM sqlite_master WHERE name = 'listings_smartphone'"),
            1
        );
    }

    #[test]
    fn website_get_or_create_is_idempotent() {
        let conn = memory();
        init_schema(&conn).unwrap();
        let first = get_or_create_website(&conn, "flipkart").unwrap();
        let second = get_or_create_website(&conn, "flipkart").unwrap();
        let other = get_or_create_website(&conn, "amazon").unwrap();

        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM websites WHERE name = 'flipkart'"), 1);
    }

    #[test]
    fn persisting_twice_reuses_the_dimension_row() {
        let conn = memory();
        let rows = [listing("GIONEE Max (64GB)", "124.99")];
        persist(&conn, "flipkart", "smartphone", &rows).unwrap();
        persist(&conn, "flipkart", "smartphone", &rows).unwrap();

        assert_eq!(count(&conn, "SELECT COUNT(*) FROM websites"), 1);
        assert_eq!(count(&conn, "SELECT COUNT(DISTINCT website_id) FROM listings_smartphone"), 1);
    }

    #[test]
    fn inserted_rows_keep_exact_prices() {
        let conn = memory();
        let n = persist(
            &conn,
            "flipkart",
            "smartphone",
            &[listing("A", "124.99"), listing("B", "62.50")],
        )
        .unwrap();
        assert_eq!(n, 2);

        let records = fetch_records(&conn, "smartphone", 10).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].product_name, "B");
        assert_eq!(records[0].price_usd, "62.50");
        assert_eq!(records[1].website, "flipkart");
        assert!(records[1].recorded_at.ends_with('Z'));
    }

    #[test]
    fn failed_insert_leaves_nothing_behind() {
        let conn = memory();
        let table = ensure_fact_table(&conn, "smartphone").unwrap();
        // No websites row with id 42: the foreign key rejects the batch.
        let err = insert_listings(&conn, &table, 42, &[listing("A", "1.00")], Utc::now());
        assert!(matches!(err, Err(PipelineError::Database(_))));
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM listings_smartphone"), 0);
    }

    #[test]
    fn stats_per_category() {
        let conn = memory();
        persist(&conn, "flipkart", "smartphone", &[listing("A", "1.00")]).unwrap();
        persist(&conn, "flipkart", "laptop", &[listing("B", "2.00"), listing("C", "3.00")]).unwrap();

        let s = get_stats(&conn).unwrap();
        assert_eq!(s.websites, 1);
        assert_eq!(
            s.categories,
            vec![("laptop".to_string(), 2), ("smartphone".to_string(), 1)]
        );
    }

    #[test]
    fn concurrent_connections_share_one_dimension_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("listings.sqlite");
        let path = path.to_str().unwrap().to_string();
        init_schema(&connect(&path).unwrap()).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let conn = connect(&path).unwrap();
                    get_or_create_website(&conn, "flipkart").unwrap()
                })
            })
            .collect();
        let ids: Vec<i64> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        let conn = connect(&path).unwrap();
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM websites"), 1);
    }
}
