use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::Connection;
use tracing::info;

use crate::config::SearchInstruction;
use crate::db;
use crate::error::Result;
use crate::locators::write_atomic;
use crate::transform::NormalizedListing;

/// Destination of normalized listings.
pub enum Sink {
    Database(Connection),
    /// `<output_path>/<category>/<keyword slug>/products.csv`, replaced on
    /// every write.
    Csv,
}

impl Sink {
    pub fn persist(
        &self,
        website: &str,
        instruction: &SearchInstruction,
        listings: &[NormalizedListing],
    ) -> Result<usize> {
        let written = match self {
            Sink::Database(conn) => db::persist(conn, website, &instruction.category, listings)?,
            Sink::Csv => {
                let path = csv_path(instruction);
                write_csv(&path, listings)?;
                listings.len()
            }
        };
        info!(instruction = %instruction.id(), written, "Persisted listings");
        Ok(written)
    }
}

pub fn csv_path(instruction: &SearchInstruction) -> PathBuf {
    PathBuf::from(&instruction.output_path)
        .join(&instruction.category)
        .join(slug(&instruction.keyword))
        .join("products.csv")
}

fn slug(s: &str) -> String {
    s.trim()
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

fn write_csv(path: &Path, listings: &[NormalizedListing]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out = String::from("Product,Price (USD)\n");
    for l in listings {
        out.push_str(&csv_field(&l.name));
        out.push(',');
        out.push_str(&l.price_usd.to_string());
        out.push('\n');
    }
    write_atomic(path, &out)?;
    Ok(())
}

fn csv_field(s: &str) -> String {
    if s.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
