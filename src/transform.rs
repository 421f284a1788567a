use std::collections::HashMap;

use regex::{Regex, RegexBuilder};
use rust_decimal::Decimal;
use tracing::debug;

use crate::currency::{parse_price, CurrencyNormalizer};
use crate::error::{PipelineError, Result};
use crate::extract::{RawListing, RawListings};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedListing {
    pub name: String,
    pub price_usd: Decimal,
}

/// Pair titles with prices, parse the prices and convert them to USD.
///
/// A name seen twice keeps its first position and takes the later price.
pub async fn transform(
    raw: &RawListings,
    currency: &CurrencyNormalizer,
    source_currency: &str,
) -> Result<Vec<NormalizedListing>> {
    let pairs = raw.pairs()?;
    let mut listings: Vec<NormalizedListing> = Vec::with_capacity(pairs.len());
    let mut seen: HashMap<String, usize> = HashMap::new();

    for RawListing { title, price } in pairs {
        let name = title.trim();
        if name.is_empty() {
            return Err(PipelineError::MalformedListing(format!(
                "empty title for price {price:?}"
            )));
        }
        let amount = parse_price(&price)?;
        let price_usd = currency.to_usd(amount, source_currency).await?;

        match seen.get(name) {
            Some(&i) => listings[i].price_usd = price_usd,
            None => {
                seen.insert(name.to_string(), listings.len());
                listings.push(NormalizedListing {
                    name: name.to_string(),
                    price_usd,
                });
            }
        }
    }

    Ok(listings)
}

pub fn compile_filter(pattern: &str, case_insensitive: bool) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .build()
        .map_err(|source| PipelineError::InvalidRegex {
            pattern: pattern.to_string(),
            source,
        })
}

/// Keep listings whose name matches `regex`.
pub fn apply_filter(listings: Vec<NormalizedListing>, regex: &Regex) -> Vec<NormalizedListing> {
    let before = listings.len();
    let kept: Vec<_> = listings
        .into_iter()
        .filter(|l| regex.is_match(&l.name))
        .collect();
    debug!(pattern = %regex, before, after = kept.len(), "Filtered listings");
    kept
}
