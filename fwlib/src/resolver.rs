use std::cmp::Ordering;

use log::debug;
use thiserror::Error;

use crate::{
    devices::{Device, DeviceCatalog},
    similarity,
};

/// Maximum number of suggestions offered for an unknown device name.
pub const MAX_SUGGESTIONS: usize = 3;

/// Minimum similarity ratio for a catalog name to be suggested.
pub const SIMILARITY_CUTOFF: f64 = 0.6;

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ResolveError {
    #[error("{}", not_found_message(.query, .suggestions))]
    DeviceNotFound {
        query: String,
        /// Best matches first
        suggestions: Vec<String>,
    },
}

fn not_found_message(query: &str, suggestions: &[String]) -> String {
    if suggestions.is_empty() {
        format!("No device matches {query:?}")
    } else {
        format!("No device matches {query:?}. Did you mean: {}?", suggestions.join(", "))
    }
}

/// Resolve a user-supplied device name to a catalog entry. The first strategy
/// that succeeds wins:
///
/// 1. Exact match
/// 2. Case-insensitive match
/// 3. Case-insensitive substring match, if exactly one name contains the query
///
/// Approximate matches are never selected automatically. They are only
/// returned as suggestions in [`ResolveError::DeviceNotFound`].
pub fn resolve<'a>(query: &str, catalog: &'a DeviceCatalog) -> Result<&'a Device, ResolveError> {
    let query = query.trim();

    if let Some(device) = catalog.get(query) {
        return Ok(device);
    }

    let needle = query.to_lowercase();

    if let Some(device) = catalog.iter().find(|d| d.name.to_lowercase() == needle) {
        debug!("Resolved {query:?} to {:?} ignoring case", device.name);
        return Ok(device);
    }

    let mut containing = catalog.iter().filter(|d| d.name.to_lowercase().contains(&needle));
    if let (Some(device), None) = (containing.next(), containing.next()) {
        debug!("Resolved {query:?} to {:?} by substring", device.name);
        return Ok(device);
    }

    Err(ResolveError::DeviceNotFound {
        query: query.to_owned(),
        suggestions: suggest(&needle, catalog),
    })
}

/// Rank catalog names by similarity to the (lowercase) query. Ties are broken
/// by name in descending order so that the ranking is deterministic. The ratio
/// is not symmetric, so the candidate name always goes first.
fn suggest(needle: &str, catalog: &DeviceCatalog) -> Vec<String> {
    let mut scored: Vec<(f64, &str)> = catalog.iter()
        .map(|d| (similarity::ratio(&d.name.to_lowercase(), needle), d.name.as_str()))
        .filter(|(score, _)| *score >= SIMILARITY_CUTOFF)
        .collect();

    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.1.cmp(a.1))
    });

    debug!("Suggestions for {needle:?}: {scored:?}");

    scored.into_iter()
        .take(MAX_SUGGESTIONS)
        .map(|(_, name)| name.to_owned())
        .collect()
}
