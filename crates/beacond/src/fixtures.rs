//! File-backed collaborators: the resource inventory and metric samples.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use beacon_alerts::{LookupRegistry, ResourceDescriptor};
use beacon_metrics::MetricStore;
use tracing::info;

use crate::error::{DaemonError, Result};

/// Loads a JSON array of resource descriptors into a lookup registry.
///
/// # Errors
///
/// Returns `DaemonError::Load` if the file cannot be read or parsed.
pub fn load_inventory(path: &Path) -> Result<LookupRegistry> {
    let content = std::fs::read_to_string(path).map_err(|e| load_error(path, &e))?;
    let descriptors: Vec<ResourceDescriptor> =
        serde_json::from_str(&content).map_err(|e| load_error(path, &e))?;

    info!(path = %path.display(), resources = descriptors.len(), "loaded inventory");
    Ok(LookupRegistry::from_descriptors(descriptors))
}

/// Loads newline-delimited JSON samples into the metric store.
///
/// Returns the number of samples loaded.
///
/// # Errors
///
/// Returns `DaemonError::Load` if the file cannot be opened and
/// `DaemonError::Metrics` for a malformed sample.
pub fn load_samples(store: &MetricStore, path: &Path) -> Result<usize> {
    let file = File::open(path).map_err(|e| load_error(path, &e))?;
    let loaded = store.load_samples(BufReader::new(file))?;

    info!(path = %path.display(), samples = loaded, "loaded metric samples");
    Ok(loaded)
}

fn load_error(path: &Path, err: &dyn std::fmt::Display) -> DaemonError {
    DaemonError::Load {
        path: path.display().to_string(),
        reason: err.to_string(),
    }
}
