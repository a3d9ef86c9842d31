//! Sub-range configuration loading.
//!
//! The on-disk document is a YAML mapping whose keys are arbitrary group
//! labels (kept for the operator's benefit only) and whose values are lists
//! of `{namespace, nodePortRange}` items:
//!
//! ```yaml
//! team-ranges:
//!   - namespace: team-a
//!     nodePortRange: "30000-30099"
//!   - namespace: team-b
//!     nodePortRange: "30100-30199"
//! ```
//!
//! Items with a malformed range are skipped with a warning; a duplicate
//! namespace or any overlap between surviving ranges rejects the whole
//! document, since overlapping ranges make disjointness unsatisfiable.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use crate::error::{ConfigError, RangeParseError};
use crate::store::PortRange;

#[derive(Debug, Deserialize)]
struct RangeItem {
    namespace: String,
    #[serde(rename = "nodePortRange")]
    node_port_range: String,
}

/// One namespace's configured sub-range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceRange {
    pub namespace: String,
    pub range: PortRange,
}

/// Load and validate the per-namespace sub-range map from a YAML file.
pub async fn load(path: &Path) -> Result<Vec<NamespaceRange>, ConfigError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
    parse(&content)
}

/// Parse and validate a configuration document.
///
/// Groups are walked in sorted order, so the same document always yields
/// the same range list.
pub fn parse(content: &str) -> Result<Vec<NamespaceRange>, ConfigError> {
    let groups: BTreeMap<String, Vec<RangeItem>> = serde_yaml_ng::from_str(content)?;

    let mut ranges = Vec::new();
    let mut seen = HashSet::new();
    for (group, items) in &groups {
        for item in items {
            if item.namespace.is_empty() {
                warn!(group = %group, "skipping entry with empty namespace");
                continue;
            }
            let range = match parse_port_range(&item.node_port_range) {
                Ok(range) => range,
                Err(reason) => {
                    warn!(
                        namespace = %item.namespace,
                        range = %item.node_port_range,
                        %reason,
                        "skipping entry with invalid nodePortRange"
                    );
                    continue;
                }
            };
            if !seen.insert(item.namespace.clone()) {
                return Err(ConfigError::DuplicateNamespace {
                    namespace: item.namespace.clone(),
                });
            }
            ranges.push(NamespaceRange {
                namespace: item.namespace.clone(),
                range,
            });
        }
    }

    check_overlap(&ranges)?;
    Ok(ranges)
}

/// Parse a `"<min>-<max>"` range string and validate its bounds.
pub fn parse_port_range(raw: &str) -> Result<PortRange, RangeParseError> {
    let (min, max) = raw.split_once('-').ok_or(RangeParseError::Format)?;
    let min: u16 = min.trim().parse()?;
    let max: u16 = max.trim().parse()?;
    Ok(PortRange::new(min, max)?)
}

fn check_overlap(ranges: &[NamespaceRange]) -> Result<(), ConfigError> {
    for (i, a) in ranges.iter().enumerate() {
        for b in ranges.iter().skip(i + 1) {
            if a.range.overlaps(b.range) {
                return Err(ConfigError::Overlap {
                    first: a.namespace.clone(),
                    first_range: a.range,
                    second: b.namespace.clone(),
                    second_range: b.range,
                });
            }
        }
    }
    Ok(())
}
