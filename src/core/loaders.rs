//! Loaders for probe files and spike tables.
//!
//! This module provides parsers for:
//! - `.prb` probe files (the Python-literal `channel_groups` dictionary read by
//!   klusta, spyking-circus and phy)
//! - Spike table CSVs with `unit_id,sample[,group]` columns, the native
//!   output of external sorter adapters and the resume checkpoint format

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use csv::ReaderBuilder;
use regex::Regex;
use thiserror::Error;

use super::channel_map::{ChannelGroupMap, ChannelMapError};
use super::sorting::{Sorting, Unit, UnitId};

/// Errors that can occur during file loading.
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot open '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid probe file {path}: {reason}")]
    InvalidProbe { path: PathBuf, reason: String },

    #[error("Invalid channel grouping: {0}")]
    ChannelMap(#[from] ChannelMapError),

    #[error("Missing required columns in {path}: {columns}")]
    MissingColumns { path: PathBuf, columns: String },

    #[error("{path}: unit {unit} has a spike at sample {sample} beyond the {num_samples} recorded samples")]
    SampleOutOfRange {
        path: PathBuf,
        unit: UnitId,
        sample: u64,
        num_samples: usize,
    },

    #[error("Parse error in {path} at row {row}: {reason}")]
    ParseError {
        path: PathBuf,
        row: usize,
        reason: String,
    },
}

/// Result type for loader operations.
pub type Result<T> = std::result::Result<T, LoaderError>;

/// Load the channel groups of a `.prb` probe file.
///
/// Only the `channels` list of each group is interpreted; `graph` and
/// `geometry` entries are ignored.
pub fn load_prb<P: AsRef<Path>>(path: P) -> Result<ChannelGroupMap> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| LoaderError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    if !content.contains("channel_groups") {
        return Err(LoaderError::InvalidProbe {
            path: path.to_path_buf(),
            reason: "no channel_groups definition".to_string(),
        });
    }

    let group_pattern = Regex::new(r#"(\d+)\s*:\s*\{\s*['"]channels['"]\s*:\s*\[([^\]]*)\]"#)
        .map_err(|e| LoaderError::InvalidProbe {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    let mut groups = Vec::new();
    for captures in group_pattern.captures_iter(&content) {
        let parse_err = |reason: String| LoaderError::InvalidProbe {
            path: path.to_path_buf(),
            reason,
        };

        let group: u32 = captures[1]
            .parse()
            .map_err(|e| parse_err(format!("bad group id '{}': {}", &captures[1], e)))?;

        let channels = captures[2]
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<usize>()
                    .map_err(|e| parse_err(format!("bad channel '{}': {}", s, e)))
            })
            .collect::<Result<Vec<usize>>>()?;

        groups.push((group, channels));
    }

    if groups.is_empty() {
        return Err(LoaderError::InvalidProbe {
            path: path.to_path_buf(),
            reason: "channel_groups has no groups".to_string(),
        });
    }

    Ok(ChannelGroupMap::from_indexed_groups(groups)?)
}

/// Load a spike table CSV into a [`Sorting`].
///
/// Required columns: `unit_id`, `sample`. An optional `group` column becomes
/// the unit's `group` property. Any row-level parse failure is an error so
/// malformed sorter output is never half-read.
pub fn load_spike_table<P: AsRef<Path>>(path: P, sample_rate: f64) -> Result<Sorting> {
    load_spike_table_as(path, sample_rate, "group")
}

/// [`load_spike_table`] storing the `group` column under `group_property`.
pub fn load_spike_table_as<P: AsRef<Path>>(
    path: P,
    sample_rate: f64,
    group_property: &str,
) -> Result<Sorting> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| LoaderError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(BufReader::new(file));

    let headers = reader.headers()?.clone();
    let col_map: HashMap<String, usize> = headers
        .iter()
        .enumerate()
        .map(|(i, name)| (name.to_lowercase(), i))
        .collect();

    let (unit_idx, sample_idx) = match (col_map.get("unit_id"), col_map.get("sample")) {
        (Some(&u), Some(&s)) => (u, s),
        _ => {
            return Err(LoaderError::MissingColumns {
                path: path.to_path_buf(),
                columns: "unit_id, sample".to_string(),
            })
        }
    };
    let group_idx = col_map.get("group").copied();

    let mut trains: BTreeMap<UnitId, Vec<u64>> = BTreeMap::new();
    let mut groups: BTreeMap<UnitId, u32> = BTreeMap::new();

    for (row, result) in reader.records().enumerate() {
        let record = result?;
        let parse_err = |reason: String| LoaderError::ParseError {
            path: path.to_path_buf(),
            row: row + 1,
            reason,
        };

        let unit: UnitId = record
            .get(unit_idx)
            .ok_or_else(|| parse_err("missing unit_id".to_string()))?
            .parse()
            .map_err(|e| parse_err(format!("unit_id: {}", e)))?;
        let sample: u64 = record
            .get(sample_idx)
            .ok_or_else(|| parse_err("missing sample".to_string()))?
            .parse()
            .map_err(|e| parse_err(format!("sample: {}", e)))?;

        trains.entry(unit).or_default().push(sample);

        if let Some(field) = group_idx.and_then(|i| record.get(i)) {
            if !field.is_empty() {
                let group: u32 = field
                    .parse()
                    .map_err(|e| parse_err(format!("group: {}", e)))?;
                groups.insert(unit, group);
            }
        }
    }

    Ok(Sorting::from_units(
        sample_rate,
        trains.into_iter().map(|(id, train)| {
            let unit = Unit::new(train);
            let unit = match groups.get(&id) {
                Some(&g) => unit.with_property(group_property, g),
                None => unit,
            };
            (id, unit)
        }),
    ))
}
