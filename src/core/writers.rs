//! Data writers for probe files, spike tables, raw traces and phy arrays.
//!
//! This module provides functions for writing pipeline artifacts:
//! - `.prb` probe files describing channel groups
//! - Spike table CSVs (`unit_id,sample,group`)
//! - Sample-major `float32` binary copies of a recording
//! - NumPy `.npy` arrays (format 1.0, little endian) and TSV tables for phy

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use thiserror::Error;

use super::channel_map::ChannelGroupMap;
use super::recording::{RecordingError, RecordingSource};
use super::sorting::Sorting;

/// Samples per channel read at once when copying a recording.
const COPY_CHUNK_SAMPLES: usize = 65_536;

/// Errors that can occur during write operations.
#[derive(Error, Debug)]
pub enum WriteError {
    /// Failed to create parent directories.
    #[error("failed to create parent directories for '{path}': {source}")]
    CreateDirectory {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to create or open file for writing.
    #[error("failed to create file '{path}': {source}")]
    CreateFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to write data to file.
    #[error("failed to write to file '{path}': {source}")]
    WriteFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// CSV writing error.
    #[error("CSV write error for '{path}': {source}")]
    CsvError {
        path: String,
        #[source]
        source: csv::Error,
    },

    /// Reading samples for a copy failed.
    #[error("failed to read samples for '{path}': {source}")]
    ReadRecording {
        path: String,
        #[source]
        source: RecordingError,
    },

    /// Array data does not match its declared shape.
    #[error("shape mismatch: shape {shape:?} needs {expected} elements, got {found}")]
    ShapeMismatch {
        shape: Vec<usize>,
        expected: usize,
        found: usize,
    },
}

/// Result type for write operations.
pub type Result<T> = std::result::Result<T, WriteError>;

/// Creates parent directories for a file path if they don't exist.
fn ensure_parent_dirs(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| WriteError::CreateDirectory {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
    }
    Ok(())
}

/// Creates a buffered writer for the given path.
fn create_buffered_writer(path: &Path) -> Result<BufWriter<File>> {
    ensure_parent_dirs(path)?;
    let file = File::create(path).map_err(|e| WriteError::CreateFile {
        path: path.display().to_string(),
        source: e,
    })?;
    Ok(BufWriter::new(file))
}

fn write_err(path: &Path) -> impl Fn(std::io::Error) -> WriteError + '_ {
    move |e| WriteError::WriteFile {
        path: path.display().to_string(),
        source: e,
    }
}

/// Write a channel group map as a `.prb` probe file.
///
/// Each group gets its `channels`, a fully connected adjacency `graph`, and a
/// `geometry` entry from [`ChannelGroupMap::geometry`].
pub fn write_prb(path: &Path, map: &ChannelGroupMap) -> Result<()> {
    let mut writer = create_buffered_writer(path)?;
    let on_err = write_err(path);
    let geometry = map.geometry();

    let mut text = String::from("channel_groups = {\n");
    for (group, channels) in map.iter() {
        let channel_list: Vec<String> = channels.iter().map(|c| c.to_string()).collect();

        let mut edges = Vec::new();
        for (i, a) in channels.iter().enumerate() {
            for b in &channels[i + 1..] {
                edges.push(format!("({}, {})", a, b));
            }
        }

        let positions: Vec<String> = channels
            .iter()
            .filter_map(|c| geometry.get(c).map(|[x, y]| format!("{}: [{:.1}, {:.1}]", c, x, y)))
            .collect();

        text.push_str(&format!("    {}: {{\n", group));
        text.push_str(&format!("        'channels': [{}],\n", channel_list.join(", ")));
        text.push_str(&format!("        'graph': [{}],\n", edges.join(", ")));
        text.push_str(&format!("        'geometry': {{{}}},\n", positions.join(", ")));
        text.push_str("    },\n");
    }
    text.push_str("}\n");

    writer.write_all(text.as_bytes()).map_err(&on_err)?;
    writer.flush().map_err(&on_err)?;
    Ok(())
}

/// Write a sorting as a `unit_id,sample,group` CSV, one row per spike.
pub fn write_spike_table(path: &Path, sorting: &Sorting) -> Result<()> {
    write_spike_table_as(path, sorting, "group")
}

/// [`write_spike_table`] filling the `group` column from `group_property`.
pub fn write_spike_table_as(path: &Path, sorting: &Sorting, group_property: &str) -> Result<()> {
    let buf_writer = create_buffered_writer(path)?;
    let mut csv_writer = csv::Writer::from_writer(buf_writer);
    let path_str = path.display().to_string();
    let group_key = [group_property.to_string()];

    csv_writer
        .write_record(["unit_id", "sample", "group"])
        .map_err(|e| WriteError::CsvError {
            path: path_str.clone(),
            source: e,
        })?;

    for (id, unit) in sorting.iter() {
        let group = sorting
            .resolve_group(id, &group_key)
            .map(|g| g.to_string())
            .unwrap_or_default();
        for sample in &unit.spike_train {
            csv_writer
                .write_record([id.to_string(), sample.to_string(), group.clone()])
                .map_err(|e| WriteError::CsvError {
                    path: path_str.clone(),
                    source: e,
                })?;
        }
    }

    csv_writer.flush().map_err(|e| WriteError::WriteFile {
        path: path_str,
        source: e,
    })?;

    Ok(())
}

/// Copy the visible channels of a recording as sample-major `float32`.
///
/// Returns the number of frames written.
pub fn write_recording_dat(path: &Path, recording: &RecordingSource) -> Result<usize> {
    let mut writer = create_buffered_writer(path)?;
    let on_err = write_err(path);
    let channels = recording.channel_ids().to_vec();
    let total = recording.num_samples();

    let mut start = 0;
    while start < total {
        let end = (start + COPY_CHUNK_SAMPLES).min(total);
        let rows = recording
            .read_channels(&channels, start..end)
            .map_err(|e| WriteError::ReadRecording {
                path: path.display().to_string(),
                source: e,
            })?;

        for t in 0..end - start {
            for row in &rows {
                writer.write_all(&row[t].to_le_bytes()).map_err(&on_err)?;
            }
        }
        start = end;
    }

    writer.flush().map_err(&on_err)?;
    Ok(total)
}

/// Element types that can be stored in a `.npy` file.
pub trait NpyElement: Copy {
    /// NumPy dtype descriptor, e.g. `<i8`.
    const DESCR: &'static str;

    fn write_le<W: Write>(&self, writer: &mut W) -> std::io::Result<()>;
}

impl NpyElement for i64 {
    const DESCR: &'static str = "<i8";

    fn write_le<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&self.to_le_bytes())
    }
}

impl NpyElement for i32 {
    const DESCR: &'static str = "<i4";

    fn write_le<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&self.to_le_bytes())
    }
}

impl NpyElement for f32 {
    const DESCR: &'static str = "<f4";

    fn write_le<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&self.to_le_bytes())
    }
}

/// Build the padded NumPy 1.0 header for a C-order array.
fn npy_header(descr: &str, shape: &[usize]) -> Vec<u8> {
    let shape_str = match shape {
        [n] => format!("({},)", n),
        dims => format!(
            "({})",
            dims.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(", ")
        ),
    };
    let mut dict = format!(
        "{{'descr': '{}', 'fortran_order': False, 'shape': {}, }}",
        descr, shape_str
    );

    // magic (6) + version (2) + header length (2) + dict + '\n' is 64-byte aligned
    let unpadded = 10 + dict.len() + 1;
    let padding = (64 - unpadded % 64) % 64;
    dict.push_str(&" ".repeat(padding));
    dict.push('\n');

    let mut header = Vec::with_capacity(10 + dict.len());
    header.extend_from_slice(b"\x93NUMPY");
    header.extend_from_slice(&[1, 0]);
    header.extend_from_slice(&(dict.len() as u16).to_le_bytes());
    header.extend_from_slice(dict.as_bytes());
    header
}

/// Write a C-order array with the given shape to a `.npy` file.
pub fn write_npy<T: NpyElement>(path: &Path, shape: &[usize], data: &[T]) -> Result<()> {
    let expected: usize = shape.iter().product();
    if expected != data.len() {
        return Err(WriteError::ShapeMismatch {
            shape: shape.to_vec(),
            expected,
            found: data.len(),
        });
    }

    let mut writer = create_buffered_writer(path)?;
    let on_err = write_err(path);

    writer
        .write_all(&npy_header(T::DESCR, shape))
        .map_err(&on_err)?;
    for value in data {
        value.write_le(&mut writer).map_err(&on_err)?;
    }
    writer.flush().map_err(&on_err)?;
    Ok(())
}

/// Write a small text file, creating parent directories.
pub fn write_text(path: &Path, text: &str) -> Result<()> {
    let mut writer = create_buffered_writer(path)?;
    let on_err = write_err(path);
    writer.write_all(text.as_bytes()).map_err(&on_err)?;
    writer.flush().map_err(&on_err)?;
    Ok(())
}

/// Write a tab-separated table with a header row.
pub fn write_tsv(path: &Path, header: &[&str], rows: &[Vec<String>]) -> Result<()> {
    let buf_writer = create_buffered_writer(path)?;
    let mut tsv_writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(buf_writer);
    let path_str = path.display().to_string();

    tsv_writer
        .write_record(header)
        .map_err(|e| WriteError::CsvError {
            path: path_str.clone(),
            source: e,
        })?;
    for row in rows {
        tsv_writer
            .write_record(row)
            .map_err(|e| WriteError::CsvError {
                path: path_str.clone(),
                source: e,
            })?;
    }

    tsv_writer.flush().map_err(|e| WriteError::WriteFile {
        path: path_str,
        source: e,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::loaders::{load_prb, load_spike_table, load_spike_table_as};
    use crate::core::sorting::Unit;
    use tempfile::tempdir;

    #[test]
    fn test_prb_written_and_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("channel_map.prb");
        let map = ChannelGroupMap::for_tetrodes(&[1, 4], 4).unwrap();

        write_prb(&path, &map).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("channel_groups = {"));
        assert!(content.contains("'channels': [12, 13, 14, 15]"));
        assert!(content.contains("(12, 13)"));
        assert_eq!(load_prb(&path).unwrap(), map);
    }

    #[test]
    fn test_spike_table_round_trip_keeps_ids() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sorting.csv");
        let sorting = Sorting::from_units(
            30_000.0,
            [
                (12, Unit::new(vec![5, 9]).with_property("group", 3)),
                (40, Unit::new(vec![1])),
            ],
        );

        write_spike_table(&path, &sorting).unwrap();
        let loaded = load_spike_table(&path, 30_000.0).unwrap();

        assert_eq!(loaded, sorting);
    }

    #[test]
    fn test_spike_table_keeps_custom_group_property() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sorting.csv");
        let sorting = Sorting::from_units(
            30_000.0,
            [(2, Unit::new(vec![7, 8]).with_property("tetrode", 5))],
        );

        write_spike_table_as(&path, &sorting, "tetrode").unwrap();
        let loaded = load_spike_table_as(&path, 30_000.0, "tetrode").unwrap();

        assert_eq!(loaded, sorting);
    }

    #[test]
    fn test_npy_header_alignment_and_shape() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("templates.npy");
        let data = vec![0.5f32; 2 * 3 * 4];

        write_npy(&path, &[2, 3, 4], &data).unwrap();

        let bytes = fs::read(&path).unwrap();
        assert_eq!(&bytes[..6], b"\x93NUMPY");
        let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
        assert_eq!((10 + header_len) % 64, 0);
        let header = std::str::from_utf8(&bytes[10..10 + header_len]).unwrap();
        assert!(header.contains("'descr': '<f4'"));
        assert!(header.contains("'shape': (2, 3, 4)"));
        assert!(header.ends_with('\n'));
        assert_eq!(bytes.len(), 10 + header_len + data.len() * 4);
    }

    #[test]
    fn test_npy_one_dimensional_shape() {
        let header = npy_header("<i8", &[7]);
        let text = String::from_utf8_lossy(&header[10..]).to_string();
        assert!(text.contains("'shape': (7,)"));
    }

    #[test]
    fn test_npy_shape_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.npy");
        let result = write_npy(&path, &[2, 2], &[1i32, 2, 3]);

        match result.unwrap_err() {
            WriteError::ShapeMismatch {
                expected, found, ..
            } => {
                assert_eq!(expected, 4);
                assert_eq!(found, 3);
            }
            other => panic!("Expected ShapeMismatch error, got {other:?}"),
        }
    }

    #[test]
    fn test_write_recording_dat_interleaves_visible_channels() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("recording.dat");
        let rec = RecordingSource::from_rows(
            vec![vec![1.0, 2.0], vec![10.0, 20.0], vec![100.0, 200.0]],
            1000.0,
        )
        .unwrap();
        let map = ChannelGroupMap::from_groups(&[vec![0, 2]]).unwrap();
        let grouped = rec.with_channel_groups(map).unwrap();

        let frames = write_recording_dat(&path, &grouped).unwrap();
        assert_eq!(frames, 2);

        let bytes = fs::read(&path).unwrap();
        let values: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        assert_eq!(values, vec![1.0, 100.0, 2.0, 200.0]);
    }

    #[test]
    fn test_write_tsv() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cluster_group.tsv");
        write_tsv(
            &path,
            &["cluster_id", "group"],
            &[vec!["3".to_string(), "unsorted".to_string()]],
        )
        .unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "cluster_id\tgroup\n3\tunsorted\n");
    }
}
