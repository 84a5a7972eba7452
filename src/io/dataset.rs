//! JSONL datasets: one `{"id": "...", "vector": [...]}` object per line.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::vector::{IngestReport, VectorStore};

/// One dataset line.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Record {
    pub id: String,
    pub vector: Vec<f32>,
}

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("Dataset I/O error: {0}\nSuggestion: Check that the file exists and is readable")]
    Io(#[from] io::Error),

    #[error(
        "Malformed record on line {line}: {source}\nSuggestion: Each line must look like {{\"id\": \"a\", \"vector\": [0.1, 0.2]}}"
    )]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Reads every record, skipping blank lines.
pub fn read_records<R: BufRead>(reader: R) -> Result<Vec<Record>, DatasetError> {
    let mut records = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let record = serde_json::from_str(trimmed).map_err(|source| DatasetError::Parse {
            line: index + 1,
            source,
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Loads a dataset file as one ingestion batch.
pub fn load_store(path: impl AsRef<Path>) -> Result<(VectorStore, IngestReport), DatasetError> {
    let path = path.as_ref();
    let records = read_records(BufReader::new(File::open(path)?))?;
    let count = records.len();

    let mut store = VectorStore::new();
    let report = store.ingest_batch(records.into_iter().map(|r| (r.id, r.vector)));
    tracing::debug!(path = %path.display(), records = count, dimension = store.dimension(), "loaded dataset");
    Ok((store, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_skips_blank_lines() {
        let input = "{\"id\":\"a\",\"vector\":[1.0,0.0]}\n\n{\"id\":\"b\",\"vector\":[0.0,1.0]}\n";
        let records = read_records(input.as_bytes()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].id, "b");
    }

    #[test]
    fn test_malformed_line_reports_position() {
        let input = "{\"id\":\"a\",\"vector\":[1.0]}\n{\"id\":\"b\"}\n";
        match read_records(input.as_bytes()) {
            Err(DatasetError::Parse { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_load_applies_ingestion_policy() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("data.jsonl");
        std::fs::write(
            &path,
            "{\"id\":\"a\",\"vector\":[1,2,3]}\n{\"id\":\"b\",\"vector\":[1,2,3]}\n{\"id\":\"c\",\"vector\":[1]}\n",
        )
        .unwrap();

        let (store, report) = load_store(&path).unwrap();
        assert_eq!(store.dimension(), 3);
        assert_eq!(report.padded, 1);
        assert_eq!(store.get("c").unwrap(), &[1.0, 0.0, 0.0]);
    }
}
