//! Dataset references and raw record readers.

use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, DataError};

/// A parsed `dataset` / `eval_dataset` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatasetRef {
    /// JSON-lines file; each record carries `input_ids` (optionally with
    /// `labels`) or `text`.
    Jsonl(PathBuf),
    /// `synthetic:<n>`: `n` deterministic generated records.
    Synthetic { count: usize },
}

impl DatasetRef {
    pub fn parse(reference: &str) -> Result<Self, ConfigError> {
        let reference = reference.trim();
        if let Some(count) = reference.strip_prefix("synthetic:") {
            let count = count
                .parse::<usize>()
                .map_err(|_| ConfigError::UnsupportedDataset {
                    reference: reference.to_string(),
                })?;
            return Ok(Self::Synthetic { count });
        }
        if reference.ends_with(".jsonl") || reference.ends_with(".json") {
            return Ok(Self::Jsonl(PathBuf::from(reference)));
        }
        Err(ConfigError::UnsupportedDataset {
            reference: reference.to_string(),
        })
    }
}

/// A record before preprocessing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawRecord {
    Tokens(Vec<u32>),
    /// Token ids with per-position labels; [`IGNORE_INDEX`] positions are not trained on.
    Labeled { input_ids: Vec<u32>, labels: Vec<i64> },
    Text(String),
    /// Neither `input_ids` nor `text`; dropped during preprocessing.
    Empty,
}

/// Label value that excludes a position from the loss.
pub const IGNORE_INDEX: i64 = -100;

#[derive(Deserialize)]
struct JsonlRecord {
    #[serde(default)]
    input_ids: Option<Vec<u32>>,
    #[serde(default)]
    labels: Option<Vec<i64>>,
    #[serde(default)]
    text: Option<String>,
}

/// Labels must align with `input_ids` and either repeat the id or be [`IGNORE_INDEX`].
fn check_labels(input_ids: &[u32], labels: &[i64]) -> Result<(), String> {
    if labels.len() != input_ids.len() {
        return Err(format!(
            "{} labels for {} input_ids",
            labels.len(),
            input_ids.len()
        ));
    }
    match input_ids
        .iter()
        .zip(labels)
        .position(|(&id, &label)| label != IGNORE_INDEX && label != i64::from(id))
    {
        Some(pos) => Err(format!(
            "label {} at position {pos} is neither {IGNORE_INDEX} nor the input id {}",
            labels[pos], input_ids[pos]
        )),
        None => Ok(()),
    }
}

/// Read every raw record behind a dataset reference, in file order.
pub fn read_records(reference: &DatasetRef) -> Result<Vec<RawRecord>, DataError> {
    match reference {
        DatasetRef::Synthetic { count } => Ok((0..*count).map(synthetic_record).collect()),
        DatasetRef::Jsonl(path) => read_jsonl(path),
    }
}

fn read_jsonl(path: &Path) -> Result<Vec<RawRecord>, DataError> {
    let file = File::open(path).map_err(|e| DataError::Read {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let mut records = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| DataError::Read {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let record: JsonlRecord = serde_json::from_str(&line).map_err(|e| DataError::Parse {
            path: path.to_path_buf(),
            line: idx + 1,
            message: e.to_string(),
        })?;
        let parse_error = |message: String| DataError::Parse {
            path: path.to_path_buf(),
            line: idx + 1,
            message,
        };
        records.push(match (record.input_ids, record.labels, record.text) {
            (Some(input_ids), Some(labels), _) => {
                check_labels(&input_ids, &labels).map_err(parse_error)?;
                RawRecord::Labeled { input_ids, labels }
            }
            (Some(ids), None, _) => RawRecord::Tokens(ids),
            (None, Some(_), _) => return Err(parse_error("labels require input_ids".into())),
            (None, None, Some(text)) => RawRecord::Text(text),
            (None, None, None) => RawRecord::Empty,
        });
    }
    Ok(records)
}

/// Deterministic token record `i`: between 8 and 31 ids in `1..=251`.
fn synthetic_record(i: usize) -> RawRecord {
    let len = 8 + i % 24;
    RawRecord::Tokens(
        (0..len)
            .map(|j| ((i * 7 + j * 13 + (i * j) % 5) % 251 + 1) as u32)
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_references() {
        assert_eq!(
            DatasetRef::parse("synthetic:9").unwrap(),
            DatasetRef::Synthetic { count: 9 }
        );
        assert_eq!(
            DatasetRef::parse("data/train.jsonl").unwrap(),
            DatasetRef::Jsonl(PathBuf::from("data/train.jsonl"))
        );
        assert!(DatasetRef::parse("lmsys/lmsys-chat-1m").is_err());
        assert!(DatasetRef::parse("synthetic:many").is_err());
    }

    #[test]
    fn test_synthetic_is_deterministic_and_nonempty() {
        let a = read_records(&DatasetRef::Synthetic { count: 30 }).unwrap();
        let b = read_records(&DatasetRef::Synthetic { count: 30 }).unwrap();
        assert_eq!(a, b);
        for record in &a {
            match record {
                RawRecord::Tokens(ids) => {
                    assert!(ids.len() >= 8);
                    assert!(ids.iter().all(|&t| (1..=251).contains(&t)));
                }
                other => panic!("unexpected record {other:?}"),
            }
        }
    }

    #[test]
    fn test_read_jsonl_mixed_records() {
        let mut file = tempfile::Builder::new().suffix(".jsonl").tempfile().unwrap();
        writeln!(file, r#"{{"input_ids": [5, 6, 7]}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"text": "hello", "source": "web"}}"#).unwrap();
        writeln!(file, r#"{{"other": 1}}"#).unwrap();
        let records = read_records(&DatasetRef::Jsonl(file.path().to_path_buf())).unwrap();
        assert_eq!(
            records,
            vec![
                RawRecord::Tokens(vec![5, 6, 7]),
                RawRecord::Text("hello".into()),
                RawRecord::Empty,
            ]
        );
    }

    #[test]
    fn test_read_jsonl_labeled_records() {
        let mut file = tempfile::Builder::new().suffix(".jsonl").tempfile().unwrap();
        writeln!(file, r#"{{"input_ids": [5, 6, 7], "labels": [-100, 6, 7]}}"#).unwrap();
        let records = read_records(&DatasetRef::Jsonl(file.path().to_path_buf())).unwrap();
        assert_eq!(
            records,
            vec![RawRecord::Labeled {
                input_ids: vec![5, 6, 7],
                labels: vec![-100, 6, 7],
            }]
        );
    }

    #[test]
    fn test_misaligned_labels_are_rejected() {
        for bad in [
            r#"{"input_ids": [5, 6], "labels": [5]}"#,
            r#"{"input_ids": [5, 6], "labels": [5, 9]}"#,
            r#"{"text": "hi", "labels": [1, 2]}"#,
        ] {
            let mut file = tempfile::Builder::new().suffix(".jsonl").tempfile().unwrap();
            writeln!(file, "{bad}").unwrap();
            let err = read_records(&DatasetRef::Jsonl(file.path().to_path_buf())).unwrap_err();
            assert!(matches!(err, DataError::Parse { line: 1, .. }), "{bad}: {err}");
        }
    }

    #[test]
    fn test_read_jsonl_reports_line_of_bad_record() {
        let mut file = tempfile::Builder::new().suffix(".jsonl").tempfile().unwrap();
        writeln!(file, r#"{{"text": "ok"}}"#).unwrap();
        writeln!(file, "not json").unwrap();
        let err = read_records(&DatasetRef::Jsonl(file.path().to_path_buf())).unwrap_err();
        assert!(matches!(err, DataError::Parse { line: 2, .. }));
    }
}
