//! JSON-lines output of per-token attribution scores.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;

use crate::Result;

/// One token and its score for every class.
///
/// Serializes as `{"token": "cat", "0": 0.1, "1": -0.3, ...}` with the token
/// first and class keys in ascending order.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenAttribution {
    pub token: String,
    pub scores: Vec<f32>,
}

impl Serialize for TokenAttribution {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.scores.len() + 1))?;
        map.serialize_entry("token", &self.token)?;
        for (class, score) in self.scores.iter().enumerate() {
            map.serialize_entry(&class.to_string(), score)?;
        }
        map.end()
    }
}

/// Attribution scores of one instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributionRecord {
    pub tokens: Vec<TokenAttribution>,
}

impl AttributionRecord {
    /// Pairs `tokens` with their per-class scores.
    ///
    /// `scores[class][position]`; positions past `tokens.len()` are dropped.
    pub fn from_class_scores(tokens: Vec<String>, scores: &[Vec<f32>]) -> Self {
        let tokens = tokens
            .into_iter()
            .enumerate()
            .map(|(position, token)| TokenAttribution {
                token,
                scores: scores
                    .iter()
                    .map(|class| class.get(position).copied().unwrap_or(0.0))
                    .collect(),
            })
            .collect();
        AttributionRecord { tokens }
    }
}

/// Writes one JSON object per line, flushed after every record so partial
/// runs leave complete lines behind.
pub struct AttributionWriter {
    writer: BufWriter<File>,
    written: usize,
}

impl AttributionWriter {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(AttributionWriter {
            writer: BufWriter::new(File::create(path)?),
            written: 0,
        })
    }

    pub fn write_record(&mut self, record: &AttributionRecord) -> Result<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        self.written += 1;
        Ok(())
    }

    /// Records written so far.
    pub fn written(&self) -> usize {
        self.written
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_first_then_classes() {
        let attribution = TokenAttribution {
            token: "cat".into(),
            scores: vec![0.5, -1.0, 2.0],
        };

        let json = serde_json::to_string(&attribution).unwrap();

        assert_eq!(json, r#"{"token":"cat","0":0.5,"1":-1.0,"2":2.0}"#);
    }

    #[test]
    fn test_record_from_class_scores() {
        let record = AttributionRecord::from_class_scores(
            vec!["[CLS]".into(), "dog".into()],
            &[vec![0.1, 0.2, 0.0], vec![1.0, 2.0, 0.0]],
        );

        assert_eq!(record.tokens.len(), 2);
        assert_eq!(record.tokens[1].token, "dog");
        assert_eq!(record.tokens[1].scores, vec![0.2, 2.0]);
    }

    #[test]
    fn test_writer_emits_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out");
        let mut writer = AttributionWriter::create(&path).unwrap();
        let record = AttributionRecord::from_class_scores(vec!["a".into()], &[vec![1.0]]);

        writer.write_record(&record).unwrap();
        // flushed without dropping the writer
        let partial = std::fs::read_to_string(&path).unwrap();
        writer.write_record(&record).unwrap();

        assert_eq!(partial, "{\"tokens\":[{\"token\":\"a\",\"0\":1.0}]}\n");
        assert_eq!(writer.written(), 2);
        let content = std::fs::read_to_string(&path).unwrap();
        for line in content.lines() {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(value["tokens"].is_array());
        }
        assert_eq!(content.lines().count(), 2);
    }
}
