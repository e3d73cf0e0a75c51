//! DID snapshot sidecar files
//!
//! One record per line, `{decimal_id},{base64 data}`. Blank lines are ignored.

use std::{fmt::Write as _, path::Path};

use base64::{engine::general_purpose::STANDARD, Engine as _};

#[derive(Debug, thiserror::Error)]
/// Error produced reading or writing a DID file
pub enum DidFileError {
    /// File could not be read or written
    #[error("DID file IO error")]
    Io(
        #[from]
        #[source]
        std::io::Error,
    ),
    /// A line could not be parsed
    #[error("DID file line {line}: {reason}")]
    Malformed {
        /// 1 based line number
        line: usize,
        /// What was wrong with it
        reason: String,
    },
}

/// Identification records captured from an ECU
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DidSnapshot {
    records: Vec<(u8, Vec<u8>)>,
}

impl DidSnapshot {
    /// Adds a record, replacing any earlier record with the same id
    pub fn insert(&mut self, id: u8, data: Vec<u8>) {
        match self.records.iter_mut().find(|(i, _)| *i == id) {
            Some(r) => r.1 = data,
            None => self.records.push((id, data)),
        }
    }

    /// Data of record `id`
    pub fn get(&self, id: u8) -> Option<&[u8]> {
        self.records
            .iter()
            .find(|(i, _)| *i == id)
            .map(|(_, d)| d.as_slice())
    }

    /// Records in insertion order
    pub fn records(&self) -> impl Iterator<Item = (&u8, &Vec<u8>)> {
        self.records.iter().map(|(i, d)| (i, d))
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if there are no records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Renders the snapshot in file format
    pub fn to_text(&self) -> String {
        let mut s = String::new();
        for (id, data) in &self.records {
            let _ = writeln!(s, "{id},{}", STANDARD.encode(data));
        }
        s
    }

    /// Parses the file format
    pub fn parse(text: &str) -> Result<Self, DidFileError> {
        let mut snapshot = Self::default();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let malformed = |reason: String| DidFileError::Malformed {
                line: idx + 1,
                reason,
            };
            let (id, data) = line
                .split_once(',')
                .ok_or_else(|| malformed("missing ','".into()))?;
            let id = id
                .trim()
                .parse::<u8>()
                .map_err(|e| malformed(format!("bad id '{id}': {e}")))?;
            let data = STANDARD
                .decode(data.trim())
                .map_err(|e| malformed(format!("bad data: {e}")))?;
            snapshot.insert(id, data);
        }
        Ok(snapshot)
    }

    /// Writes the snapshot to disk
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), DidFileError> {
        std::fs::write(path, self.to_text())?;
        Ok(())
    }

    /// Reads a snapshot from disk
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, DidFileError> {
        Self::parse(&std::fs::read_to_string(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_format() {
        let mut s = DidSnapshot::default();
        s.insert(144, b"YS3FB45S631000001".to_vec());
        s.insert(146, vec![0x00, 0xFF]);
        let text = s.to_text();
        assert_eq!(text, "144,WVMzRkI0NVM2MzEwMDAwMDE=\n146,AP8=\n");
        assert_eq!(DidSnapshot::parse(&format!("\n{text}\n")).unwrap(), s);
    }

    #[test]
    fn malformed_lines_are_rejected() {
        match DidSnapshot::parse("144,AP8=\n300,AP8=") {
            Err(DidFileError::Malformed { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected {other:?}"),
        }
        assert!(DidSnapshot::parse("144 AP8=").is_err());
        assert!(DidSnapshot::parse("144,***").is_err());
    }
}
