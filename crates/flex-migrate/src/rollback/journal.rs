//! Append-only JSON-lines journal of recorded operations.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::Operation;
use crate::error::Result;

pub struct Journal {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl Journal {
    /// Journal file for `run_id` under `directory`.
    pub fn path_for(directory: &Path, run_id: &str) -> PathBuf {
        directory.join(format!("{}.jsonl", run_id))
    }

    /// Open for appending, returning the operations already recorded.
    ///
    /// A torn final line (crash mid-write) is dropped with a warning.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<Operation>)> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut existing = Vec::new();
        let mut torn = false;
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            torn = !content.is_empty() && !content.ends_with('\n');
            for (n, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Operation>(line) {
                    Ok(op) => existing.push(op),
                    Err(e) => warn!("Ignoring journal line {} in {}: {}", n + 1, path.display(), e),
                }
            }
            info!(
                "Loaded {} operation(s) from journal {}",
                existing.len(),
                path.display()
            );
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = BufWriter::new(file);
        if torn {
            // Terminate the torn line so the next append starts cleanly.
            writer.write_all(b"\n")?;
            writer.flush()?;
        }
        Ok((Self { path, writer }, existing))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one operation and flush it.
    pub fn append(&mut self, operation: &Operation) -> Result<()> {
        serde_json::to_writer(&mut self.writer, operation)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write as _;
    use tempfile::TempDir;

    #[test]
    fn test_reopen_restores_operations() {
        let dir = TempDir::new().unwrap();
        let path = Journal::path_for(dir.path(), "run-1");
        {
            let (mut journal, existing) = Journal::open(&path).unwrap();
            assert!(existing.is_empty());
            journal.append(&Operation::insert("t", "1", json!({}))).unwrap();
            journal.append(&Operation::insert("t", "2", json!({}))).unwrap();
        }
        let (_, existing) = Journal::open(&path).unwrap();
        assert_eq!(existing.len(), 2);
        assert_eq!(existing[1].key, "2");
    }

    #[test]
    fn test_torn_line_is_skipped() {
        let dir = TempDir::new().unwrap();
        let path = Journal::path_for(dir.path(), "run-1");
        {
            let (mut journal, _) = Journal::open(&path).unwrap();
            journal.append(&Operation::insert("t", "1", json!({}))).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, "{{\"id\": \"trunc").unwrap();

        {
            let (mut journal, existing) = Journal::open(&path).unwrap();
            assert_eq!(existing.len(), 1);
            journal.append(&Operation::insert("t", "2", json!({}))).unwrap();
        }
        let (_, existing) = Journal::open(&path).unwrap();
        assert_eq!(existing.len(), 2);
        assert_eq!(existing[1].key, "2");
    }
}
