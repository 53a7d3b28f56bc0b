//! Persistence sink (spec §6): appends opaque per-camera records to
//! `<dir>/<cam_id>.bin`, bincode-encoded. Format is intentionally opaque —
//! no schema is promised across versions, matching spec §6's "internal
//! checkpoint, not a public archive format" framing.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{PipelineError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub frame_id: u64,
    pub meta: Vec<u8>,
}

pub struct PersistSink {
    dir: PathBuf,
}

impl PersistSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, cam_id: &str) -> PathBuf {
        self.dir.join(format!("{cam_id}.bin"))
    }

    /// Appends one record to `<cam_id>.bin`, creating the persistence
    /// directory and file on first write.
    pub fn append(&self, cam_id: &str, record: &PersistedRecord) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| PipelineError::data(format!("creating persist dir {}: {e}", self.dir.display())))?;
        let encoded = bincode::serialize(record)
            .map_err(|e| PipelineError::data(format!("bincode encode failed: {e}")))?;

        let path = self.path_for(cam_id);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| PipelineError::data(format!("opening {}: {e}", path.display())))?;

        // Length-prefix each record so the file is a simple concatenation of
        // independently-decodable frames, not one giant bincode blob.
        file.write_all(&(encoded.len() as u64).to_le_bytes())
            .and_then(|_| file.write_all(&encoded))
            .map_err(|e| PipelineError::data(format!("writing {}: {e}", path.display())))?;
        Ok(())
    }

    /// Reads every record previously appended for `cam_id`, in order.
    pub fn read_all(&self, cam_id: &str) -> Result<Vec<PersistedRecord>> {
        let path = self.path_for(cam_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        read_records(&path)
    }
}

fn read_records(path: &Path) -> Result<Vec<PersistedRecord>> {
    let bytes = std::fs::read(path).map_err(|e| PipelineError::data(format!("reading {}: {e}", path.display())))?;
    let mut out = Vec::new();
    let mut offset = 0usize;
    while offset + 8 <= bytes.len() {
        let len = u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap()) as usize;
        offset += 8;
        if offset + len > bytes.len() {
            return Err(PipelineError::data(format!("truncated record in {}", path.display())));
        }
        let record: PersistedRecord = bincode::deserialize(&bytes[offset..offset + len])
            .map_err(|e| PipelineError::data(format!("bincode decode failed: {e}")))?;
        out.push(record);
        offset += len;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appended_records_read_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let sink = PersistSink::new(dir.path());
        sink.append("camA", &PersistedRecord { frame_id: 1, meta: vec![1, 2, 3] }).unwrap();
        sink.append("camA", &PersistedRecord { frame_id: 2, meta: vec![4, 5] }).unwrap();

        let records = sink.read_all("camA").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].frame_id, 1);
        assert_eq!(records[1].frame_id, 2);
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let sink = PersistSink::new(dir.path());
        assert!(sink.read_all("nope").unwrap().is_empty());
    }

    #[test]
    fn separate_cameras_use_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let sink = PersistSink::new(dir.path());
        sink.append("camA", &PersistedRecord { frame_id: 1, meta: vec![] }).unwrap();
        sink.append("camB", &PersistedRecord { frame_id: 9, meta: vec![] }).unwrap();
        assert_eq!(sink.read_all("camA").unwrap().len(), 1);
        assert_eq!(sink.read_all("camB").unwrap().len(), 1);
    }
}
