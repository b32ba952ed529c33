use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde_json::json;

use crate::error::{Result, TrainError};

/// Destination for training metrics. Write failures are fatal to the run.
pub trait MetricSink {
    fn log_scalar(&mut self, key: &str, value: f64, step: usize) -> Result<()>;

    fn log_table(
        &mut self,
        key: &str,
        columns: &[&str],
        rows: &[Vec<String>],
        step: usize,
    ) -> Result<()>;

    fn flush(&mut self) -> Result<()>;
}

/// Appends one JSON object per event to a file, so a resumed run with the
/// same id continues the same file.
pub struct JsonlSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlSink {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| TrainError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| TrainError::io(&path, e))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    /// `{out_path}/metrics-{id}.jsonl`
    pub fn path_for(out_path: &Path, id: &str) -> PathBuf {
        out_path.join(format!("metrics-{id}.jsonl"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_line(&mut self, value: serde_json::Value) -> Result<()> {
        serde_json::to_writer(&mut self.writer, &value)?;
        self.writer
            .write_all(b"\n")
            .map_err(|e| TrainError::io(&self.path, e))
    }
}

impl MetricSink for JsonlSink {
    fn log_scalar(&mut self, key: &str, value: f64, step: usize) -> Result<()> {
        self.write_line(json!({ "step": step, "key": key, "value": value }))
    }

    fn log_table(
        &mut self,
        key: &str,
        columns: &[&str],
        rows: &[Vec<String>],
        step: usize,
    ) -> Result<()> {
        self.write_line(json!({
            "step": step,
            "key": key,
            "columns": columns,
            "rows": rows,
        }))
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush().map_err(|e| TrainError::io(&self.path, e))
    }
}

impl Drop for JsonlSink {
    fn drop(&mut self) {
        if let Err(err) = self.writer.flush() {
            log::warn!("failed to flush metrics to {:?}: {}", self.path, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_lines(path: &Path) -> Vec<serde_json::Value> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn writes_scalars_and_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = JsonlSink::path_for(dir.path(), "run1");
        {
            let mut sink = JsonlSink::create(&path).unwrap();
            sink.log_scalar("train/loss", 1.5, 0).unwrap();
            sink.log_table(
                "test/examples",
                &["Truth", "Prediction"],
                &[vec!["a".to_string(), "b".to_string()]],
                3,
            )
            .unwrap();
        }

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["key"], "train/loss");
        assert_eq!(lines[0]["value"], 1.5);
        assert_eq!(lines[1]["columns"][1], "Prediction");
        assert_eq!(lines[1]["rows"][0][0], "a");
        assert_eq!(lines[1]["step"], 3);
    }

    #[test]
    fn reopening_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("metrics-x.jsonl");
        for step in 0..2 {
            let mut sink = JsonlSink::create(&path).unwrap();
            sink.log_scalar("train/loss", 0.5, step).unwrap();
            sink.flush().unwrap();
        }
        assert_eq!(read_lines(&path).len(), 2);
    }
}
