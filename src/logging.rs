//! Metric logging backends.
//!
//! Diagnostic messages go through the `log` facade; per-epoch metric scalars
//! go through a [`MetricLogger`] so runs can be followed from the console or
//! replayed from a CSV, whichever the caller wires in.

use crate::{TrainError, TrainResult};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

/// Sink for per-epoch metric scalars.
pub trait MetricLogger {
    /// Record one scalar under a hierarchical name like `"train/mae"`.
    fn log_scalar(&mut self, name: &str, value: f64, step: usize) -> TrainResult<()>;

    /// Record a free-form message tied to a step.
    fn log_text(&mut self, message: &str, step: usize) -> TrainResult<()>;

    /// Flush buffered output. Called at the end of every run, including
    /// interrupted ones.
    fn flush(&mut self) -> TrainResult<()>;
}

/// Logs metrics through the `log` facade at info level.
#[derive(Debug, Default)]
pub struct ConsoleLogger;

impl MetricLogger for ConsoleLogger {
    fn log_scalar(&mut self, name: &str, value: f64, step: usize) -> TrainResult<()> {
        log::info!("epoch {:>4} | {} = {:.6}", step, name, value);
        Ok(())
    }

    fn log_text(&mut self, message: &str, step: usize) -> TrainResult<()> {
        log::info!("epoch {:>4} | {}", step, message);
        Ok(())
    }

    fn flush(&mut self) -> TrainResult<()> {
        Ok(())
    }
}

/// Appends metrics to a `step,metric,value` CSV file.
#[derive(Debug)]
pub struct CsvLogger {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl CsvLogger {
    /// Create (truncate) the CSV file and write the header.
    pub fn create(path: impl Into<PathBuf>) -> TrainResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TrainError::Other(format!("create log dir {}: {}", parent.display(), e))
            })?;
        }
        let file = File::create(&path)
            .map_err(|e| TrainError::Other(format!("create {}: {}", path.display(), e)))?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "step,metric,value")
            .map_err(|e| TrainError::Other(format!("write {}: {}", path.display(), e)))?;
        Ok(Self { path, writer })
    }

    /// Path of the CSV file.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl MetricLogger for CsvLogger {
    fn log_scalar(&mut self, name: &str, value: f64, step: usize) -> TrainResult<()> {
        writeln!(self.writer, "{},{},{}", step, name, value)
            .map_err(|e| TrainError::Other(format!("write {}: {}", self.path.display(), e)))
    }

    fn log_text(&mut self, _message: &str, _step: usize) -> TrainResult<()> {
        Ok(())
    }

    fn flush(&mut self) -> TrainResult<()> {
        self.writer
            .flush()
            .map_err(|e| TrainError::Other(format!("flush {}: {}", self.path.display(), e)))
    }
}

/// Fans a metric stream out to several backends.
#[derive(Default)]
pub struct MultiLogger {
    backends: Vec<Box<dyn MetricLogger>>,
}

impl MultiLogger {
    /// Create an empty multi-logger (a no-op sink until backends are added).
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a backend.
    pub fn with(mut self, backend: Box<dyn MetricLogger>) -> Self {
        self.backends.push(backend);
        self
    }
}

impl MetricLogger for MultiLogger {
    fn log_scalar(&mut self, name: &str, value: f64, step: usize) -> TrainResult<()> {
        for backend in &mut self.backends {
            backend.log_scalar(name, value, step)?;
        }
        Ok(())
    }

    fn log_text(&mut self, message: &str, step: usize) -> TrainResult<()> {
        for backend in &mut self.backends {
            backend.log_text(message, step)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> TrainResult<()> {
        for backend in &mut self.backends {
            backend.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[test]
    fn test_csv_logger_writes_rows() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let path = std::env::temp_dir().join(format!("matprop-log-{}.csv", nanos));

        let mut logger = CsvLogger::create(&path).unwrap();
        logger.log_scalar("train/loss", 0.5, 1).unwrap();
        logger.log_scalar("validation/mae", 0.25, 1).unwrap();
        logger.flush().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "step,metric,value");
        assert_eq!(lines[1], "1,train/loss,0.5");
        assert_eq!(lines[2], "1,validation/mae,0.25");

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_console_logger_is_infallible() {
        let mut logger = ConsoleLogger;
        logger.log_scalar("train/loss", 1.0, 0).unwrap();
        logger.log_text("hello", 0).unwrap();
        logger.flush().unwrap();
    }
}
