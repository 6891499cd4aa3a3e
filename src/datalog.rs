// Per-tick data logging
//
// One comma-separated row per control tick, preceded by a header row.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::info;

/// Column names of the rows written by the control loop
pub const LOG_COLUMNS: [&str; 15] = [
    "i", "t_now", "theta_x", "theta_y", "T1", "T2", "T3", "phi_x", "phi_y", "phi_z", "psi_1",
    "psi_2", "psi_3", "phi_x_dot", "phi_y_dot",
];

pub trait LogSink {
    fn append(&mut self, row: &[f64]) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
}

/// Buffered CSV writer
pub struct DataLogger<W: Write = File> {
    out: BufWriter<W>,
    rows: u64,
    path: Option<PathBuf>,
}

impl DataLogger<File> {
    /// Create (or truncate) the log file, creating parent directories as needed
    pub fn create(path: impl AsRef<Path>, columns: &[&str]) -> io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(path)?;
        let mut logger = Self::from_writer(file, columns)?;
        logger.path = Some(path.to_path_buf());
        info!("Logging data to {}", path.display());
        Ok(logger)
    }
}

impl<W: Write> DataLogger<W> {
    pub fn from_writer(writer: W, columns: &[&str]) -> io::Result<Self> {
        let mut out = BufWriter::new(writer);
        writeln!(out, "{}", columns.join(","))?;
        Ok(Self {
            out,
            rows: 0,
            path: None,
        })
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn into_inner(self) -> io::Result<W> {
        self.out.into_inner().map_err(|e| e.into_error())
    }
}

impl<W: Write> LogSink for DataLogger<W> {
    fn append(&mut self, row: &[f64]) -> io::Result<()> {
        for (i, value) in row.iter().enumerate() {
            if i > 0 {
                self.out.write_all(b",")?;
            }
            write!(self.out, "{}", value)?;
        }
        self.out.write_all(b"\n")?;
        self.rows += 1;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()?;
        if let Some(path) = &self.path {
            info!("Wrote {} rows to {}", self.rows, path.display());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_are_comma_separated() {
        let mut logger = DataLogger::from_writer(Vec::new(), &["a", "b", "c"]).unwrap();
        logger.append(&[1.0, 2.5, -0.125]).unwrap();
        logger.append(&[2.0, 0.0, 3.0]).unwrap();
        assert_eq!(logger.rows(), 2);

        let text = String::from_utf8(logger.into_inner().unwrap()).unwrap();
        assert_eq!(text, "a,b,c\n1,2.5,-0.125\n2,0,3\n");
    }

    #[test]
    fn test_file_logger_persists_on_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trials").join("ballbot_stability_test_1.csv");

        let mut logger = DataLogger::create(&path, &LOG_COLUMNS).unwrap();
        logger.append(&[0.0; 15]).unwrap();
        logger.flush().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), LOG_COLUMNS.join(","));
        assert_eq!(lines.next().unwrap().split(',').count(), 15);
        assert_eq!(lines.next(), None);
    }
}
