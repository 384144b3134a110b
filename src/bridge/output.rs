use chrono::NaiveDateTime;
use log::{debug, warn};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::TransferError;

const FILE_PREFIX: &str = "sensor_data_";
const FILE_EXTENSION: &str = "txt";
const TIMESTAMP_FORMAT: &str = "%Y.%m.%d_%H.%M";

/// Source of the local wall-clock time used to name received recordings
pub type Clock = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(|| chrono::Local::now().naive_local())
}

/// `sensor_data_<yyyy.MM.dd_HH.mm>.txt`. Two recordings in the same minute
/// share a name; the later one overwrites.
pub fn output_file_name(at: NaiveDateTime) -> String {
    format!("{}{}.{}", FILE_PREFIX, at.format(TIMESTAMP_FORMAT), FILE_EXTENSION)
}

/// A received recording while it is being written.
#[derive(Debug)]
pub struct OutputFile {
    path: PathBuf,
    file: File,
}

/// What was left on disk once a transfer finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedRecording {
    pub path: PathBuf,
    pub bytes: u64,
    pub sha256: String,
}

impl OutputFile {
    /// Creates (or truncates) the file for a recording started at `at`.
    pub fn create(dir: &Path, at: NaiveDateTime) -> Result<Self, TransferError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(output_file_name(at));
        let file = File::create(&path)?;
        debug!("Created output file {}", path.display());
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A second handle onto the same file for the transport to write through.
    pub fn writer(&self) -> Result<File, TransferError> {
        Ok(self.file.try_clone()?)
    }

    /// Syncs and closes the file.
    pub fn finalize(self) -> Result<SavedRecording, TransferError> {
        self.file.sync_all()?;
        let bytes = self.file.metadata()?.len();
        drop(self.file);

        let sha256 = file_digest(&self.path)?;
        Ok(SavedRecording {
            path: self.path,
            bytes,
            sha256,
        })
    }

    /// Removes a file that never received a stream.
    pub fn discard(self) {
        drop(self.file);
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to remove unused output file {}: {}", self.path.display(), e);
        }
    }
}

fn file_digest(path: &Path) -> Result<String, TransferError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}
