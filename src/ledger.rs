use crate::config::LEDGER_SCAN_CHUNK;
use anyhow::{bail, Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// Append-only log of completed run ids, one per line, oldest first.
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `run_id` and syncs the file before returning.
    pub fn record(&self, run_id: &str) -> Result<()> {
        if run_id.is_empty() || run_id.contains(['\n', '\r']) {
            bail!("Invalid run id for ledger: {:?}", run_id);
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open ledger: {:?}", self.path))?;
        writeln!(file, "{}", run_id)
            .and_then(|_| file.sync_all())
            .with_context(|| format!("Failed to append to ledger: {:?}", self.path))?;

        info!(run = run_id, "Run recorded in ledger");
        Ok(())
    }

    /// Most recently recorded run id, `None` for a missing or empty ledger.
    ///
    /// Reads backwards from the end of the file, so the cost does not grow
    /// with the number of recorded runs.
    pub fn latest(&self) -> Result<Option<String>> {
        self.latest_with_chunk(LEDGER_SCAN_CHUNK)
    }

    fn latest_with_chunk(&self, chunk_size: usize) -> Result<Option<String>> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to open ledger: {:?}", self.path))
            }
        };
        let len = file
            .metadata()
            .with_context(|| format!("Failed to stat ledger: {:?}", self.path))?
            .len();

        let mut buf = vec![0u8; chunk_size.max(1)];
        let mut line: Vec<u8> = Vec::new();
        let mut pos = len;
        let mut in_line = false;

        while pos > 0 {
            let read = (buf.len() as u64).min(pos) as usize;
            pos -= read as u64;
            file.seek(SeekFrom::Start(pos))
                .and_then(|_| file.read_exact(&mut buf[..read]))
                .with_context(|| format!("Failed to read ledger: {:?}", self.path))?;

            let mut window = &buf[..read];
            if !in_line {
                // Skip the trailing newline(s) before the last entry
                match window.iter().rposition(|&b| b != b'\n' && b != b'\r') {
                    Some(last) => {
                        window = &window[..=last];
                        in_line = true;
                    }
                    None => continue,
                }
            }

            match memchr::memrchr(b'\n', window) {
                Some(newline) => {
                    line.splice(0..0, window[newline + 1..].iter().copied());
                    break;
                }
                None => {
                    line.splice(0..0, window.iter().copied());
                }
            }
        }

        if line.is_empty() {
            return Ok(None);
        }
        let entry = String::from_utf8(line)
            .with_context(|| format!("Ledger entry is not UTF-8: {:?}", self.path))?;
        Ok(Some(entry.trim().to_string()))
    }

    /// Every recorded run id, oldest first.
    pub fn entries(&self) -> Result<Vec<String>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read ledger: {:?}", self.path))?;
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}
