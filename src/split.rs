use crate::config::{BATCH_EXTENSION, PROGRESS_INTERVAL};
use crate::content::{classify, Keyword, LineKind};
use crate::models::BatchFile;
use crate::stats::PipelineStats;
use anyhow::{bail, Context, Result};
use indicatif::ProgressBar;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct SplitSummary {
    pub batches: Vec<BatchFile>,
    pub records: u64,
    pub dropped: u64,
}

pub fn batch_path(out_dir: &Path, index: u32) -> PathBuf {
    out_dir.join(format!("{:05}.{}", index, BATCH_EXTENSION))
}

/// Batch files in `dir`, sorted by index. Other files are ignored.
pub fn list_batches(dir: &Path) -> Result<Vec<BatchFile>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut batches = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to read directory: {:?}", dir))? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(BATCH_EXTENSION) {
            continue;
        }
        let index = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u32>().ok());
        if let Some(index) = index {
            batches.push(BatchFile { index, path });
        }
    }
    batches.sort_by_key(|b| b.index);
    Ok(batches)
}

struct Splitter<'a> {
    out_dir: &'a Path,
    batch_size: usize,
    stats: &'a PipelineStats,
    record: String,
    in_record: bool,
    discontinued: bool,
    buffer: String,
    buffered: usize,
    summary: SplitSummary,
    progress: ProgressBar,
}

impl<'a> Splitter<'a> {
    fn new(
        out_dir: &'a Path,
        batch_size: usize,
        stats: &'a PipelineStats,
        progress: ProgressBar,
    ) -> Self {
        Self {
            out_dir,
            batch_size,
            stats,
            record: String::new(),
            in_record: false,
            discontinued: false,
            buffer: String::new(),
            buffered: 0,
            summary: SplitSummary::default(),
            progress,
        }
    }

    fn push_line(&mut self, line: &str) -> Result<()> {
        match classify(line) {
            LineKind::Comment => {}
            LineKind::Blank => self.close_record()?,
            LineKind::Header(_) => {
                self.close_record()?;
                self.in_record = true;
                self.record.push_str(line);
                self.record.push('\n');
            }
            // Preamble before the first record
            _ if !self.in_record => {}
            kind => {
                if let LineKind::Scalar(Keyword::Discontinued, _) = kind {
                    self.discontinued = true;
                }
                self.record.push_str(line);
                self.record.push('\n');
            }
        }
        Ok(())
    }

    fn close_record(&mut self) -> Result<()> {
        if !self.in_record {
            return Ok(());
        }

        if self.discontinued {
            self.summary.dropped += 1;
            self.stats.inc_records_dropped();
        } else {
            self.buffer.push_str(&self.record);
            self.buffer.push('\n');
            self.buffered += 1;
            self.summary.records += 1;
            self.stats.inc_records_split();
        }

        self.record.clear();
        self.in_record = false;
        self.discontinued = false;

        let seen = self.summary.records + self.summary.dropped;
        if seen % PROGRESS_INTERVAL == 0 {
            self.progress.set_position(seen);
            self.progress.set_message(format!("{} records", seen));
        }

        if self.buffered >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.buffered == 0 {
            return Ok(());
        }

        let index = self.summary.batches.len() as u32;
        let path = batch_path(self.out_dir, index);
        let file = File::create(&path)
            .with_context(|| format!("Failed to create batch file: {:?}", path))?;
        let mut writer = BufWriter::with_capacity(256 * 1024, file);
        writer
            .write_all(self.buffer.as_bytes())
            .and_then(|_| writer.flush())
            .with_context(|| format!("Failed to write batch file: {:?}", path))?;

        debug!(batch = index, records = self.buffered, "Batch written");
        self.stats.inc_batches_written();
        self.summary.batches.push(BatchFile { index, path });
        self.buffer.clear();
        self.buffered = 0;
        Ok(())
    }
}

/// Streams `input` once and writes record-aligned batch files of `batch_size`
/// records into `out_dir`. Comments, the dump preamble and discontinued
/// records are dropped. Any I/O error aborts the split.
pub fn split_file(
    input: &Path,
    out_dir: &Path,
    batch_size: usize,
    stats: &PipelineStats,
) -> Result<SplitSummary> {
    if batch_size == 0 {
        bail!("Batch size must be at least 1");
    }

    fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create split directory: {:?}", out_dir))?;
    for stale in list_batches(out_dir)? {
        fs::remove_file(&stale.path)
            .with_context(|| format!("Failed to remove stale batch file: {:?}", stale.path))?;
    }

    let file = File::open(input).with_context(|| format!("Failed to open input: {:?}", input))?;
    let mut reader = BufReader::with_capacity(256 * 1024, file);

    info!("Splitting {:?} into batches of {} records", input, batch_size);
    let mut splitter = Splitter::new(out_dir, batch_size, stats, ProgressBar::new_spinner());

    let mut line = String::new();
    loop {
        line.clear();
        let read = reader
            .read_line(&mut line)
            .with_context(|| format!("Failed to read input: {:?}", input))?;
        if read == 0 {
            break;
        }
        splitter.push_line(line.trim_end_matches(['\n', '\r']))?;
    }

    splitter.close_record()?;
    splitter.flush()?;
    splitter.progress.finish_and_clear();

    let summary = splitter.summary;
    info!(
        batches = summary.batches.len(),
        records = summary.records,
        dropped = summary.dropped,
        "Split complete"
    );
    Ok(summary)
}
