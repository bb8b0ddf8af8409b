use crate::config::ARTIFACT_VERSION;
use crate::models::Dataset;
use anyhow::{bail, Context, Result};
use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ArtifactMetadata {
    pub version: u32,
    pub run_id: String,
    pub dataset: Dataset,
    pub batch: u32,
    pub chunk: u32,
    pub records: usize,
}

#[derive(Deserialize)]
struct ArtifactDe<T> {
    metadata: ArtifactMetadata,
    records: Vec<T>,
}

/// Borrows the records so a flush never clones a chunk.
#[derive(Serialize)]
struct ArtifactSer<'a, T> {
    metadata: ArtifactMetadata,
    records: &'a [T],
}

/// Written after every chunk of a batch is on disk; its presence marks the
/// batch as parsed for the run.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct BatchManifest {
    pub version: u32,
    pub run_id: String,
    pub batch: u32,
    pub chunks: u32,
    pub products: u64,
    pub reviews: u64,
    pub category_paths: u64,
    pub customers: u64,
}

/// One intermediate artifact on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub dataset: Dataset,
    pub batch: u32,
    pub chunk: u32,
    pub path: PathBuf,
}

/// Intermediate artifacts of one run: `<dataset>_<batch>_<chunk>.bin` plus
/// `batch_<batch>.manifest`, all in one directory.
#[derive(Debug, Clone)]
pub struct RunStore {
    run_id: String,
    dir: PathBuf,
}

impl RunStore {
    pub fn new(dir: impl Into<PathBuf>, run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            dir: dir.into(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn artifact_path(&self, dataset: Dataset, batch: u32, chunk: u32) -> PathBuf {
        self.dir
            .join(format!("{}_{:05}_{:03}.bin", dataset.name(), batch, chunk))
    }

    pub fn manifest_path(&self, batch: u32) -> PathBuf {
        self.dir.join(format!("batch_{:05}.manifest", batch))
    }

    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create directory: {:?}", self.dir))
    }

    /// Serializes a chunk and writes it atomically via rename.
    pub fn write_chunk<T: Serialize>(
        &self,
        dataset: Dataset,
        batch: u32,
        chunk: u32,
        records: &[T],
    ) -> Result<PathBuf> {
        self.ensure_dir()?;
        let path = self.artifact_path(dataset, batch, chunk);
        let artifact = ArtifactSer {
            metadata: ArtifactMetadata {
                version: ARTIFACT_VERSION,
                run_id: self.run_id.clone(),
                dataset,
                batch,
                chunk,
                records: records.len(),
            },
            records,
        };
        write_atomic(&path, &artifact)?;
        debug!(dataset = %dataset, batch, chunk, records = records.len(), "Artifact written");
        Ok(path)
    }

    pub fn read_chunk<T: DeserializeOwned>(&self, artifact: &ArtifactRef) -> Result<Vec<T>> {
        let de: ArtifactDe<T> = read_limited(&artifact.path)?;

        if de.metadata.version != ARTIFACT_VERSION {
            bail!(
                "Artifact {:?} has version {}, expected {}",
                artifact.path,
                de.metadata.version,
                ARTIFACT_VERSION
            );
        }
        if de.metadata.run_id != self.run_id || de.metadata.dataset != artifact.dataset {
            bail!(
                "Artifact {:?} belongs to run {} / {}, expected {} / {}",
                artifact.path,
                de.metadata.run_id,
                de.metadata.dataset,
                self.run_id,
                artifact.dataset
            );
        }
        if de.metadata.records != de.records.len() {
            bail!(
                "Artifact {:?} is truncated: {} of {} records",
                artifact.path,
                de.records.len(),
                de.metadata.records
            );
        }
        Ok(de.records)
    }

    pub fn write_manifest(&self, manifest: &BatchManifest) -> Result<()> {
        self.ensure_dir()?;
        write_atomic(&self.manifest_path(manifest.batch), manifest)
    }

    /// `Ok(None)` when the batch has not completed for this run.
    pub fn load_manifest(&self, batch: u32) -> Result<Option<BatchManifest>> {
        let path = self.manifest_path(batch);
        if !path.exists() {
            return Ok(None);
        }
        let manifest: BatchManifest = read_limited(&path)?;
        if manifest.version != ARTIFACT_VERSION || manifest.run_id != self.run_id {
            info!(batch, "Ignoring manifest from another run or version");
            return Ok(None);
        }
        Ok(Some(manifest))
    }

    /// Manifests of every batch completed for this run, sorted by batch.
    pub fn manifests(&self) -> Result<Vec<BatchManifest>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut batches = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read directory: {:?}", self.dir))?
        {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("manifest") {
                continue;
            }
            let batch = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.strip_prefix("batch_"))
                .and_then(|s| s.parse::<u32>().ok());
            if let Some(batch) = batch {
                batches.push(batch);
            }
        }
        batches.sort_unstable();

        let mut manifests = Vec::with_capacity(batches.len());
        for batch in batches {
            if let Some(manifest) = self.load_manifest(batch)? {
                manifests.push(manifest);
            }
        }
        Ok(manifests)
    }

    /// Removes every artifact and the manifest of `batch`, so a re-parsed batch
    /// never leaves chunks from an earlier attempt behind.
    pub fn clear_batch(&self, batch: u32) -> Result<()> {
        let manifest = self.manifest_path(batch);
        if manifest.exists() {
            fs::remove_file(&manifest)
                .with_context(|| format!("Failed to remove manifest: {:?}", manifest))?;
        }
        for dataset in Dataset::ALL {
            for artifact in self.list(dataset)?.into_iter().filter(|a| a.batch == batch) {
                fs::remove_file(&artifact.path)
                    .with_context(|| format!("Failed to remove artifact: {:?}", artifact.path))?;
            }
        }
        Ok(())
    }

    /// Artifacts of `dataset`, sorted by (batch, chunk).
    pub fn list(&self, dataset: Dataset) -> Result<Vec<ArtifactRef>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut artifacts = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read directory: {:?}", self.dir))?
        {
            let path = entry?.path();
            if let Some(artifact) = parse_artifact_name(&path) {
                if artifact.dataset == dataset {
                    artifacts.push(artifact);
                }
            }
        }
        artifacts.sort_by_key(|a| (a.batch, a.chunk));
        Ok(artifacts)
    }
}

fn parse_artifact_name(path: &Path) -> Option<ArtifactRef> {
    if path.extension()?.to_str()? != "bin" {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let mut parts = stem.rsplitn(3, '_');
    let chunk = parts.next()?.parse().ok()?;
    let batch = parts.next()?.parse().ok()?;
    let dataset = Dataset::from_name(parts.next()?)?;
    Some(ArtifactRef {
        dataset,
        batch,
        chunk,
        path: path.to_path_buf(),
    })
}

fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    let file = File::create(&tmp_path)
        .with_context(|| format!("Failed to create temp file: {:?}", tmp_path))?;
    let mut writer = BufWriter::with_capacity(256 * 1024, file);

    bincode::DefaultOptions::new()
        .serialize_into(&mut writer, value)
        .with_context(|| format!("Failed to serialize: {:?}", path))?;
    writer
        .flush()
        .with_context(|| format!("Failed to flush: {:?}", tmp_path))?;

    fs::rename(&tmp_path, path)
        .with_context(|| format!("Failed to rename temp file to: {:?}", path))?;
    Ok(())
}

fn read_limited<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file_size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    let file = File::open(path).with_context(|| format!("Failed to open: {:?}", path))?;
    let reader = BufReader::with_capacity(256 * 1024, file);

    bincode::options()
        .with_limit(file_size.saturating_add(1024))
        .deserialize_from(reader)
        .with_context(|| format!("Failed to deserialize: {:?}", path))
}
