use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use arrow_array::{RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use sdw_core::RejectedBatch;
use sha2::{Digest, Sha256};
use tracing::{debug, info, info_span};
use uuid::Uuid;

use crate::RejectSink;

#[derive(Debug, Clone)]
pub struct StoredReject {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub rows: usize,
    pub deduplicated: bool,
}

/// Quarantine files on local disk, one Parquet file per rejected batch.
#[derive(Debug, Clone)]
pub struct ParquetRejectStore {
    root: PathBuf,
}

impl ParquetRejectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Hash over stage, reason and row payloads, so re-quarantining the same rows is a no-op.
    pub fn content_hash(batch: &RejectedBatch) -> anyhow::Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(batch.stage.as_str());
        hasher.update([0]);
        hasher.update(batch.reason.as_str());
        for row in &batch.rows {
            hasher.update([0]);
            hasher.update(serde_json::to_vec(row).context("serializing rejected row")?);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    fn hash_prefix(content_hash: &str) -> &str {
        content_hash.get(..16).unwrap_or(content_hash)
    }

    pub fn reject_relative_path(
        &self,
        rejected_at: DateTime<Utc>,
        batch: &RejectedBatch,
        content_hash: &str,
    ) -> PathBuf {
        let stamp = rejected_at.format("%Y%m%d_%H%M%S").to_string();
        let prefix = Self::hash_prefix(content_hash);
        PathBuf::from(batch.reason.as_str().to_ascii_lowercase())
            .join(format!("{stamp}_{prefix}.parquet"))
    }

    /// An earlier quarantine file with the same content, whatever its stamp.
    fn find_existing(
        &self,
        reason_dir: &Path,
        content_hash: &str,
    ) -> anyhow::Result<Option<PathBuf>> {
        let suffix = format!("_{}.parquet", Self::hash_prefix(content_hash));
        let entries = match fs::read_dir(self.root.join(reason_dir)) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("listing reject directory {}", reason_dir.display()))
            }
        };
        for entry in entries {
            let entry = entry.context("reading reject directory entry")?;
            if entry.file_name().to_string_lossy().ends_with(&suffix) {
                return Ok(Some(reason_dir.join(entry.file_name())));
            }
        }
        Ok(None)
    }

    /// Writes the batch through a temp file and an atomic rename. A batch whose content was
    /// already quarantined, at any earlier time, is not written again.
    pub fn store_batch(
        &self,
        batch: &RejectedBatch,
        rejected_at: DateTime<Utc>,
    ) -> anyhow::Result<StoredReject> {
        let _span =
            info_span!("store_rejects", reason = %batch.reason, rows = batch.len()).entered();
        let content_hash = Self::content_hash(batch)?;
        let fresh_path = self.reject_relative_path(rejected_at, batch, &content_hash);
        let reason_dir = fresh_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| anyhow!("reject path {} has no parent", fresh_path.display()))?;
        let stored = |relative_path: PathBuf, deduplicated| StoredReject {
            content_hash: content_hash.clone(),
            absolute_path: self.root.join(&relative_path),
            relative_path,
            rows: batch.len(),
            deduplicated,
        };

        if let Some(existing) = self.find_existing(&reason_dir, &content_hash)? {
            debug!(path = %existing.display(), "identical rejects already quarantined");
            return Ok(stored(existing, true));
        }

        let parent = self.root.join(&reason_dir);
        fs::create_dir_all(&parent)
            .with_context(|| format!("creating reject directory {}", parent.display()))?;
        let absolute_path = self.root.join(&fresh_path);

        let bytes = encode_parquet(batch, rejected_at)?;
        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        fs::write(&temp_path, &bytes)
            .with_context(|| format!("writing temp reject file {}", temp_path.display()))?;

        match fs::rename(&temp_path, &absolute_path) {
            Ok(()) => {
                info!(path = %fresh_path.display(), "rejected rows quarantined");
                Ok(stored(fresh_path, false))
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path);
                Ok(stored(fresh_path, true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path);
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp reject file {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

impl RejectSink for ParquetRejectStore {
    fn persist(&self, batch: &RejectedBatch) -> anyhow::Result<()> {
        self.store_batch(batch, Utc::now()).map(|_| ())
    }
}

fn encode_parquet(batch: &RejectedBatch, rejected_at: DateTime<Utc>) -> anyhow::Result<Vec<u8>> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("stage", DataType::Utf8, false),
        ArrowField::new("reject_reason", DataType::Utf8, false),
        ArrowField::new("entity", DataType::Utf8, false),
        ArrowField::new("record_key", DataType::Utf8, false),
        ArrowField::new("record_json", DataType::Utf8, false),
        ArrowField::new("rejected_at", DataType::Utf8, false),
    ]));

    let n = batch.len();
    let record_json = batch
        .rows
        .iter()
        .map(serde_json::to_string)
        .collect::<Result<Vec<_>, _>>()
        .context("serializing rejected rows")?;
    let stamp = rejected_at.to_rfc3339();

    let record_batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(StringArray::from(vec![batch.stage.as_str(); n])),
            Arc::new(StringArray::from(vec![batch.reason.as_str(); n])),
            Arc::new(StringArray::from_iter_values(batch.rows.iter().map(|r| r.entity()))),
            Arc::new(StringArray::from_iter_values(batch.rows.iter().map(|r| r.key()))),
            Arc::new(StringArray::from(record_json)),
            Arc::new(StringArray::from(vec![stamp.as_str(); n])),
        ],
    )
    .context("building rejected record batch")?;

    let mut bytes = Vec::new();
    let mut writer =
        ArrowWriter::try_new(&mut bytes, schema, None).context("opening parquet writer")?;
    writer
        .write(&record_batch)
        .context("writing rejected record batch")?;
    writer.close().context("closing parquet writer")?;
    Ok(bytes)
}
