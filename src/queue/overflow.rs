//! Spill-over for clicks that do not fit the durable buffer
//!
//! Each spill is one gzip-compressed NDJSON blob of `QueuedClick` records.

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::RngExt;
use std::io::{BufRead, BufReader, Write};
use std::sync::Arc;
use tracing::warn;

use crate::models::QueuedClick;
use crate::storage::BlobStore;

pub const OVERFLOW_PREFIX: &str = "overflow-";

pub fn encode_ndjson_gz(clicks: &[QueuedClick]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    for click in clicks {
        serde_json::to_writer(&mut encoder, click)?;
        encoder.write_all(b"\n")?;
    }
    Ok(encoder.finish()?)
}

pub fn decode_ndjson_gz(bytes: &[u8]) -> Result<Vec<QueuedClick>> {
    let reader = BufReader::new(GzDecoder::new(bytes));
    let mut clicks = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.context("corrupt overflow blob")?;
        if line.trim().is_empty() {
            continue;
        }
        let click = serde_json::from_str(&line)
            .with_context(|| format!("invalid record on line {}", index + 1))?;
        clicks.push(click);
    }
    Ok(clicks)
}

#[derive(Clone)]
pub struct OverflowStorage {
    blobs: Arc<dyn BlobStore>,
}

impl OverflowStorage {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    /// Write one blob, returning its key; keys sort by spill time
    pub async fn spill(&self, clicks: &[QueuedClick]) -> Result<String> {
        let suffix: u32 = rand::rng().random();
        let key = format!(
            "{OVERFLOW_PREFIX}{:013}-{suffix:08x}.ndjson.gz",
            chrono::Utc::now().timestamp_millis()
        );
        self.blobs.put(&key, encode_ndjson_gz(clicks)?).await?;
        Ok(key)
    }

    pub async fn keys(&self) -> Result<Vec<String>> {
        self.blobs.list(OVERFLOW_PREFIX).await
    }

    /// Decoded blob; corrupt blobs are reported and kept for inspection
    pub async fn read(&self, key: &str) -> Result<Option<Vec<QueuedClick>>> {
        let Some(bytes) = self.blobs.get(key).await? else {
            return Ok(None);
        };
        match decode_ndjson_gz(&bytes) {
            Ok(clicks) => Ok(Some(clicks)),
            Err(e) => {
                warn!(key = %key, error = %e, "overflow blob could not be decoded");
                Ok(None)
            }
        }
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        self.blobs.delete(key).await
    }
}
