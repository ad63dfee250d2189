//! On-disk block layout, format v1.
//!
//! `data_dir/<block_id>/` holds two files:
//!
//! - `meta.json`: the [`BlockMeta`] record.
//! - `samples.bin`: little-endian `(i64 timestamp_ms, f64 value)` pairs,
//!   raw-Snappy compressed when the block was written with compression.
//!
//! Blocks are written into a `.tmp` sibling directory and renamed into
//! place, so a crashed flush never leaves a half-written block where
//! recovery would find it.

use std::{
    fs,
    io::Cursor,
    path::{
        Path,
        PathBuf,
    },
};

use anyhow::Context;
use byteorder::{
    LittleEndian,
    ReadBytesExt,
    WriteBytesExt,
};
use common::{
    Fingerprint,
    Labels,
    Sample,
};
use errors::ErrorMetadata;
use serde::{
    Deserialize,
    Serialize,
};

use crate::block::{
    BlockId,
    SealedBlock,
};

const FORMAT_VERSION: u32 = 1;
const META_FILE: &str = "meta.json";
const SAMPLES_FILE: &str = "samples.bin";

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct BlockMeta {
    pub format_version: u32,
    pub block_id: BlockId,
    pub fingerprint: Fingerprint,
    pub labels: Labels,
    pub t_start: i64,
    pub t_end: i64,
    pub record_count: usize,
    pub min_ts: i64,
    pub max_ts: i64,
    pub compressed: bool,
}

pub(crate) struct DiskLayout {
    data_dir: PathBuf,
    compress: bool,
}

fn corrupt(block_id: BlockId, detail: impl std::fmt::Display) -> anyhow::Error {
    ErrorMetadata::internal(
        "CorruptBlock",
        format!("block {block_id} is unreadable: {detail}"),
    )
    .into()
}

impl DiskLayout {
    pub fn new(data_dir: impl Into<PathBuf>, compress: bool) -> Self {
        Self {
            data_dir: data_dir.into(),
            compress,
        }
    }

    pub fn block_dir(&self, id: BlockId) -> PathBuf {
        self.data_dir.join(id.to_string())
    }

    fn encode_samples(&self, samples: &[Sample]) -> anyhow::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(samples.len() * 16);
        for sample in samples {
            buf.write_i64::<LittleEndian>(sample.timestamp_ms)?;
            buf.write_f64::<LittleEndian>(sample.value)?;
        }
        if self.compress {
            let compressed = snap::raw::Encoder::new()
                .compress_vec(&buf)
                .context("snappy-compressing sample stream")?;
            return Ok(compressed);
        }
        Ok(buf)
    }

    fn decode_samples(
        block_id: BlockId,
        raw: &[u8],
        record_count: usize,
        compressed: bool,
    ) -> anyhow::Result<Vec<Sample>> {
        let plain = if compressed {
            snap::raw::Decoder::new()
                .decompress_vec(raw)
                .map_err(|e| corrupt(block_id, format_args!("snappy: {e}")))?
        } else {
            raw.to_vec()
        };
        if plain.len() != record_count * 16 {
            return Err(corrupt(
                block_id,
                format_args!(
                    "sample stream is {} bytes, expected {}",
                    plain.len(),
                    record_count * 16
                ),
            ));
        }
        let mut cursor = Cursor::new(plain);
        let mut samples = Vec::with_capacity(record_count);
        let mut last_ts = None;
        for _ in 0..record_count {
            let timestamp_ms = cursor.read_i64::<LittleEndian>()?;
            let value = cursor.read_f64::<LittleEndian>()?;
            if let Some(last) = last_ts {
                if timestamp_ms <= last {
                    return Err(corrupt(
                        block_id,
                        format_args!("sample stream is unordered at timestamp {timestamp_ms}"),
                    ));
                }
            }
            last_ts = Some(timestamp_ms);
            samples.push(Sample::new(timestamp_ms, value));
        }
        Ok(samples)
    }

    /// Persist a sealed block. The directory appears atomically via
    /// rename, either fully written or not at all.
    pub fn write_block(&self, block: &SealedBlock, samples: &[Sample]) -> anyhow::Result<()> {
        let final_dir = self.block_dir(block.id);
        if final_dir.exists() {
            // Flush retry after a partially-acknowledged attempt.
            return Ok(());
        }
        let tmp_dir = self.data_dir.join(format!("{}.tmp", block.id));
        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir).context("clearing stale tmp block dir")?;
        }
        fs::create_dir_all(&tmp_dir).context("creating block dir")?;
        let meta = BlockMeta {
            format_version: FORMAT_VERSION,
            block_id: block.id,
            fingerprint: block.fingerprint,
            labels: block.labels.clone(),
            t_start: block.t_start,
            t_end: block.t_end,
            record_count: block.record_count,
            min_ts: block.min_ts,
            max_ts: block.max_ts,
            compressed: self.compress,
        };
        fs::write(tmp_dir.join(META_FILE), serde_json::to_vec_pretty(&meta)?)
            .context("writing block meta")?;
        fs::write(tmp_dir.join(SAMPLES_FILE), self.encode_samples(samples)?)
            .context("writing block samples")?;
        fs::rename(&tmp_dir, &final_dir).context("publishing block dir")?;
        Ok(())
    }

    /// Load the sample stream of a previously flushed block, verifying
    /// count and ordering. Corruption surfaces as `internal` and poisons
    /// only this block's series.
    pub fn read_samples(&self, id: BlockId) -> anyhow::Result<Vec<Sample>> {
        let dir = self.block_dir(id);
        let meta = Self::read_meta(&dir)
            .map_err(|e| corrupt(id, format_args!("bad meta record: {e:#}")))?;
        let raw = fs::read(dir.join(SAMPLES_FILE))
            .map_err(|e| corrupt(id, format_args!("missing sample stream: {e}")))?;
        Self::decode_samples(id, &raw, meta.record_count, meta.compressed)
    }

    pub fn remove_block(&self, id: BlockId) -> anyhow::Result<()> {
        let dir = self.block_dir(id);
        if dir.exists() {
            fs::remove_dir_all(&dir).with_context(|| format!("removing block {id}"))?;
        }
        Ok(())
    }

    fn read_meta(dir: &Path) -> anyhow::Result<BlockMeta> {
        let raw = fs::read(dir.join(META_FILE)).context("reading block meta")?;
        let meta: BlockMeta = serde_json::from_slice(&raw).context("parsing block meta")?;
        if meta.format_version != FORMAT_VERSION {
            anyhow::bail!(
                "unsupported block format version {} (expected {FORMAT_VERSION})",
                meta.format_version
            );
        }
        Ok(meta)
    }

    /// Scan `data_dir` and re-register every well-formed block. Malformed
    /// directories are skipped with a warning; stale tmp directories from
    /// interrupted flushes are cleared.
    pub fn recover(&self) -> anyhow::Result<Vec<BlockMeta>> {
        fs::create_dir_all(&self.data_dir).context("creating data_dir")?;
        let mut recovered = Vec::new();
        for entry in fs::read_dir(&self.data_dir).context("scanning data_dir")? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(".tmp") {
                tracing::warn!("removing interrupted flush at {}", path.display());
                fs::remove_dir_all(&path).ok();
                continue;
            }
            match Self::read_meta(&path) {
                Ok(meta) => recovered.push(meta),
                Err(e) => {
                    tracing::warn!("skipping malformed block dir {}: {e:#}", path.display());
                },
            }
        }
        recovered.sort_by_key(|meta| meta.block_id);
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use common::{
        Labels,
        Sample,
    };
    use errors::ErrorMetadataAnyhowExt;

    use super::DiskLayout;
    use crate::block::{
        BlockId,
        SealedBlock,
    };

    fn sealed(id: u64, samples: Vec<Sample>) -> SealedBlock {
        let labels = Labels::from_pairs([("__name__", "cpu"), ("host", "h1")]).unwrap();
        SealedBlock::new(BlockId(id), labels.fingerprint(), labels, 0, 10_000, samples)
    }

    #[test]
    fn test_write_read_round_trip() {
        for compress in [false, true] {
            let dir = tempfile::tempdir().unwrap();
            let layout = DiskLayout::new(dir.path(), compress);
            let samples = vec![Sample::new(1, 0.5), Sample::new(2, f64::NAN), Sample::new(9, -1.0)];
            let block = sealed(7, samples.clone());
            layout.write_block(&block, &samples).unwrap();

            let read = layout.read_samples(BlockId(7)).unwrap();
            assert_eq!(read.len(), 3);
            assert_eq!(read[0], samples[0]);
            assert!(read[1].value.is_nan());
            assert_eq!(read[2], samples[2]);
        }
    }

    #[test]
    fn test_recover_skips_malformed_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DiskLayout::new(dir.path(), true);
        let samples = vec![Sample::new(5, 1.0)];
        let block = sealed(3, samples.clone());
        layout.write_block(&block, &samples).unwrap();

        fs::create_dir(dir.path().join("not-a-block")).unwrap();
        fs::write(dir.path().join("not-a-block/meta.json"), b"{").unwrap();
        fs::create_dir(dir.path().join("00000000000000000009.tmp")).unwrap();

        let recovered = layout.recover().unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].block_id, BlockId(3));
        assert_eq!(recovered[0].record_count, 1);
        // The interrupted flush was cleared.
        assert!(!dir.path().join("00000000000000000009.tmp").exists());
    }

    #[test]
    fn test_truncated_samples_surface_as_internal() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DiskLayout::new(dir.path(), false);
        let samples = vec![Sample::new(1, 1.0), Sample::new(2, 2.0)];
        let block = sealed(4, samples.clone());
        layout.write_block(&block, &samples).unwrap();

        let samples_path = layout.block_dir(BlockId(4)).join("samples.bin");
        fs::write(&samples_path, b"too short").unwrap();
        let err = layout.read_samples(BlockId(4)).unwrap_err();
        assert_eq!(err.short_msg(), "CorruptBlock");
        assert_eq!(err.error_type(), "internal");
    }

    #[test]
    fn test_rewrite_of_existing_block_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DiskLayout::new(dir.path(), false);
        let samples = vec![Sample::new(1, 1.0)];
        let block = sealed(5, samples.clone());
        layout.write_block(&block, &samples).unwrap();
        // A retried flush after the rename landed must not clobber.
        layout.write_block(&block, &samples).unwrap();
        assert_eq!(layout.read_samples(BlockId(5)).unwrap().len(), 1);
    }
}
