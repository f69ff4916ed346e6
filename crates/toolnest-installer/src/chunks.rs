use std::path::{Path, PathBuf};

/// One contiguous byte range of a download. `end` is inclusive, matching the
/// HTTP `Range` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub index: usize,
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    pub fn byte_count(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// Splits `[0, total_size)` into at most `segments` ranges of at least
/// `min_segment_bytes` each. The last range absorbs the remainder. Payloads
/// smaller than one segment get exactly one range.
pub fn plan_chunks(total_size: u64, segments: usize, min_segment_bytes: u64) -> Vec<ChunkRange> {
    if total_size == 0 {
        return Vec::new();
    }

    let min_segment_bytes = min_segment_bytes.max(1);
    let by_size = (total_size / min_segment_bytes).max(1);
    let count = (segments.max(1) as u64).min(by_size);
    let chunk_size = total_size / count;

    (0..count)
        .map(|index| {
            let start = index * chunk_size;
            let end = if index + 1 == count {
                total_size - 1
            } else {
                start + chunk_size - 1
            };
            ChunkRange {
                index: index as usize,
                start,
                end,
            }
        })
        .collect()
}

/// Temp directory holding the chunk files for `destination`.
pub fn chunk_dir_for(destination: &Path) -> PathBuf {
    let stem = destination
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    destination
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(format!("temp_{stem}"))
}

pub fn chunk_file_name(index: usize) -> String {
    format!("part{index}")
}
