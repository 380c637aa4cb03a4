//! Storage accounting.

use std::collections::HashMap;

use serde::Serialize;

use crate::path;
use crate::vfs::{Inode, Namespace};

/// Storage usage of a subtree, computed on demand.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QuotaReport {
    /// Sum of file sizes.
    pub logical_size: u64,
    /// Bytes held by the distinct blocks the files reference.
    pub estimated_physical_size: u64,
    /// Block references, counting repeats.
    pub referenced_blocks: u64,
    /// Distinct blocks referenced.
    pub unique_blocks: u64,
    /// `estimated_physical_size / logical_size` (1.0 when empty).
    pub usage_ratio: f64,
    /// `referenced_blocks / unique_blocks` (1.0 when empty).
    pub dedup_ratio: f64,
}

/// Length of block `index` of a file split into `blocks` chunks.
///
/// Files written without a recorded chunk size are assumed to use equal
/// chunks with the remainder in the last one.
fn chunk_len(size: u64, blocks: usize, chunk_size: Option<u64>, index: usize) -> u64 {
    let cs = match chunk_size {
        Some(cs) if cs > 0 => cs,
        _ => size.div_ceil(blocks.max(1) as u64).max(1),
    };
    let start = cs.saturating_mul(index as u64);
    cs.min(size.saturating_sub(start))
}

impl Namespace {
    /// Usage of the files at or under `root`, or of every universe when
    /// `root` is `None`.
    pub fn quota(&self, root: Option<&str>) -> QuotaReport {
        let mut report = QuotaReport::default();
        let mut unique: HashMap<&str, u64> = HashMap::new();

        let in_scope = |p: &str| root.is_none_or(|r| path::is_within(p, r));
        for (p, inode) in self.iter().filter(|(p, _)| in_scope(p.as_str())) {
            let Inode::File {
                size,
                blocks,
                chunk_size,
                ..
            } = inode
            else {
                continue;
            };
            report.logical_size += size;
            report.referenced_blocks += blocks.len() as u64;
            for (i, digest) in blocks.iter().enumerate() {
                unique
                    .entry(digest.as_str())
                    .or_insert_with(|| chunk_len(*size, blocks.len(), *chunk_size, i));
            }
            tracing::trace!(path = %p, size, "quota counted file");
        }

        report.unique_blocks = unique.len() as u64;
        report.estimated_physical_size = unique.values().sum();
        report.usage_ratio = if report.logical_size == 0 {
            1.0
        } else {
            report.estimated_physical_size as f64 / report.logical_size as f64
        };
        report.dedup_ratio = if report.unique_blocks == 0 {
            1.0
        } else {
            report.referenced_blocks as f64 / report.unique_blocks as f64
        };
        report
    }
}
