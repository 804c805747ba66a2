use std::collections::HashSet;

use crate::types::{FileCandidate, UploadedVideo};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Partition {
    pub fresh: Vec<FileCandidate>,
    pub duplicates: Vec<FileCandidate>,
}

/// Splits candidates into new and already-known ones by exact path equality.
///
/// A path repeated inside the batch keeps its first occurrence.
pub fn partition(candidates: Vec<FileCandidate>, known: &[UploadedVideo]) -> Partition {
    let mut seen: HashSet<String> = known.iter().map(|v| v.local_path.clone()).collect();
    let mut out = Partition::default();

    for candidate in candidates {
        if seen.insert(candidate.path.clone()) {
            out.fresh.push(candidate);
        } else {
            out.duplicates.push(candidate);
        }
    }
    out
}
