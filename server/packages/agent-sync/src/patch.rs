//! Offset + tail encoding of the change between two versions of streamed
//! content. Offsets are byte offsets and always land on a char boundary.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContentPatch {
    pub offset: usize,
    pub tail: String,
    pub total_length: usize,
}

impl ContentPatch {
    pub fn is_noop(&self, previous_len: usize) -> bool {
        self.tail.is_empty() && self.offset == previous_len && self.total_length == previous_len
    }
}

/// Computes the patch that turns `previous` into `next`.
///
/// The monotonic-append case only compares the shared prefix once. A rewrite
/// scans for the first differing byte and backs off to a char boundary so
/// the tail is always valid UTF-8.
pub fn compute_patch(previous: &str, next: &str) -> ContentPatch {
    let offset = if next.starts_with(previous) {
        previous.len()
    } else {
        let mut first_diff = previous
            .bytes()
            .zip(next.bytes())
            .position(|(a, b)| a != b)
            .unwrap_or_else(|| previous.len().min(next.len()));
        while !next.is_char_boundary(first_diff) {
            first_diff -= 1;
        }
        first_diff
    };

    ContentPatch {
        offset,
        tail: next[offset..].to_string(),
        total_length: next.len(),
    }
}

/// Applies a patch in place: truncate to `offset`, then append `tail`.
pub fn apply_patch(target: &mut String, patch: &ContentPatch) {
    let mut offset = patch.offset.min(target.len());
    while !target.is_char_boundary(offset) {
        offset -= 1;
    }
    target.truncate(offset);
    target.push_str(&patch.tail);
}
