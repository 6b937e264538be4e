//! Test helpers for the FUSE layer.

use super::handles::{DirSink, EntryAttr};
use std::ffi::{OsStr, OsString};

/// Directory sink that accepts a limited number of entries.
pub(crate) struct VecSink {
    capacity: usize,
    pub(crate) entries: Vec<(OsString, EntryAttr, i64)>,
}

impl VecSink {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: vec![],
        }
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|(name, _, _)| name.to_string_lossy().to_string())
            .collect()
    }

    /// Offset to continue listing from, 0 if nothing was added.
    pub(crate) fn last_offset(&self) -> i64 {
        self.entries.last().map(|(_, _, off)| *off).unwrap_or(0)
    }

    pub(crate) fn attr(&self, name: &str) -> Option<EntryAttr> {
        self.entries
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, attr, _)| *attr)
    }
}

impl DirSink for VecSink {
    fn push(&mut self, name: &OsStr, attr: EntryAttr, next_offset: i64) -> bool {
        if self.entries.len() >= self.capacity {
            return true;
        }
        self.entries.push((name.to_os_string(), attr, next_offset));

        false
    }
}
