//! Cue index: one entry per key frame (by default), used to build the
//! `Cues` element and to let a player seek directly to a cluster.

use crate::ebml::{push_master_element, push_uint_element};
use crate::matroska::ids;

/// One `CuePoint`: the track, its presentation time, and the byte offset of
/// the cluster containing it (relative to the start of the `Segment` body,
/// per the Matroska `CueClusterPosition` semantics).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CueEntry {
    pub track_number: u64,
    pub timecode_ticks: u64,
    pub cluster_position: u64,
}

/// Accumulates cue entries as clusters are rendered and serializes them into
/// the `Cues` master once the segment is finalized.
#[derive(Debug, Default)]
pub struct CueIndex {
    entries: Vec<CueEntry>,
}

impl CueIndex {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn push(&mut self, entry: CueEntry) {
        self.entries.push(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CueEntry> {
        self.entries.iter()
    }

    /// Builds the full `Cues` element. Entries are expected to already be in
    /// ascending timecode order, since `add_packet` only ever appends.
    pub fn build(&self) -> Vec<u8> {
        let mut body = Vec::new();
        for entry in &self.entries {
            let mut point = Vec::new();
            push_uint_element(&mut point, ids::CUE_TIME, entry.timecode_ticks);

            let mut positions = Vec::new();
            push_uint_element(&mut positions, ids::CUE_TRACK, entry.track_number);
            push_uint_element(&mut positions, ids::CUE_CLUSTER_POSITION, entry.cluster_position);
            push_master_element(&mut point, ids::CUE_TRACK_POSITIONS, &positions);

            push_master_element(&mut body, ids::CUE_POINT, &point);
        }

        let mut out = Vec::new();
        push_master_element(&mut out, ids::CUES, &body);
        out
    }
}
