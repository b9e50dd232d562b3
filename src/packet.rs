//! The `Packet` record: the entire API surface a packetizer hands to the
//! cluster engine. Grounded on the teacher's `SampleInfo` (`types.rs`), but
//! reshaped around Matroska's timecode-based references instead of MP4's
//! offset/size sample tables.

/// Backward reference a packet carries to resolve its decode dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackRef {
    /// I frame: no backward reference.
    None,
    /// P or B frame: use the track's last emitted key-or-P timecode.
    Auto,
    /// P or B frame: explicit absolute decode-order timecode, in nanoseconds.
    Absolute(i64),
}

/// Forward reference a packet carries (only ever set on B frames).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardRef {
    None,
    Absolute(i64),
}

impl BackRef {
    pub fn is_none(&self) -> bool {
        matches!(self, BackRef::None)
    }
}

impl ForwardRef {
    pub fn is_none(&self) -> bool {
        matches!(self, ForwardRef::None)
    }
}

/// A back-pointer set once a packet has been rendered into a block group,
/// used to resolve later packets' `bref`/`fref`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderedGroup {
    pub cluster_position: u64,
    pub block_group_index: u32,
}

/// One elementary-stream frame, ready to be handed to the cluster engine.
///
/// `id` is assigned by the engine on `add_packet`, not by the caller -- the
/// invariant that it is strictly increasing across all tracks is the
/// engine's responsibility to uphold, not the packetizer's.
#[derive(Debug, Clone)]
pub struct Packet {
    pub id: u64,
    pub track_id: u64,
    pub payload: Vec<u8>,
    pub timecode_ns: i64,
    pub duration_ns: i64,
    pub bref: BackRef,
    pub fref: ForwardRef,
    pub ref_priority: u8,
    pub rendered_group: Option<RenderedGroup>,
    /// Set by the cluster engine's sweep once no buffered packet can still
    /// reference this one. Not meaningful outside `cluster`.
    pub(crate) superseded: bool,
}

impl Packet {
    pub fn new(track_id: u64, payload: Vec<u8>, timecode_ns: i64, duration_ns: i64) -> Self {
        Self {
            id: 0,
            track_id,
            payload,
            timecode_ns,
            duration_ns,
            bref: BackRef::None,
            fref: ForwardRef::None,
            ref_priority: 0,
            rendered_group: None,
            superseded: false,
        }
    }

    pub fn with_refs(mut self, bref: BackRef, fref: ForwardRef) -> Self {
        self.bref = bref;
        self.fref = fref;
        self
    }

    pub fn is_key_frame(&self) -> bool {
        self.bref.is_none()
    }

    /// Frees the payload once the containing cluster has rendered and no
    /// buffered packet still references it, per the memory discipline in §5.
    pub fn drop_payload(&mut self) {
        self.payload = Vec::new();
    }
}
