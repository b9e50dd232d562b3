//! Error types for the cluster engine, packetizers, and readers.

use std::fmt;

/// Fatal and non-fatal conditions raised while muxing.
///
/// Mirrors the original's `die()`/`mxerror()` call sites, but as typed
/// variants instead of formatted strings thrown across a process boundary.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// A packet's `bref` or `fref` could not be resolved to a packet that
    /// was already buffered or rendered.
    #[error("unresolved reference: packet at {referencing_tc}ns wants {wanted_tc}ns\n{cluster_dump}")]
    UnresolvedReference {
        referencing_tc: u64,
        wanted_tc: u64,
        cluster_dump: String,
    },

    /// A P frame arrived in native MPEG-4 mode before any I frame had been seen.
    #[error("P frame before I frame in native MPEG-4 reordering")]
    PFrameBeforeIFrame,

    /// The byte sink failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The split host could not hand back a new output file.
    #[error("failed to open next split file: {0}")]
    SplitHost(String),

    /// A block's timecode offset from its cluster's base timecode no longer
    /// fits the signed 16-bit field Matroska blocks store it in.
    #[error("{0}")]
    ClusterSpanTooWide(String),
}

/// Failure returned by a reader's constructor when the input does not match
/// the format it probes for. Non-fatal: the driver tries the next reader.
#[derive(Debug, thiserror::Error)]
#[error("format probe failed: {0}")]
pub struct ProbeError(pub String);

impl ProbeError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Result of asking a packetizer whether it can take over for another one
/// across a concatenation boundary. Not an error: a 3-way report to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionResult {
    Yes,
    NoFormat,
    NoParameters,
}

impl fmt::Display for ConnectionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionResult::Yes => write!(f, "yes"),
            ConnectionResult::NoFormat => write!(f, "no_format"),
            ConnectionResult::NoParameters => write!(f, "no_parameters"),
        }
    }
}
