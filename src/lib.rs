//! # mkve
//!
//! A Matroska/WebM cluster muxer and MPEG-1/2 video packetizer for pure
//! Rust: the cluster assembly/rendering engine, the MPEG video packetizers
//! that feed it, and the EBML primitives both sit on, grounded on the same
//! buffer/box/sample-table shapes `mp4e` uses for MP4, adapted to EBML's
//! typed, variable-length element model and Matroska's timecode-based
//! reference graph instead of MP4's fixed sample tables.
//!
//! The crate is a library: it exposes [`muxer::Muxer`] and
//! [`muxer::MultiFileMuxer`] as the entry points a host binary drives its
//! pull loop against (§5). CLI/option parsing, container-format probing
//! beyond the bundled MPEG elementary-stream reader, and I/O buffering are
//! left to that host.

pub mod cluster;
pub mod context;
pub mod cue;
pub mod ebml;
pub mod error;
pub mod matroska;
pub mod muxer;
pub mod packet;
pub mod packetizer;
pub mod reader;
pub mod sink;
pub mod split;
pub mod track;

pub use context::{MuxConfig, Pass, SplitBudget};
pub use error::{ConnectionResult, MuxError, ProbeError};
pub use muxer::{MultiFileMuxer, Muxer, SplitHost, WriteSeek};
pub use packet::{BackRef, ForwardRef, Packet};
pub use track::{CueCreation, TrackDescriptor, TrackKind, TrackRegistry};
