//! Process-wide muxer configuration, passed by reference instead of living
//! in globals the way `kax_segment`/`TIMECODE_SCALE`/`pass` did in the source.

/// Nanoseconds per on-disk timecode tick. 1_000_000 means one tick per
/// millisecond, the conventional Matroska default.
pub const DEFAULT_TIMECODE_SCALE_NS: u64 = 1_000_000;

/// Default upper bound on a cluster's content size in bytes, matching the
/// `1500000` constant hard-coded in the original `add_packet`/`render`.
pub const MAX_BYTES_PER_CLUSTER: u64 = 1_500_000;

/// Which pass of a two-pass split run the engine is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    /// Single-pass run: no splitting, or splitting disabled.
    Single,
    /// First pass: discover split points, write no output bytes.
    Plan,
    /// Second pass: write output, honoring the split points pass 1 found.
    Write,
}

/// Budget expressed for the split planner: either a duration or a byte count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitBudget {
    Time(u64),
    Bytes(u64),
    /// No splitting requested.
    Unbounded,
}

/// Configuration recognized by the cluster engine, packetizers, and readers.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Upper bound on (last_packet_timecode - cluster_base), in nanoseconds.
    pub max_ms_per_cluster: u64,
    /// Upper bound on blocks per cluster.
    pub max_blocks_per_cluster: usize,
    /// Split budget: time or bytes.
    pub split_after: SplitBudget,
    /// Hard cap on the number of output files a split run may produce.
    pub split_max_num_files: usize,
    /// On split, reset `timecode_offset`/`first_timecode` so the next file
    /// starts at t=0 instead of continuing the previous file's timeline.
    pub no_linking: bool,
    /// Whether to emit the cue index at all.
    pub write_cues: bool,
    /// Which pass of a two-pass split run this is.
    pub pass: Pass,
    /// Nanoseconds per on-disk timecode tick.
    pub timecode_scale_ns: u64,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_ms_per_cluster: 5_000_000_000,
            max_blocks_per_cluster: 64,
            split_after: SplitBudget::Unbounded,
            split_max_num_files: usize::MAX,
            no_linking: false,
            write_cues: true,
            pass: Pass::Single,
            timecode_scale_ns: DEFAULT_TIMECODE_SCALE_NS,
        }
    }
}

impl MuxConfig {
    /// Ticks of `timecode_scale_ns` represented by a nanosecond timecode,
    /// i.e. the value actually written to the block's on-disk timecode field.
    pub fn ticks(&self, ns: i64) -> i64 {
        ns / self.timecode_scale_ns as i64
    }
}
