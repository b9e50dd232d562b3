//! Top-level muxing session: wires the `Track Registry`, `Cluster Engine`,
//! `Cue Index`, and `Split Planner` together into the `EBML` header + one or
//! more `Segment` files the driver in §5 actually writes.
//!
//! [`Muxer`] owns a single output file: it writes the `EBML`/`Segment`/
//! `Info`/`Tracks` headers up front, forwards packets to the
//! [`ClusterEngine`](crate::cluster::ClusterEngine), and patches the
//! segment size and duration once `finalize` is called -- the same
//! reserve-then-patch shape the teacher's `mp4_box!` macro uses for `mdat`,
//! just with EBML's variable-length size field instead of MP4's fixed
//! 32-bit one. [`MultiFileMuxer`] drives the two-pass split flow from
//! §4.1 on top of it: [`plan_split_points`] runs pass 1 against a
//! [`crate::sink::NullSink`], and `MultiFileMuxer` replays the same packets
//! for pass 2, rotating files through a [`SplitHost`] whenever a chosen
//! split point is reached.

use std::io::{Seek, SeekFrom, Write};

use crate::cluster::ClusterEngine;
use crate::context::{MuxConfig, Pass};
use crate::cue::CueIndex;
use crate::ebml::{self, push_float_element, push_string_element, push_uint_element};
use crate::error::MuxError;
use crate::matroska::{self, ids};
use crate::packet::Packet;
use crate::sink::NullSink;
use crate::split::{SplitPlanner, SplitPoint};
use crate::track::{TrackKind, TrackRegistry};

/// The append-mostly, occasionally-patched sink the muxer needs. Any
/// `Write + Seek` implementor -- a `File`, a `Cursor<Vec<u8>>` -- qualifies.
pub trait WriteSeek: Write + Seek {}
impl<T: Write + Seek> WriteSeek for T {}

/// Asked by a [`MultiFileMuxer`] to close the file it just finished and hand
/// back a sink for the next one: the Rust shape of the original's
/// `finish_file` / `create_next_output_file` pair from §4.1 pass 2.
pub trait SplitHost {
    fn finish_file(&mut self, sink: Box<dyn WriteSeek>) -> Result<(), MuxError>;
    fn create_next_output_file(&mut self, file_num: usize, is_last: bool) -> Result<Box<dyn WriteSeek>, MuxError>;
}

/// Which track's key frames govern split candidates: video if the registry
/// has one, any track otherwise (invariant 6).
fn governing_track(tracks: &TrackRegistry) -> Option<u64> {
    tracks.iter().find(|t| t.kind == TrackKind::Video).map(|t| t.track_number)
}

fn is_split_candidate(packet: &Packet, governing: Option<u64>) -> bool {
    packet.is_key_frame() && governing.map_or(true, |t| t == packet.track_id)
}

/// Drives one output file.
pub struct Muxer {
    cfg: MuxConfig,
    tracks: TrackRegistry,
    engine: ClusterEngine,
    cues: CueIndex,
    sink: Box<dyn WriteSeek>,
    segment_size_pos: u64,
    segment_body_start: u64,
    duration_field_pos: u64,
    max_timecode_ns: i64,
}

impl Muxer {
    /// Opens `sink`, writes the `EBML` header, a reserved `Segment` size,
    /// and the `Info`/`Tracks` masters for `tracks`. `timecode_offset_ns`
    /// presets the engine's time origin instead of deriving it from the
    /// first packet -- used by [`MultiFileMuxer`] to keep a linked split
    /// session's on-disk timecodes continuous across files.
    pub fn new(
        cfg: MuxConfig,
        tracks: TrackRegistry,
        mut sink: Box<dyn WriteSeek>,
        timecode_offset_ns: Option<i64>,
    ) -> Result<Self, MuxError> {
        sink.write_all(&matroska::build_ebml_header())?;

        ebml::write_id(&mut sink, ids::SEGMENT)?;
        let segment_size_pos = sink.stream_position()?;
        sink.write_all(&[0u8; ebml::SIZE_PLACEHOLDER_LEN as usize])?;
        let segment_body_start = sink.stream_position()?;

        let duration_field_pos = Self::write_info(&mut sink, &cfg)?;
        sink.write_all(&matroska::build_tracks(&tracks))?;

        let mut engine = ClusterEngine::new(cfg.clone());
        if let Some(offset) = timecode_offset_ns {
            engine.set_timecode_offset(offset);
        }

        Ok(Self {
            cfg,
            tracks,
            engine,
            cues: CueIndex::new(),
            sink,
            segment_size_pos,
            segment_body_start,
            duration_field_pos,
            max_timecode_ns: 0,
        })
    }

    /// Writes the `Info` master with a zeroed `Duration` float, returning
    /// the byte offset of that float's value. A float element's width never
    /// changes, so [`finalize`](Self::finalize) can later overwrite just
    /// those 8 bytes in place without re-patching `Info`'s own size.
    fn write_info(sink: &mut Box<dyn WriteSeek>, cfg: &MuxConfig) -> Result<u64, MuxError> {
        let mut timecode_scale = Vec::new();
        push_uint_element(&mut timecode_scale, ids::TIMECODE_SCALE, cfg.timecode_scale_ns);

        let mut body = timecode_scale.clone();
        push_float_element(&mut body, ids::DURATION, 0.0);
        push_string_element(&mut body, ids::MUXING_APP, "mkve");
        push_string_element(&mut body, ids::WRITING_APP, "mkve");

        ebml::write_id(sink, ids::INFO)?;
        ebml::write_size(sink, body.len() as u64)?;
        let info_body_start = sink.stream_position()?;
        sink.write_all(&body)?;

        // Duration sits right after TimecodeScale: id (2 bytes) + size (1
        // byte, since an 8-byte float body always encodes as 0x88) + value.
        Ok(info_body_start + timecode_scale.len() as u64 + 3)
    }

    pub fn tracks(&self) -> &TrackRegistry {
        &self.tracks
    }

    pub fn max_timecode_ns(&self) -> i64 {
        self.max_timecode_ns
    }

    /// Bytes written so far. Used by [`plan_split_points`] to size pass-1
    /// split candidates.
    pub fn stream_position(&mut self) -> Result<u64, MuxError> {
        Ok(self.sink.stream_position()?)
    }

    /// Buffers `packet` and drains every cluster the engine is now ready to
    /// render.
    pub fn add_packet(&mut self, packet: Packet) -> Result<(), MuxError> {
        let end = packet.timecode_ns + packet.duration_ns;
        if end > self.max_timecode_ns {
            self.max_timecode_ns = end;
        }
        self.engine.add_packet(packet)?;
        self.drain_renders()
    }

    fn drain_renders(&mut self) -> Result<(), MuxError> {
        while self.engine.should_render() {
            self.engine.render(&mut self.sink, &self.tracks, &mut self.cues, self.segment_body_start)?;
        }
        Ok(())
    }

    /// Flushes the last cluster, writes the cue index (unless `write_cues`
    /// is false, or this is a pass-1 planning run), and patches the segment
    /// size and duration. Returns the sink so [`MultiFileMuxer`] can hand it
    /// to its [`SplitHost`].
    pub fn finalize(mut self) -> Result<Box<dyn WriteSeek>, MuxError> {
        self.engine.finalize();
        self.drain_renders()?;

        if self.cfg.write_cues && self.cfg.pass != Pass::Plan && !self.cues.is_empty() {
            let cues_bytes = self.cues.build();
            self.sink.write_all(&cues_bytes)?;
        }

        let body_end = self.sink.stream_position()?;
        let body_len = body_end - self.segment_body_start;

        self.sink.seek(SeekFrom::Start(self.duration_field_pos))?;
        let duration_ticks = self.engine.max_timecode_ns() as f64 / self.cfg.timecode_scale_ns as f64;
        self.sink.write_all(&duration_ticks.to_be_bytes())?;

        self.sink.seek(SeekFrom::Start(self.segment_size_pos))?;
        self.sink.write_all(&ebml::encode_vint8(body_len))?;

        self.sink.seek(SeekFrom::End(0))?;
        Ok(self.sink)
    }
}

/// Runs pass 1: feeds `packets` through a scratch [`Muxer`] writing to a
/// [`NullSink`], recording one [`SplitPoint`] candidate at every key frame
/// on the governing track, per invariant 6. Produces no real output; only
/// the byte positions matter.
pub fn plan_split_points(cfg: &MuxConfig, tracks: &TrackRegistry, packets: &[Packet]) -> Result<Vec<SplitPoint>, MuxError> {
    let governing = governing_track(tracks);

    let mut plan_cfg = cfg.clone();
    plan_cfg.pass = Pass::Plan;

    let mut muxer = Muxer::new(plan_cfg, tracks.clone(), Box::new(NullSink::new()), None)?;
    let mut points = Vec::new();

    for packet in packets {
        if is_split_candidate(packet, governing) {
            let position = muxer.stream_position()?;
            points.push(SplitPoint { timecode_ns: packet.timecode_ns as u64, file_position: position });
        }
        muxer.add_packet(packet.clone())?;
    }
    muxer.finalize()?;
    Ok(points)
}

/// Drives pass 2: replays the packet stream pass 1 saw, opening a fresh
/// [`Muxer`] (and asking `host` for a new sink) every time a chosen split
/// point is reached.
pub struct MultiFileMuxer {
    cfg: MuxConfig,
    tracks: TrackRegistry,
    governing: Option<u64>,
    planner: SplitPlanner,
    pending_boundary: Option<u64>,
    global_timecode_offset: Option<i64>,
    current: Option<Muxer>,
    host: Box<dyn SplitHost>,
}

impl MultiFileMuxer {
    pub fn new(cfg: MuxConfig, tracks: TrackRegistry, split_points: Vec<SplitPoint>, mut host: Box<dyn SplitHost>) -> Result<Self, MuxError> {
        let governing = governing_track(&tracks);
        let mut planner = SplitPlanner::new(cfg.split_after, cfg.split_max_num_files);
        for p in split_points {
            planner.record(p);
        }
        let pending_boundary = planner.find_next().map(|i| planner.candidates()[i].timecode_ns);

        let sink = host.create_next_output_file(1, pending_boundary.is_none())?;
        let mut file_cfg = cfg.clone();
        file_cfg.pass = Pass::Write;
        let current = Muxer::new(file_cfg, tracks.clone(), sink, None)?;

        Ok(Self {
            cfg,
            tracks,
            governing,
            planner,
            pending_boundary,
            global_timecode_offset: None,
            current: Some(current),
            host,
        })
    }

    /// Forwards `packet` to the currently open file, rotating to a new one
    /// first if `packet` lands exactly on the next chosen split point.
    pub fn add_packet(&mut self, packet: Packet) -> Result<(), MuxError> {
        if self.global_timecode_offset.is_none() {
            self.global_timecode_offset = Some(packet.timecode_ns);
        }

        let at_boundary = self.pending_boundary == Some(packet.timecode_ns as u64) && is_split_candidate(&packet, self.governing);
        if at_boundary {
            self.rotate()?;
        }

        self.current.as_mut().expect("rotate always reinstalls a muxer").add_packet(packet)
    }

    fn rotate(&mut self) -> Result<(), MuxError> {
        let finished = self.current.take().expect("rotate called with no open file");
        let sink = finished.finalize()?;
        self.host.finish_file(sink)?;

        self.pending_boundary = self.planner.find_next().map(|i| self.planner.candidates()[i].timecode_ns);
        let is_last = self.pending_boundary.is_none();
        let next_sink = self.host.create_next_output_file(self.planner.file_num(), is_last)?;

        // `no_linking` restarts the next file's timeline at zero instead of
        // continuing the whole session's absolute timecodes.
        let offset = if self.cfg.no_linking { None } else { self.global_timecode_offset };

        let mut file_cfg = self.cfg.clone();
        file_cfg.pass = Pass::Write;
        self.current = Some(Muxer::new(file_cfg, self.tracks.clone(), next_sink, offset)?);
        Ok(())
    }

    /// Closes the last open file.
    pub fn finalize(mut self) -> Result<(), MuxError> {
        let finished = self.current.take().expect("finalize called on an already-finalized session");
        let sink = finished.finalize()?;
        self.host.finish_file(sink)
    }
}

/// A `Write + Seek` sink backed by a shared buffer, so a test can read back
/// what was written after a `Box<dyn WriteSeek>` has been handed off and
/// dropped -- trait objects can't be downcast back to `Cursor` without
/// `Any`, and the muxer has no reason to require that of every sink.
#[cfg(test)]
#[derive(Clone, Default)]
struct SharedSink(std::sync::Arc<std::sync::Mutex<std::io::Cursor<Vec<u8>>>>);

#[cfg(test)]
impl SharedSink {
    fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Vec<u8> {
        self.0.lock().unwrap().get_ref().clone()
    }
}

#[cfg(test)]
impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.0.lock().unwrap().flush()
    }
}

#[cfg(test)]
impl Seek for SharedSink {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.0.lock().unwrap().seek(pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SplitBudget;
    use crate::packet::{BackRef, ForwardRef};
    use crate::track::TrackDescriptor;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    fn single_video_track() -> TrackRegistry {
        let mut reg = TrackRegistry::new();
        reg.register(TrackDescriptor::video(1, "V_MPEG1", 352, 288));
        reg
    }

    fn key_frame(track: u64, timecode_ns: i64, duration_ns: i64) -> Packet {
        Packet::new(track, vec![0xAB; 16], timecode_ns, duration_ns)
    }

    #[test]
    fn single_file_session_writes_a_valid_segment_and_patches_duration() {
        let cfg = MuxConfig::default();
        let tracks = single_video_track();
        let sink = SharedSink::new();
        let mut muxer = Muxer::new(cfg, tracks, Box::new(sink.clone()), None).unwrap();

        for i in 0..3i64 {
            muxer.add_packet(key_frame(1, i * 40_000_000, 40_000_000)).unwrap();
        }
        muxer.finalize().unwrap();

        let bytes = sink.snapshot();
        assert_eq!(&bytes[0..4], &[0x1A, 0x45, 0xDF, 0xA3]);
        let segment_needle = [0x18, 0x53, 0x80, 0x67];
        assert!(bytes.windows(4).any(|w| w == segment_needle));
        let cluster_needle = [0x1F, 0x43, 0xB6, 0x75];
        assert!(bytes.windows(4).any(|w| w == cluster_needle));
    }

    #[test]
    fn cue_cluster_position_is_segment_relative_not_absolute() {
        let cfg = MuxConfig::default();
        let tracks = single_video_track();
        let sink = SharedSink::new();
        let mut muxer = Muxer::new(cfg, tracks, Box::new(sink.clone()), None).unwrap();
        let segment_body_start = muxer.segment_body_start;

        for i in 0..3i64 {
            muxer.add_packet(key_frame(1, i * 40_000_000, 40_000_000)).unwrap();
        }
        let cue_position = muxer.cues.iter().next().unwrap().cluster_position;
        muxer.finalize().unwrap();

        let bytes = sink.snapshot();
        let cluster_needle = [0x1F, 0x43, 0xB6, 0x75];
        let absolute_cluster_pos = bytes.windows(4).position(|w| w == cluster_needle).unwrap() as u64;

        // CueClusterPosition is relative to the start of the Segment body,
        // not the raw byte offset the sink happens to be at when the
        // cluster is written.
        assert_eq!(cue_position, absolute_cluster_pos - segment_body_start);
        assert_ne!(cue_position, absolute_cluster_pos);
    }

    /// Records one [`SharedSink`] per file it hands out; `finish_file` does
    /// nothing beyond that, since `SplitHost` only needs `Write + Seek` from
    /// the sinks it's given, not `Read` back.
    struct InMemoryHost {
        created: Arc<Mutex<Vec<SharedSink>>>,
    }

    impl SplitHost for InMemoryHost {
        fn finish_file(&mut self, _sink: Box<dyn WriteSeek>) -> Result<(), MuxError> {
            Ok(())
        }

        fn create_next_output_file(&mut self, _file_num: usize, _is_last: bool) -> Result<Box<dyn WriteSeek>, MuxError> {
            let sink = SharedSink::new();
            self.created.lock().unwrap().push(sink.clone());
            Ok(Box::new(sink))
        }
    }

    #[test]
    fn split_by_time_produces_multiple_files() {
        let mut cfg = MuxConfig::default();
        cfg.split_after = SplitBudget::Time(500_000_000);
        let tracks = single_video_track();

        let mut packets = Vec::new();
        for i in 0..20i64 {
            packets.push(key_frame(1, i * 100_000_000, 100_000_000));
        }

        let split_points = plan_split_points(&cfg, &tracks, &packets).unwrap();
        assert_eq!(split_points.len(), 20);

        let created = Arc::new(Mutex::new(Vec::new()));
        let host = Box::new(InMemoryHost { created: created.clone() });
        let mut session = MultiFileMuxer::new(cfg, tracks, split_points, host).unwrap();
        for p in packets {
            session.add_packet(p).unwrap();
        }
        session.finalize().unwrap();

        // 100ms spacing, 500ms budget -> splits at 500/1000/1500/1900ms, 5 files.
        assert_eq!(created.lock().unwrap().len(), 5);
        assert!(created.lock().unwrap().iter().all(|s| !s.snapshot().is_empty()));
    }

    #[test]
    fn unbounded_split_budget_produces_exactly_one_file() {
        let cfg = MuxConfig::default();
        let tracks = single_video_track();
        let packets: Vec<Packet> = (0..5i64).map(|i| key_frame(1, i * 40_000_000, 40_000_000)).collect();

        let split_points = plan_split_points(&cfg, &tracks, &packets).unwrap();
        let created = Arc::new(Mutex::new(Vec::new()));
        let host = Box::new(InMemoryHost { created: created.clone() });
        let mut session = MultiFileMuxer::new(cfg, tracks, split_points, host).unwrap();
        for p in packets {
            session.add_packet(p).unwrap();
        }
        session.finalize().unwrap();

        assert_eq!(created.lock().unwrap().len(), 1);
    }

    #[test]
    fn unresolved_reference_surfaces_through_the_muxer() {
        let cfg = MuxConfig::default();
        let tracks = single_video_track();
        let mut muxer = Muxer::new(cfg, tracks, Box::new(Cursor::new(Vec::new())), None).unwrap();

        let bogus = Packet::new(1, vec![1, 2, 3], 40_000_000, 40_000_000).with_refs(BackRef::Absolute(999_000_000), ForwardRef::None);
        let err = muxer.add_packet(bogus).unwrap_err();
        assert!(matches!(err, MuxError::UnresolvedReference { .. }));
    }
}
