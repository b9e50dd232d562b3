//! The cluster assembly and rendering engine.
//!
//! Grounded on `cluster_helper_c` (`cluster_helper.cpp`): `add_packet`
//! buffers frames into the active cluster and starts a new one once a
//! size/time/count budget is crossed; `render` writes the oldest finished
//! cluster, resolving each packet's backward/forward reference against
//! whatever is still buffered; `sweep` is `free_clusters` -- it marks
//! packets superseded once their track's free-reference watermark has
//! passed them, then drops any rendered cluster nothing still points into.
//!
//! The original keeps `kax_segment`/`out`/`kax_cues` as members reached via
//! globals; here every dependency the engine needs per call (the sink, the
//! track registry, the cue index) is passed in explicitly instead.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{Seek, Write};

use crate::context::MuxConfig;
use crate::cue::{CueEntry, CueIndex};
use crate::ebml::{push_uint_element, write_master_patched};
use crate::error::MuxError;
use crate::matroska::{encode_block_group, encode_simple_block, ids};
use crate::packet::{BackRef, ForwardRef, Packet, RenderedGroup};
use crate::track::{CueCreation, TrackRegistry};

#[derive(Debug)]
struct ClusterBuf {
    id: u64,
    base_timecode_ns: i64,
    packets: Vec<Packet>,
    rendered: bool,
    is_referenced: bool,
    position: Option<u64>,
}

/// Buffers packets into clusters, resolves references, and renders finished
/// clusters to a sink. Owns no I/O itself beyond what `render` is handed.
pub struct ClusterEngine {
    cfg: MuxConfig,
    clusters: Vec<ClusterBuf>,
    id_to_index: HashMap<u64, usize>,
    next_cluster_id: u64,
    active_id: Option<u64>,
    closed_ids: VecDeque<u64>,
    next_packet_id: u64,
    cluster_content_size: u64,
    max_timecode_ns: i64,
    timecode_offset_ns: Option<i64>,
    first_timecode_ns: Option<i64>,
    /// Per track: timecode below which packets are no longer referenced by
    /// anything yet to come, set each time a key frame is rendered.
    free_refs: HashMap<u64, i64>,
    /// Per track: timecode of the last frame other frames may reference,
    /// used to resolve `BackRef::Auto` as soon as a packet is added.
    last_ref_timecode: HashMap<u64, i64>,
    /// `(track_id, timecode_ns) -> (cluster_id, packet_index)`, replacing
    /// the original's linear `find_packet` scan over every cluster.
    ref_index: HashMap<(u64, i64), (u64, usize)>,
}

impl ClusterEngine {
    pub fn new(cfg: MuxConfig) -> Self {
        Self {
            cfg,
            clusters: Vec::new(),
            id_to_index: HashMap::new(),
            next_cluster_id: 0,
            active_id: None,
            closed_ids: VecDeque::new(),
            next_packet_id: 0,
            cluster_content_size: 0,
            max_timecode_ns: 0,
            timecode_offset_ns: None,
            first_timecode_ns: None,
            free_refs: HashMap::new(),
            last_ref_timecode: HashMap::new(),
            ref_index: HashMap::new(),
        }
    }

    fn active_index(&self) -> Option<usize> {
        self.active_id.and_then(|id| self.id_to_index.get(&id).copied())
    }

    fn open_cluster(&mut self, base_timecode_ns: i64) {
        let id = self.next_cluster_id;
        self.next_cluster_id += 1;
        let index = self.clusters.len();
        self.clusters.push(ClusterBuf {
            id,
            base_timecode_ns,
            packets: Vec::new(),
            rendered: false,
            is_referenced: false,
            position: None,
        });
        self.id_to_index.insert(id, index);
        self.active_id = Some(id);
        self.cluster_content_size = 0;
    }

    fn close_active(&mut self) {
        if let Some(id) = self.active_id.take() {
            self.closed_ids.push_back(id);
        }
    }

    /// Whether a finished cluster is waiting to be rendered.
    pub fn should_render(&self) -> bool {
        !self.closed_ids.is_empty()
    }

    pub fn max_timecode_ns(&self) -> i64 {
        self.max_timecode_ns - self.timecode_offset_ns.unwrap_or(0)
    }

    /// Presets the time origin instead of deriving it from the first
    /// rendered packet. Used by a split session's non-first file when
    /// `no_linking` is false: the on-disk cluster timecodes then continue
    /// the whole session's timeline instead of restarting at zero.
    pub fn set_timecode_offset(&mut self, offset_ns: i64) {
        self.timecode_offset_ns = Some(offset_ns);
        self.first_timecode_ns = Some(offset_ns);
    }

    /// Buffers one packet, opening or closing clusters as the size/time/count
    /// budgets dictate. `BackRef::Auto` is resolved immediately against the
    /// track's last referenceable frame, per the packetizer/engine split:
    /// the packetizer only ever knows "reference the previous frame", the
    /// engine is what actually tracks timecodes.
    pub fn add_packet(&mut self, mut packet: Packet) -> Result<(), MuxError> {
        let active_base = match self.active_index() {
            Some(idx) => Some(self.clusters[idx].base_timecode_ns),
            None => None,
        };

        match active_base {
            None => self.open_cluster(packet.timecode_ns),
            Some(base) if (packet.timecode_ns - base) as u64 > self.cfg.max_ms_per_cluster => {
                self.close_active();
                self.open_cluster(packet.timecode_ns);
            }
            _ => {}
        }

        if let BackRef::Auto = packet.bref {
            let resolved = self.last_ref_timecode.get(&packet.track_id).copied().unwrap_or(packet.timecode_ns);
            packet.bref = BackRef::Absolute(resolved);
        }
        if packet.fref.is_none() {
            self.last_ref_timecode.insert(packet.track_id, packet.timecode_ns);
        }

        packet.id = self.next_packet_id;
        self.next_packet_id += 1;

        let idx = self.active_index().expect("cluster opened above");
        let packet_idx = self.clusters[idx].packets.len();
        let cluster_id = self.clusters[idx].id;
        self.ref_index.insert((packet.track_id, packet.timecode_ns), (cluster_id, packet_idx));
        self.cluster_content_size += packet.payload.len() as u64;

        let end = packet.timecode_ns + packet.duration_ns;
        if end > self.max_timecode_ns {
            self.max_timecode_ns = end;
        }

        let base = self.clusters[idx].base_timecode_ns;
        self.clusters[idx].packets.push(packet);

        let overflowing = (self.clusters[idx].packets.last().unwrap().timecode_ns - base) as u64 > self.cfg.max_ms_per_cluster
            || self.clusters[idx].packets.len() > self.cfg.max_blocks_per_cluster
            || self.cluster_content_size > crate::context::MAX_BYTES_PER_CLUSTER;

        if overflowing {
            self.close_active();
        }

        Ok(())
    }

    /// Closes whatever cluster is currently being filled, even if no budget
    /// was crossed -- called once at end of stream so the last cluster still
    /// gets rendered.
    pub fn finalize(&mut self) {
        if self.active_index().map(|i| !self.clusters[i].packets.is_empty()).unwrap_or(false) {
            self.close_active();
        }
    }

    /// Renders the oldest finished-but-unwritten cluster.
    ///
    /// `segment_body_start` is the absolute byte offset of the first byte
    /// inside the `Segment` element's body (i.e. where `CueClusterPosition`
    /// values are relative to, per the Matroska spec); cue entries are
    /// stored as `cluster_position - segment_body_start`, not the sink's raw
    /// absolute position.
    pub fn render<W: Write + Seek>(
        &mut self,
        sink: &mut W,
        tracks: &TrackRegistry,
        cues: &mut CueIndex,
        segment_body_start: u64,
    ) -> Result<u64, MuxError> {
        let cluster_id = match self.closed_ids.pop_front() {
            Some(id) => id,
            None => return Ok(0),
        };
        let idx = self.id_to_index[&cluster_id];

        if self.timecode_offset_ns.is_none() {
            if let Some(first) = self.clusters[idx].packets.first() {
                self.timecode_offset_ns = Some(first.timecode_ns);
            }
        }
        if self.first_timecode_ns.is_none() {
            self.first_timecode_ns = self.timecode_offset_ns;
        }
        let timecode_offset = self.timecode_offset_ns.unwrap_or(0);
        let base_tc = self.clusters[idx].base_timecode_ns;

        let packet_count = self.clusters[idx].packets.len();
        let mut block_bodies: Vec<Vec<u8>> = Vec::with_capacity(packet_count);
        let mut cue_candidates: Vec<CueEntry> = Vec::new();

        for i in 0..packet_count {
            let (track_id, timecode_ns, duration_ns, bref, fref, ref_priority) = {
                let p = &self.clusters[idx].packets[i];
                (p.track_id, p.timecode_ns, p.duration_ns, p.bref, p.fref, p.ref_priority)
            };

            let offset_ticks = self.cfg.ticks(timecode_ns - base_tc);
            if offset_ticks < i16::MIN as i64 || offset_ticks > i16::MAX as i64 {
                return Err(MuxError::ClusterSpanTooWide(format!(
                    "block timecode offset {offset_ticks} exceeds i16 range; cluster span too wide"
                )));
            }

            let mut reference_offsets = Vec::new();
            if bref == BackRef::None {
                self.free_refs.insert(track_id, timecode_ns);
            } else if let BackRef::Absolute(wanted_tc) = bref {
                let &(ref_cluster_id, _) = self.ref_index.get(&(track_id, wanted_tc)).ok_or_else(|| {
                    MuxError::UnresolvedReference {
                        referencing_tc: timecode_ns as u64,
                        wanted_tc: wanted_tc as u64,
                        cluster_dump: self.dump_cluster(idx),
                    }
                })?;
                let _ = ref_cluster_id;
                reference_offsets.push(self.cfg.ticks(wanted_tc - timecode_ns));
            }
            if let ForwardRef::Absolute(wanted_tc) = fref {
                self.ref_index.get(&(track_id, wanted_tc)).ok_or_else(|| MuxError::UnresolvedReference {
                    referencing_tc: timecode_ns as u64,
                    wanted_tc: wanted_tc as u64,
                    cluster_dump: self.dump_cluster(idx),
                })?;
                reference_offsets.push(self.cfg.ticks(wanted_tc - timecode_ns));
            }

            let payload = std::mem::take(&mut self.clusters[idx].packets[i].payload);
            let block_duration_ticks = if duration_ns > 0 { Some(self.cfg.ticks(duration_ns) as u64) } else { None };

            let bytes = if reference_offsets.is_empty() && ref_priority == 0 && block_duration_ticks.is_none() {
                encode_simple_block(track_id, offset_ticks as i16, &payload, bref == BackRef::None)
            } else {
                encode_block_group(
                    track_id,
                    offset_ticks as i16,
                    &payload,
                    block_duration_ticks,
                    ref_priority,
                    &reference_offsets,
                )
            };

            self.clusters[idx].packets[i].rendered_group = Some(RenderedGroup {
                cluster_position: 0,
                block_group_index: i as u32,
            });

            if let Some(track) = tracks.get(track_id) {
                let wants_cue = match track.cue_creation {
                    CueCreation::IFrames => bref == BackRef::None,
                    CueCreation::All => true,
                    CueCreation::None => false,
                };
                if wants_cue {
                    cue_candidates.push(CueEntry {
                        track_number: track_id,
                        timecode_ticks: self.cfg.ticks(timecode_ns) as u64,
                        cluster_position: 0,
                    });
                }
            }

            block_bodies.push(bytes);
        }

        let position = sink.stream_position()?;
        write_master_patched(sink, ids::CLUSTER, |w| {
            let mut head = Vec::new();
            push_uint_element(&mut head, ids::TIMECODE, self.cfg.ticks(base_tc - timecode_offset) as u64);
            w.write_all(&head)?;
            for body in &block_bodies {
                w.write_all(body)?;
            }
            Ok(())
        })?;

        let relative_position = position - segment_body_start;
        for mut entry in cue_candidates {
            entry.cluster_position = relative_position;
            cues.push(entry);
        }

        self.clusters[idx].rendered = true;
        self.clusters[idx].position = Some(position);

        self.sweep();

        Ok(position)
    }

    fn dump_cluster(&self, idx: usize) -> String {
        let mut out = String::new();
        for (i, p) in self.clusters[idx].packets.iter().enumerate() {
            out.push_str(&format!(
                "packet {i}: track {} timecode {} bref {:?} fref {:?}\n",
                p.track_id, p.timecode_ns, p.bref, p.fref
            ));
        }
        out
    }

    /// `free_clusters`: mark packets superseded once their track's
    /// free-reference watermark has passed them, mark every cluster still
    /// holding a live (non-superseded) or referenced-by-a-live-packet
    /// packet, then drop any rendered cluster that ends up unreferenced.
    fn sweep(&mut self) {
        for cluster in &mut self.clusters {
            cluster.is_referenced = false;
        }

        for cluster in &mut self.clusters {
            for packet in &mut cluster.packets {
                if let Some(&watermark) = self.free_refs.get(&packet.track_id) {
                    if watermark > packet.timecode_ns {
                        packet.superseded = true;
                    }
                }
            }
        }

        let mut referenced: HashSet<u64> = HashSet::new();
        for cluster in &self.clusters {
            for packet in &cluster.packets {
                if packet.superseded {
                    continue;
                }
                referenced.insert(cluster.id);
                if let BackRef::Absolute(wanted_tc) = packet.bref {
                    if let Some(&(ref_cluster_id, _)) = self.ref_index.get(&(packet.track_id, wanted_tc)) {
                        referenced.insert(ref_cluster_id);
                    }
                }
            }
        }
        for cluster in &mut self.clusters {
            cluster.is_referenced = referenced.contains(&cluster.id);
        }

        for cluster in &mut self.clusters {
            for packet in &mut cluster.packets {
                if packet.superseded {
                    packet.drop_payload();
                }
            }
        }

        let before = self.clusters.len();
        self.clusters.retain(|c| !(c.rendered && !c.is_referenced));
        if self.clusters.len() != before {
            self.rebuild_indexes();
        }
    }

    fn rebuild_indexes(&mut self) {
        self.id_to_index.clear();
        self.ref_index.clear();
        for (idx, cluster) in self.clusters.iter().enumerate() {
            self.id_to_index.insert(cluster.id, idx);
            for (pidx, packet) in cluster.packets.iter().enumerate() {
                self.ref_index.insert((packet.track_id, packet.timecode_ns), (cluster.id, pidx));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{MuxConfig, SplitBudget};
    use crate::track::TrackDescriptor;
    use std::io::Cursor;

    fn registry() -> TrackRegistry {
        let mut reg = TrackRegistry::new();
        reg.register(TrackDescriptor::video(1, "V_MPEG1", 352, 288));
        reg
    }

    #[test]
    fn pure_iframe_stream_renders_one_simple_block_per_packet() {
        let mut cfg = MuxConfig::default();
        cfg.max_blocks_per_cluster = 2;
        let mut engine = ClusterEngine::new(cfg);
        let tracks = registry();
        let mut cues = CueIndex::new();
        let mut sink = Cursor::new(Vec::new());

        for i in 0..3i64 {
            let pkt = Packet::new(1, vec![0xAA; 10], i * 40_000_000, 40_000_000);
            engine.add_packet(pkt).unwrap();
        }
        engine.finalize();

        let mut rendered = 0;
        while engine.should_render() {
            engine.render(&mut sink, &tracks, &mut cues, 0).unwrap();
            rendered += 1;
        }
        assert!(rendered >= 1);
        assert!(!cues.is_empty());
        assert!(!sink.into_inner().is_empty());
    }

    #[test]
    fn cluster_overflows_by_byte_size_well_before_time_or_count_limits() {
        let cfg = MuxConfig::default(); // max_ms_per_cluster and max_blocks_per_cluster both generous
        let mut engine = ClusterEngine::new(cfg);

        let mut packets_before_first_close = None;
        for i in 0..200i64 {
            engine.add_packet(Packet::new(1, vec![0xAA; 10_000], i * 1_000_000, 1_000_000)).unwrap();
            if packets_before_first_close.is_none() && engine.should_render() {
                packets_before_first_close = Some(i + 1);
            }
        }

        // 1.5 MB / 10 KB per packet == 150 packets; the byte budget must
        // close the first cluster at or before that, well short of the
        // 200-packet stream and the much larger default time/count budgets.
        let count = packets_before_first_close.expect("byte budget must have closed a cluster");
        assert!(count <= 150, "cluster closed after {count} packets, expected <= 150");
    }

    #[test]
    fn cluster_overflows_by_block_count() {
        let mut cfg = MuxConfig::default();
        cfg.max_blocks_per_cluster = 2;
        let mut engine = ClusterEngine::new(cfg);

        for i in 0..5i64 {
            engine.add_packet(Packet::new(1, vec![0; 4], i * 1_000_000, 1_000_000)).unwrap();
        }
        assert!(engine.should_render());
    }

    #[test]
    fn unresolved_reference_is_reported_instead_of_panicking() {
        let cfg = MuxConfig::default();
        let mut engine = ClusterEngine::new(cfg);
        let tracks = registry();
        let mut cues = CueIndex::new();
        let mut sink = Cursor::new(Vec::new());

        let bogus_bref = BackRef::Absolute(999_000_000);
        let pkt = Packet::new(1, vec![1, 2, 3], 40_000_000, 40_000_000).with_refs(bogus_bref, ForwardRef::None);
        engine.add_packet(pkt).unwrap();
        engine.finalize();

        let err = engine.render(&mut sink, &tracks, &mut cues, 0).unwrap_err();
        match err {
            MuxError::UnresolvedReference { .. } => {}
            other => panic!("expected UnresolvedReference, got {other:?}"),
        }
    }

    #[test]
    fn sweep_reclaims_rendered_clusters_once_unreferenced() {
        let mut cfg = MuxConfig::default();
        cfg.max_blocks_per_cluster = 1;
        cfg.split_after = SplitBudget::Unbounded;
        let mut engine = ClusterEngine::new(cfg);
        let tracks = registry();
        let mut cues = CueIndex::new();
        let mut sink = Cursor::new(Vec::new());

        for i in 0..4i64 {
            engine.add_packet(Packet::new(1, vec![0; 4], i * 40_000_000, 40_000_000)).unwrap();
            while engine.should_render() {
                engine.render(&mut sink, &tracks, &mut cues, 0).unwrap();
            }
        }
        engine.finalize();
        while engine.should_render() {
            engine.render(&mut sink, &tracks, &mut cues, 0).unwrap();
        }

        // every packet here is a key frame, so each new one frees the last;
        // at most one rendered-and-referenced cluster should remain buffered.
        assert!(engine.clusters.len() <= 2);
    }
}
