//! MPEG-1/2 elementary-stream frame discovery and packetization.
//!
//! `SequenceParser` is the low-level state machine: it buffers raw bytes,
//! finds picture/sequence/GOP start codes, and reports whole frames plus the
//! sequence header's width/height/frame-rate once seen -- the analogue of
//! the original's `M2VParser`. `Mpeg12Packetizer` is the thin layer on top
//! that assigns `Packet`s the reference metadata the cluster engine needs,
//! grounded on `video_packetizer_c::process`'s non-reordering path (MPEG-1/2
//! streams are already stored in decode order; B frames simply carry
//! explicit backward/forward references instead of needing reassembly).

use std::collections::VecDeque;

use crate::error::ConnectionResult;
use crate::packet::{BackRef, ForwardRef, Packet};
use crate::packetizer::{FrameType, MpegProfile};

/// Caps how much unparsed input `SequenceParser` will hold at once. Mirrors
/// the free-buffer-space check in `mpeg_12_video_packetizer_c::process`,
/// which never writes more than the parser's remaining capacity in one go.
const BUFFER_CAPACITY: usize = 512 * 1024;

const PICTURE_START_CODE: u8 = 0x00;
const SEQUENCE_HEADER_CODE: u8 = 0xB3;
const SEQUENCE_END_CODE: u8 = 0xB7;
const GOP_START_CODE: u8 = 0xB8;
const EXTENSION_START_CODE: u8 = 0xB5;

/// `GetState()` equivalent: what the driver should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    NeedData,
    FrameReady,
    EndOfStream,
    Error,
}

/// Sequence header fields needed to build the track's geometry and default
/// frame duration. `raw` is kept so it can be stashed as `CodecPrivate`.
#[derive(Debug, Clone)]
pub struct SequenceHeader {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub raw: Vec<u8>,
}

/// One parsed frame, decode-order, with whatever reference timecodes the
/// parser could resolve from frames it has already seen.
#[derive(Debug, Clone)]
pub struct ParsedFrame {
    pub payload: Vec<u8>,
    pub timecode_ns: i64,
    pub duration_ns: i64,
    /// `None` on a P frame means "resolve against the engine's last
    /// key-or-P timecode" (`BackRef::Auto`); always `Some` on a B frame.
    pub first_ref: Option<i64>,
    pub second_ref: Option<i64>,
    pub frame_type: FrameType,
}

struct PendingFrame {
    start: usize,
    temporal_reference: u16,
    coding_type: u8,
}

/// Maps the 4-bit `frame_rate_code` field to its standard MPEG-1/2 value.
fn frame_rate_for_code(code: u8) -> f64 {
    match code {
        1 => 24000.0 / 1001.0,
        2 => 24.0,
        3 => 25.0,
        4 => 30000.0 / 1001.0,
        5 => 30.0,
        6 => 50.0,
        7 => 60000.0 / 1001.0,
        8 => 60.0,
        _ => 25.0,
    }
}

/// Buffers raw MPEG-1/2 ES bytes and emits whole frames in bitstream
/// (decode) order as soon as their boundary (the next start code) arrives.
pub struct SequenceParser {
    buf: Vec<u8>,
    /// Index into `buf` up to which we've already scanned for start codes.
    scanned: usize,
    current: Option<PendingFrame>,
    sequence_header: Option<SequenceHeader>,
    version: Option<u8>,
    ready: VecDeque<ParsedFrame>,
    state: ParserState,
    frames_output: u64,
    gop_base_ns: i64,
    /// Last two decode-order I/P timecodes, oldest first; B frames read
    /// their back/forward references straight out of this.
    ref_history: VecDeque<i64>,
}

impl SequenceParser {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            current: None,
            sequence_header: None,
            version: None,
            ready: VecDeque::new(),
            state: ParserState::NeedData,
            frames_output: 0,
            gop_base_ns: 0,
            ref_history: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    pub fn sequence_header(&self) -> Option<&SequenceHeader> {
        self.sequence_header.as_ref()
    }

    /// MPEG version (1 or 2). Defaults to 1 once a sequence header has been
    /// seen but no sequence-extension start code followed it; `None` until
    /// the first sequence header is parsed at all.
    pub fn mpeg_version(&self) -> Option<u8> {
        self.version.or(self.sequence_header.as_ref().map(|_| 1))
    }

    pub fn free_buffer_space(&self) -> usize {
        BUFFER_CAPACITY.saturating_sub(self.buf.len())
    }

    fn frame_duration_ns(&self) -> i64 {
        let fps = self.sequence_header.as_ref().map(|h| h.fps).unwrap_or(25.0);
        (1_000_000_000.0 / fps).round() as i64
    }

    /// Pushes as much of `data` as free buffer space allows, scanning after
    /// each chunk -- the loop the original's `process` drives from the
    /// output side, here owned by the parser itself.
    pub fn write_data(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let room = self.free_buffer_space();
            if room == 0 {
                log::warn!("mpeg12 parser buffer full with no frame boundary found; dropping input");
                break;
            }
            let take = room.min(data.len());
            self.buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            self.scan();
        }
    }

    pub fn end_of_stream(&mut self) {
        if let Some(p) = self.current.take() {
            let payload = self.buf[p.start..].to_vec();
            self.emit(p, payload);
        }
        self.state = if self.ready.is_empty() { ParserState::EndOfStream } else { ParserState::FrameReady };
    }

    pub fn read_frame(&mut self) -> Option<ParsedFrame> {
        let frame = self.ready.pop_front();
        if self.ready.is_empty() && self.state == ParserState::FrameReady {
            self.state = ParserState::NeedData;
        }
        frame
    }

    /// Scans the unscanned tail of `buf` for start codes, closing off
    /// whichever frame they terminate and trimming bytes that can no
    /// longer be part of any future frame.
    fn scan(&mut self) {
        let mut i = self.scanned.max(self.current.as_ref().map(|p| p.start).unwrap_or(0));
        loop {
            if i + 4 > self.buf.len() {
                break;
            }
            if !(self.buf[i] == 0 && self.buf[i + 1] == 0 && self.buf[i + 2] == 1) {
                i += 1;
                continue;
            }
            let id = self.buf[i + 3];
            match id {
                PICTURE_START_CODE => {
                    if i + 6 > self.buf.len() {
                        break; // need the two header bytes before we can classify it
                    }
                    let h0 = self.buf[i + 4] as u16;
                    let h1 = self.buf[i + 5] as u16;
                    let bits = (h0 << 8) | h1;
                    let temporal_reference = (bits >> 6) & 0x3FF;
                    let coding_type = ((bits >> 3) & 0x07) as u8;

                    if let Some(prev) = self.current.take() {
                        let payload = self.buf[prev.start..i].to_vec();
                        self.emit(prev, payload);
                    }
                    self.current = Some(PendingFrame { start: i, temporal_reference, coding_type });
                    i += 4;
                }
                SEQUENCE_HEADER_CODE => {
                    if i + 8 > self.buf.len() {
                        break;
                    }
                    if self.sequence_header.is_none() {
                        self.parse_sequence_header(i);
                    }
                    i += 8;
                }
                GOP_START_CODE => {
                    // A new GOP restarts `temporal_reference` at 0; anchor the
                    // continuous timeline at the frame count seen so far.
                    self.gop_base_ns = self.frames_output as i64 * self.frame_duration_ns();
                    i += 4;
                }
                SEQUENCE_END_CODE => {
                    if let Some(prev) = self.current.take() {
                        let payload = self.buf[prev.start..i].to_vec();
                        self.emit(prev, payload);
                    }
                    i += 4;
                }
                _ => {
                    // A sequence-extension start code right after a sequence
                    // header is the only signal MPEG-2 gives that it isn't
                    // MPEG-1; there is no dedicated start code for "version".
                    if id == EXTENSION_START_CODE && self.version.is_none() && self.sequence_header.is_some() {
                        self.version = Some(2);
                    }
                    i += 4;
                }
            }
        }
        self.scanned = i.min(self.buf.len());

        // Drop everything that can no longer belong to an in-flight or
        // future frame, the parser's equivalent of `free_clusters`.
        let keep_from = self.current.as_ref().map(|p| p.start).unwrap_or(self.scanned.saturating_sub(3));
        if keep_from > 0 {
            self.buf.drain(0..keep_from);
            self.scanned -= keep_from;
            if let Some(p) = &mut self.current {
                p.start -= keep_from;
            }
        }

        if !self.ready.is_empty() {
            self.state = ParserState::FrameReady;
        }
    }

    fn parse_sequence_header(&mut self, start: usize) {
        let header = &self.buf[start + 4..start + 8];
        let bits = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let width = (bits >> 20) & 0xFFF;
        let height = (bits >> 8) & 0xFFF;
        let frame_rate_code = (bits & 0x0F) as u8;
        self.sequence_header = Some(SequenceHeader {
            width,
            height,
            fps: frame_rate_for_code(frame_rate_code),
            raw: header.to_vec(),
        });
    }

    fn emit(&mut self, pending: PendingFrame, payload: Vec<u8>) {
        let duration_ns = self.frame_duration_ns();
        let timecode_ns = self.gop_base_ns + pending.temporal_reference as i64 * duration_ns;

        let frame_type = match pending.coding_type {
            1 => FrameType::I,
            2 => FrameType::P,
            3 => FrameType::B,
            other => {
                log::warn!("mpeg12 parser: unsupported picture_coding_type {other}, dropping frame");
                return;
            }
        };

        let (first_ref, second_ref) = match frame_type {
            FrameType::I => {
                self.push_ref(timecode_ns);
                (None, None)
            }
            FrameType::P => {
                self.push_ref(timecode_ns);
                (None, None)
            }
            FrameType::B => {
                if self.ref_history.len() < 2 {
                    log::warn!("mpeg12 parser: B frame with fewer than two prior references, dropping");
                    return;
                }
                (Some(self.ref_history[0]), Some(self.ref_history[1]))
            }
        };

        self.frames_output += 1;
        self.ready.push_back(ParsedFrame {
            payload,
            timecode_ns,
            duration_ns,
            first_ref,
            second_ref,
            frame_type,
        });
    }

    fn push_ref(&mut self, timecode_ns: i64) {
        self.ref_history.push_back(timecode_ns);
        while self.ref_history.len() > 2 {
            self.ref_history.pop_front();
        }
    }
}

impl Default for SequenceParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Wraps a [`SequenceParser`] and turns its frames into engine-ready
/// `Packet`s, the MPEG-1/2 branch of `video_packetizer_c::process`.
pub struct Mpeg12Packetizer {
    track_id: u64,
    parser: SequenceParser,
}

impl Mpeg12Packetizer {
    pub fn new(track_id: u64) -> Self {
        Self { track_id, parser: SequenceParser::new() }
    }

    pub fn sequence_header(&self) -> Option<&SequenceHeader> {
        self.parser.sequence_header()
    }

    pub fn mpeg_version(&self) -> Option<u8> {
        self.parser.mpeg_version()
    }

    /// The `TrackState.mpeg_profile` field (§3): derived straight from
    /// `mpeg_version`, used to pick the on-disk codec id (`V_MPEG1`/`V_MPEG2`).
    pub fn mpeg_profile(&self) -> MpegProfile {
        match self.mpeg_version() {
            Some(1) => MpegProfile::Mpeg1,
            Some(2) => MpegProfile::Mpeg2,
            _ => MpegProfile::None,
        }
    }

    /// The Matroska codec id this packetizer's stream should be registered
    /// under, once its sequence header has been seen.
    pub fn codec_id(&self) -> Option<&'static str> {
        match self.mpeg_profile() {
            MpegProfile::Mpeg1 => Some("V_MPEG1"),
            MpegProfile::Mpeg2 => Some("V_MPEG2"),
            _ => None,
        }
    }

    /// Feeds raw bytes in and drains every frame the parser can produce
    /// from them, translating each into a `Packet`. Mirrors the
    /// `GetFreeBufferSpace`/`WriteData`/`ReadFrame` loop in the original.
    pub fn process(&mut self, data: &[u8]) -> Vec<Packet> {
        self.parser.write_data(data);
        self.drain()
    }

    pub fn flush(&mut self) -> Vec<Packet> {
        self.parser.end_of_stream();
        self.drain()
    }

    fn drain(&mut self) -> Vec<Packet> {
        let mut packets = Vec::new();
        while let Some(frame) = self.parser.read_frame() {
            packets.push(self.to_packet(frame));
        }
        packets
    }

    fn to_packet(&self, frame: ParsedFrame) -> Packet {
        let (bref, fref) = match frame.frame_type {
            FrameType::I => (BackRef::None, ForwardRef::None),
            FrameType::P => (
                frame.first_ref.map(BackRef::Absolute).unwrap_or(BackRef::Auto),
                ForwardRef::None,
            ),
            FrameType::B => (
                BackRef::Absolute(frame.first_ref.expect("B frame always carries a backward ref")),
                ForwardRef::Absolute(frame.second_ref.expect("B frame always carries a forward ref")),
            ),
        };
        Packet::new(self.track_id, frame.payload, frame.timecode_ns, frame.duration_ns).with_refs(bref, fref)
    }
}

/// Connection compatibility (§4.2): whether two MPEG-1/2 video packetizers
/// may be concatenated across a connection boundary without the target
/// starting a fresh `TrackEntry`. Grounded on `video_packetizer_c::can_connect_to`:
/// `NoFormat` is reserved for a packetizer kind mismatch (here, no sequence
/// header could be parsed at all); an MPEG-1/MPEG-2 profile mismatch is a
/// differing codec id, which is `NoParameters`, same as a geometry or frame
/// rate mismatch.
pub fn connection_compatible(a: &Mpeg12Packetizer, b: &Mpeg12Packetizer) -> ConnectionResult {
    let (ha, hb) = match (a.sequence_header(), b.sequence_header()) {
        (Some(ha), Some(hb)) => (ha, hb),
        _ => return ConnectionResult::NoFormat,
    };
    if a.mpeg_profile() != b.mpeg_profile() {
        return ConnectionResult::NoParameters;
    }
    if ha.width != hb.width || ha.height != hb.height || (ha.fps - hb.fps).abs() > f64::EPSILON {
        return ConnectionResult::NoParameters;
    }
    if ha.raw != hb.raw {
        return ConnectionResult::NoParameters;
    }
    ConnectionResult::Yes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start_code(id: u8) -> [u8; 4] {
        [0x00, 0x00, 0x01, id]
    }

    fn sequence_header_bytes() -> Vec<u8> {
        // width=352 (0x160), height=288 (0x120), aspect=1, frame_rate_code=3 (25fps)
        let mut v = start_code(SEQUENCE_HEADER_CODE).to_vec();
        let width: u32 = 352;
        let height: u32 = 288;
        let aspect: u32 = 1;
        let frame_rate: u32 = 3;
        let bits = (width << 20) | (height << 8) | (aspect << 4) | frame_rate;
        v.extend_from_slice(&bits.to_be_bytes());
        v
    }

    fn picture_header_bytes(temporal_reference: u16, coding_type: u8) -> Vec<u8> {
        let mut v = start_code(PICTURE_START_CODE).to_vec();
        let bits: u16 = (temporal_reference << 6) | ((coding_type as u16) << 3);
        v.extend_from_slice(&bits.to_be_bytes());
        v
    }

    #[test]
    fn sequence_header_is_parsed_once() {
        let mut p = SequenceParser::new();
        p.write_data(&sequence_header_bytes());
        p.write_data(&picture_header_bytes(0, 1));
        p.write_data(&[0xAA, 0xBB]);
        p.write_data(&picture_header_bytes(1, 2));

        let header = p.sequence_header().unwrap();
        assert_eq!(header.width, 352);
        assert_eq!(header.height, 288);
        assert!((header.fps - 25.0).abs() < 0.01);
    }

    #[test]
    fn iframe_then_pframe_emit_in_decode_order() {
        let mut pack = Mpeg12Packetizer::new(1);
        let mut bytes = sequence_header_bytes();
        bytes.extend(picture_header_bytes(0, 1)); // I
        bytes.extend([1, 2, 3]);
        bytes.extend(picture_header_bytes(1, 2)); // P
        bytes.extend([4, 5, 6]);

        let mut packets = pack.process(&bytes);
        packets.extend(pack.flush());

        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].bref, BackRef::None);
        assert_eq!(packets[1].bref, BackRef::Auto);
    }

    #[test]
    fn bframe_resolves_explicit_refs_from_history() {
        let mut pack = Mpeg12Packetizer::new(1);
        let mut bytes = sequence_header_bytes();
        bytes.extend(picture_header_bytes(0, 1)); // I, temporal_reference 0
        bytes.extend([1]);
        bytes.extend(picture_header_bytes(3, 2)); // P, temporal_reference 3
        bytes.extend([2]);
        bytes.extend(picture_header_bytes(1, 3)); // B, temporal_reference 1
        bytes.extend([3]);
        bytes.extend(picture_header_bytes(2, 3)); // B, temporal_reference 2
        bytes.extend([4]);

        let mut packets = pack.process(&bytes);
        packets.extend(pack.flush());

        assert_eq!(packets.len(), 4);
        let i_tc = packets[0].timecode_ns;
        let p_tc = packets[1].timecode_ns;
        assert_eq!(packets[2].bref, BackRef::Absolute(i_tc));
        assert_eq!(packets[2].fref, ForwardRef::Absolute(p_tc));
        assert_eq!(packets[3].bref, BackRef::Absolute(i_tc));
        assert_eq!(packets[3].fref, ForwardRef::Absolute(p_tc));
    }

    #[test]
    fn orphan_b_frame_with_no_history_is_dropped() {
        let mut pack = Mpeg12Packetizer::new(1);
        let mut bytes = sequence_header_bytes();
        bytes.extend(picture_header_bytes(0, 3)); // B with no prior refs at all
        bytes.extend([9]);
        bytes.extend(picture_header_bytes(1, 1)); // I, closes off the B above

        let packets = pack.process(&bytes);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].bref, BackRef::None);
    }

    #[test]
    fn connection_compatible_accepts_matching_geometry_and_rejects_mismatches() {
        let mut a = Mpeg12Packetizer::new(1);
        a.process(&sequence_header_bytes());
        let mut b = Mpeg12Packetizer::new(2);
        b.process(&sequence_header_bytes());
        assert_eq!(connection_compatible(&a, &b), ConnectionResult::Yes);
        assert_eq!(a.codec_id(), Some("V_MPEG1"));

        let mut c = Mpeg12Packetizer::new(3);
        let mut other = sequence_header_bytes();
        // change width from 352 to 176 in the packed header bits.
        let bits = u32::from_be_bytes([other[4], other[5], other[6], other[7]]);
        let changed = (176u32 << 20) | (bits & 0x000F_FFFF);
        other[4..8].copy_from_slice(&changed.to_be_bytes());
        c.process(&other);
        assert_eq!(connection_compatible(&a, &c), ConnectionResult::NoParameters);

        let fresh = Mpeg12Packetizer::new(4);
        assert_eq!(connection_compatible(&a, &fresh), ConnectionResult::NoFormat);
    }

    #[test]
    fn connection_compatible_reports_no_parameters_for_profile_mismatch() {
        let mut mpeg1 = Mpeg12Packetizer::new(1);
        mpeg1.process(&sequence_header_bytes());
        assert_eq!(mpeg1.mpeg_profile(), MpegProfile::Mpeg1);

        let mut mpeg2 = Mpeg12Packetizer::new(2);
        let mut bytes = sequence_header_bytes();
        bytes.extend_from_slice(&start_code(EXTENSION_START_CODE));
        mpeg2.process(&bytes);
        assert_eq!(mpeg2.mpeg_profile(), MpegProfile::Mpeg2);

        // Both packetizers parsed a sequence header fine; a differing codec
        // id (MPEG-1 vs MPEG-2) is a parameter mismatch, not a format one.
        assert_eq!(connection_compatible(&mpeg1, &mpeg2), ConnectionResult::NoParameters);
    }
}
