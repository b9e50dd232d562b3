//! Native MPEG-4 Part 2 B-frame reordering.
//!
//! MPEG-4 Part 2 elementary streams are stored in *display* order, not
//! decode order, unlike MPEG-1/2. Grounded on `video_packetizer_c::process`'s
//! native-MPEG4 branch and `flush_frames` (`output/p_video.cpp`): the
//! reorderer keeps a sliding two-slot window (`bref_slot`/`fref_slot`) plus a
//! FIFO of queued B frames, and only knows where a B frame's forward
//! reference lands once the *next* I or P frame has arrived. `split_access_units`
//! below finds VOP boundaries and reads `vop_coding_type` the way the
//! original's `mpeg4_find_frame_types` does.

use std::collections::VecDeque;
use std::ops::Range;

use crate::error::MuxError;
use crate::packet::{BackRef, ForwardRef, Packet};
use crate::packetizer::FrameType;

const VOP_START_CODE: u8 = 0xB6;
const VOL_START_CODE_LOW: u8 = 0x20;
const VOL_START_CODE_HIGH: u8 = 0x2F;

/// Splits one input buffer into `(type, byte range)` slices in bitstream
/// order. A buffer may hold zero, one, or several VOPs, mirroring the
/// `vector<video_frame_t>` the original's `mpeg4_find_frame_types` fills.
pub fn split_access_units(data: &[u8]) -> Vec<(FrameType, Range<usize>)> {
    let mut starts = Vec::new();
    let mut i = 0usize;
    while i + 4 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 && data[i + 3] == VOP_START_CODE {
            starts.push(i);
            i += 4;
        } else {
            i += 1;
        }
    }

    let mut out = Vec::with_capacity(starts.len());
    for (idx, &start) in starts.iter().enumerate() {
        let end = starts.get(idx + 1).copied().unwrap_or(data.len());
        // vop_coding_type is the top two bits of the byte right after the
        // start code: 00 = I, 01 = P, 10 = B, 11 = S (treated as P here, as
        // the original's `(frames[i].type == 'P') || (frames[i].type == 'S')`
        // checks always lump the two together).
        let coding_bits = data.get(start + 4).copied().unwrap_or(0);
        let frame_type = match (coding_bits >> 6) & 0x03 {
            0 => FrameType::I,
            2 => FrameType::B,
            _ => FrameType::P,
        };
        out.push((frame_type, start..end));
    }
    out
}

/// Scans for a `video_object_layer_start_code` (`0x20`-`0x2F`) and reads the
/// aspect ratio fields that follow `video_object_layer_shape`, the native
/// analogue of `mpeg4_extract_par`. Returns `(num, den)` for
/// `aspect_ratio_info` values 2-5 (the fixed ITU table) or 15 (extended,
/// explicit width/height follow); returns `None` for 1 (square pixels,
/// nothing to override) or if no VOL header is found.
pub fn extract_par(data: &[u8]) -> Option<(u32, u32)> {
    let mut i = 0usize;
    while i + 5 < data.len() {
        if data[i] == 0
            && data[i + 1] == 0
            && data[i + 2] == 1
            && (VOL_START_CODE_LOW..=VOL_START_CODE_HIGH).contains(&data[i + 3])
        {
            let mut r = BitReader::new(&data[i + 4..]);
            r.skip(1); // random_accessible_vol
            r.skip(8); // video_object_type_indication
            if r.get(1) == 1 {
                // is_object_layer_identifier
                r.skip(4 + 3); // video_object_layer_verid, video_object_layer_priority
            }
            let aspect_ratio_info = r.get(4);
            return match aspect_ratio_info {
                0 | 1 => None,
                2 => Some((12, 11)),
                3 => Some((10, 11)),
                4 => Some((16, 11)),
                5 => Some((40, 33)),
                15 => {
                    let num = r.get(8);
                    let den = r.get(8);
                    if num == 0 || den == 0 { None } else { Some((num, den)) }
                }
                _ => None,
            };
        }
        i += 1;
    }
    None
}

/// Minimal MSB-first bit reader used only for the handful of fixed-width
/// fields `extract_par` needs out of a VOL header.
struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn skip(&mut self, bits: usize) {
        self.pos += bits;
    }

    fn get(&mut self, bits: usize) -> u32 {
        let mut value = 0u32;
        for _ in 0..bits {
            let byte_index = self.pos / 8;
            let bit = if byte_index < self.data.len() {
                let shift = 7 - (self.pos % 8);
                (self.data[byte_index] >> shift) & 1
            } else {
                0
            };
            value = (value << 1) | bit as u32;
            self.pos += 1;
        }
        value
    }
}

#[derive(Debug, Clone)]
struct SlotFrame {
    frame_type: FrameType,
    payload: Vec<u8>,
    timecode_ns: i64,
    duration_ns: i64,
    /// The backward reference this frame carries when it is itself emitted
    /// (fixed at the moment it is installed into a slot, per the original's
    /// `frames[i].bref = ...` assignment).
    own_bref: BackRef,
}

/// The reordering state machine: one instance per MPEG-4 Part 2 track.
pub struct Mpeg4Reorderer {
    track_id: u64,
    fps: f64,
    frames_output: u64,
    duration_shift_ns: i64,
    bref_slot: Option<SlotFrame>,
    fref_slot: Option<SlotFrame>,
    queued_bs: VecDeque<SlotFrame>,
    bframes_seen: bool,
}

impl Mpeg4Reorderer {
    pub fn new(track_id: u64, fps: f64) -> Self {
        Self {
            track_id,
            fps,
            frames_output: 0,
            duration_shift_ns: 0,
            bref_slot: None,
            fref_slot: None,
            queued_bs: VecDeque::new(),
            bframes_seen: false,
        }
    }

    /// Whether any B frame has been seen yet. The caller uses this to decide
    /// whether to upgrade the track's codec id from `V_MPEG4/ISO/SP` to
    /// `V_MPEG4/ISO/ASP` and re-render its headers, per `flush_frames`'s
    /// `set_codec_id(MKV_V_MPEG4_ASP)` call.
    pub fn bframes_seen(&self) -> bool {
        self.bframes_seen
    }

    fn nominal_duration_ns(&self) -> i64 {
        (1_000_000_000.0 / self.fps).round() as i64
    }

    fn next_timecode(&self, old_timecode: Option<i64>) -> i64 {
        old_timecode.unwrap_or_else(|| {
            (1_000_000_000.0 * self.frames_output as f64 / self.fps).round() as i64 + self.duration_shift_ns
        })
    }

    fn emit_slot(&self, frame: &SlotFrame) -> Packet {
        Packet::new(self.track_id, frame.payload.clone(), frame.timecode_ns, frame.duration_ns)
            .with_refs(frame.own_bref, ForwardRef::None)
    }

    /// Feeds one input buffer (which may hold several VOPs) through the
    /// slot machine, returning every `Packet` the buffer's frames caused to
    /// be emitted -- zero or more, since B frames only surface once their
    /// forward reference is known.
    pub fn process(
        &mut self,
        data: &[u8],
        old_timecode: Option<i64>,
        duration_ns: Option<i64>,
    ) -> Result<Vec<Packet>, MuxError> {
        let mut out = Vec::new();
        for (frame_type, range) in split_access_units(data) {
            let nominal = self.nominal_duration_ns();
            let actual_duration = duration_ns.unwrap_or(nominal);
            if duration_ns.is_some() && actual_duration != nominal {
                self.duration_shift_ns += actual_duration - nominal;
            }

            match frame_type {
                FrameType::I => self.flush(true, false, &mut out)?,
                _ if self.fref_slot.is_some() => self.flush(false, false, &mut out)?,
                _ => {}
            }

            let timecode_ns = self.next_timecode(old_timecode);
            self.frames_output += 1;
            let payload = data[range].to_vec();

            match frame_type {
                FrameType::I => {
                    let frame = SlotFrame {
                        frame_type,
                        payload,
                        timecode_ns,
                        duration_ns: actual_duration,
                        own_bref: BackRef::None,
                    };
                    if self.bref_slot.is_none() {
                        out.push(self.emit_slot(&frame));
                        self.bref_slot = Some(frame);
                    } else {
                        self.fref_slot = Some(frame);
                    }
                }
                FrameType::P => {
                    let bref_tc = match &self.bref_slot {
                        Some(b) => b.timecode_ns,
                        None => return Err(MuxError::PFrameBeforeIFrame),
                    };
                    self.fref_slot = Some(SlotFrame {
                        frame_type,
                        payload,
                        timecode_ns,
                        duration_ns: actual_duration,
                        own_bref: BackRef::Absolute(bref_tc),
                    });
                }
                FrameType::B => {
                    self.bframes_seen = true;
                    self.queued_bs.push_back(SlotFrame {
                        frame_type,
                        payload,
                        timecode_ns,
                        duration_ns: actual_duration,
                        own_bref: BackRef::None,
                    });
                }
            }
        }
        Ok(out)
    }

    /// Drains whatever the slot machine is still holding at end of stream.
    pub fn flush_end_of_stream(&mut self) -> Result<Vec<Packet>, MuxError> {
        let mut out = Vec::new();
        self.flush(false, true, &mut out)?;
        Ok(out)
    }

    /// `flush_frames`: resolves the B frames queued behind `fref_slot` (if
    /// any) against both slots, then shifts the window forward one step.
    fn flush(&mut self, next_is_i: bool, flush_all: bool, out: &mut Vec<Packet>) -> Result<(), MuxError> {
        let Some(bref) = self.bref_slot.clone() else {
            if !self.queued_bs.is_empty() {
                log::warn!("mpeg4 reorderer: no I frame found but B frames queued; dropping a broken stream's B frames");
                self.queued_bs.clear();
            }
            return Ok(());
        };

        let Some(mut fref) = self.fref_slot.take() else {
            if !self.queued_bs.is_empty() {
                log::warn!(
                    "mpeg4 reorderer: B frames queued but only one reference frame found; \
                     stream may be in unsupported display order"
                );
                self.queued_bs.clear();
            }
            if flush_all {
                out.push(self.emit_slot(&bref));
                self.bref_slot = None;
            }
            return Ok(());
        };

        // B frames occupy the timeline slots between bref and fref; shift
        // fref's timecode out past them so the Bs can be interleaved at
        // their nominal spacing.
        let shift_ns = (self.queued_bs.len() as f64 * 1_000_000_000.0 / self.fps).round() as i64;
        fref.timecode_ns += shift_ns;

        out.push(self.emit_slot(&fref));
        for b in self.queued_bs.drain(..) {
            out.push(
                Packet::new(self.track_id, b.payload, b.timecode_ns, b.duration_ns)
                    .with_refs(BackRef::Absolute(bref.timecode_ns), ForwardRef::Absolute(fref.timecode_ns)),
            );
        }

        let shifted_type = fref.frame_type;
        self.bref_slot = Some(fref);
        if flush_all || (next_is_i && shifted_type == FrameType::P) {
            self.bref_slot = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vop(coding_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut v = vec![0x00, 0x00, 0x01, VOP_START_CODE, coding_type << 6];
        v.extend_from_slice(payload);
        v
    }

    #[test]
    fn leading_i_frame_is_emitted_immediately() {
        let mut r = Mpeg4Reorderer::new(1, 25.0);
        let packets = r.process(&vop(0, &[1, 2, 3]), None, None).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].bref, BackRef::None);
    }

    #[test]
    fn display_order_ibbp_reorders_to_decode_order() {
        let mut r = Mpeg4Reorderer::new(1, 25.0);
        let mut out = Vec::new();
        out.extend(r.process(&vop(0, &[0]), None, None).unwrap()); // I
        out.extend(r.process(&vop(2, &[1]), None, None).unwrap()); // B
        out.extend(r.process(&vop(2, &[2]), None, None).unwrap()); // B
        out.extend(r.process(&vop(1, &[3]), None, None).unwrap()); // P
        out.extend(r.flush_end_of_stream().unwrap());

        // I is emitted on arrival; P, then the two queued Bs, are emitted
        // once the flush rule fires on end of stream.
        assert_eq!(out.len(), 4);
        let i = &out[0];
        assert_eq!(i.bref, BackRef::None);
        let p = &out[1];
        assert_eq!(p.bref, BackRef::Absolute(i.timecode_ns));
        // P is the 4th frame processed (frames_output=3 when its raw
        // timecode is assigned), then shifted forward by the two queued Bs.
        let nominal = (1_000_000_000.0 / 25.0).round() as i64;
        assert_eq!(p.timecode_ns, i.timecode_ns + 3 * nominal + 2 * nominal);
        for b in &out[2..] {
            assert_eq!(b.bref, BackRef::Absolute(i.timecode_ns));
            assert_eq!(b.fref, ForwardRef::Absolute(p.timecode_ns));
        }
    }

    #[test]
    fn p_before_any_i_is_an_error() {
        let mut r = Mpeg4Reorderer::new(1, 25.0);
        let err = r.process(&vop(1, &[1]), None, None).unwrap_err();
        assert!(matches!(err, MuxError::PFrameBeforeIFrame));
    }

    #[test]
    fn orphan_b_with_no_reference_frames_is_dropped_not_fatal() {
        let mut r = Mpeg4Reorderer::new(1, 25.0);
        let out = r.process(&vop(2, &[1]), None, None).unwrap();
        assert!(out.is_empty());
        let out = r.flush_end_of_stream().unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn extract_par_reads_fixed_table_entry() {
        // VOL header: random_accessible_vol(1)=0, vot_indication(8)=0,
        // is_object_layer_identifier(1)=0, aspect_ratio_info(4)=3 (10:11).
        let mut bits: u32 = 0;
        let mut nbits = 0;
        let mut push = |val: u32, n: usize| {
            bits = (bits << n) | val;
            nbits += n;
        };
        push(0, 1);
        push(0, 8);
        push(0, 1);
        push(3, 4);
        // pad to a byte boundary
        let pad = (8 - nbits % 8) % 8;
        push(0, pad);
        nbits += pad;
        let byte_count = nbits / 8;
        let bytes: Vec<u8> = (0..byte_count)
            .map(|i| ((bits >> ((byte_count - 1 - i) * 8)) & 0xFF) as u8)
            .collect();

        let mut data = vec![0x00, 0x00, 0x01, 0x20];
        data.extend(bytes);
        assert_eq!(extract_par(&data), Some((10, 11)));
    }
}
