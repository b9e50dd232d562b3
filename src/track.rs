//! Track registry: per-track descriptors the cluster engine consults when
//! rendering blocks and cues. Adapted from the teacher's `Track`/`TrackType`
//! (`types.rs`), generalized from MP4 sample tables to Matroska cue policy.

/// What kind of media a track carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Video,
    Audio,
    Subtitle,
}

/// When to emit a `CueEntry` for a packet on this track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CueCreation {
    /// Only at key frames (`bref == None`).
    IFrames,
    /// At every frame.
    All,
    /// Never.
    None,
}

/// Static per-track metadata, registered once before muxing starts.
#[derive(Debug, Clone)]
pub struct TrackDescriptor {
    pub track_number: u64,
    pub codec_id: String,
    /// Default frame duration in nanoseconds, used to detect when a laced
    /// block group's duration needs to be written explicitly.
    pub default_duration_ns: u64,
    pub kind: TrackKind,
    pub cue_creation: CueCreation,
    /// Opaque codec private data (e.g. MPEG-4 VOL header), if any.
    pub codec_private: Option<Vec<u8>>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub display_width: Option<u32>,
    pub display_height: Option<u32>,
}

impl TrackDescriptor {
    pub fn video(track_number: u64, codec_id: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            track_number,
            codec_id: codec_id.into(),
            default_duration_ns: 0,
            kind: TrackKind::Video,
            cue_creation: CueCreation::IFrames,
            codec_private: None,
            width: Some(width),
            height: Some(height),
            display_width: None,
            display_height: None,
        }
    }

    pub fn audio(track_number: u64, codec_id: impl Into<String>) -> Self {
        Self {
            track_number,
            codec_id: codec_id.into(),
            default_duration_ns: 0,
            kind: TrackKind::Audio,
            cue_creation: CueCreation::None,
            codec_private: None,
            width: None,
            height: None,
            display_width: None,
            display_height: None,
        }
    }
}

/// Holds every track registered with the muxer, keyed by track number.
#[derive(Debug, Default, Clone)]
pub struct TrackRegistry {
    tracks: Vec<TrackDescriptor>,
}

impl TrackRegistry {
    pub fn new() -> Self {
        Self { tracks: Vec::new() }
    }

    pub fn register(&mut self, track: TrackDescriptor) {
        self.tracks.push(track);
    }

    pub fn get(&self, track_number: u64) -> Option<&TrackDescriptor> {
        self.tracks.iter().find(|t| t.track_number == track_number)
    }

    pub fn get_mut(&mut self, track_number: u64) -> Option<&mut TrackDescriptor> {
        self.tracks.iter_mut().find(|t| t.track_number == track_number)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackDescriptor> {
        self.tracks.iter()
    }

    /// Whether any registered track is a video track; used by the split
    /// planner to decide which track governs split candidates.
    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind == TrackKind::Video)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_looks_up_by_track_number() {
        let mut reg = TrackRegistry::new();
        reg.register(TrackDescriptor::video(1, "V_MPEG1", 352, 288));
        reg.register(TrackDescriptor::audio(2, "A_AAC"));

        assert_eq!(reg.get(1).unwrap().kind, TrackKind::Video);
        assert_eq!(reg.get(2).unwrap().kind, TrackKind::Audio);
        assert!(reg.get(3).is_none());
        assert!(reg.has_video());
    }
}
