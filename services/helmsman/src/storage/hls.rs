//! HLS playlist parsing and incremental EVENT manifest building.
//!
//! Freezes and defrosts never publish a manifest that references a segment
//! which has not finished transferring: the manifest is rebuilt as an
//! append-only EVENT playlist and re-uploaded (or re-written locally) after
//! every segment, then finalized with `#EXT-X-ENDLIST`.

use super::StorageError;

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// One segment reference, in manifest order.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRef {
    /// URI as listed, e.g. `segments/12_0.ts`.
    pub uri: String,
    pub duration: f32,
}

impl SegmentRef {
    /// Bare file name without the `segments/` prefix.
    pub fn file_name(&self) -> &str {
        self.uri.rsplit('/').next().unwrap_or(&self.uri)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedManifest {
    pub target_duration: u64,
    pub segments: Vec<SegmentRef>,
    /// Whether the playlist carried `#EXT-X-ENDLIST`.
    pub ended: bool,
}

/// Parse a media playlist.
pub fn parse_media_manifest(text: &str) -> Result<ParsedManifest, StorageError> {
    match m3u8_rs::parse_media_playlist_res(text.as_bytes()) {
        Ok(playlist) => Ok(ParsedManifest {
            target_duration: playlist.target_duration,
            segments: playlist
                .segments
                .iter()
                .map(|s| SegmentRef {
                    uri: s.uri.clone(),
                    duration: s.duration,
                })
                .collect(),
            ended: playlist.end_list,
        }),
        Err(e) => Err(StorageError::Manifest(format!("playlist parse: {e:?}"))),
    }
}

// ---------------------------------------------------------------------------
// Incremental EVENT manifest
// ---------------------------------------------------------------------------

/// Append-only EVENT playlist buffer.
///
/// Starts without `#EXT-X-ENDLIST` so partial playback works while later
/// segments are still in flight.
#[derive(Debug, Clone)]
pub struct EventManifest {
    buffer: String,
    finalized: bool,
}

impl EventManifest {
    pub fn new(target_duration: u64) -> Self {
        let buffer = format!(
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-PLAYLIST-TYPE:EVENT\n#EXT-X-TARGETDURATION:{target_duration}\n#EXT-X-MEDIA-SEQUENCE:0\n"
        );
        EventManifest {
            buffer,
            finalized: false,
        }
    }

    /// Append one segment entry. The URI should be the path players use,
    /// e.g. `segments/12_0.ts`.
    pub fn append_segment(&mut self, duration: f32, uri: &str) {
        debug_assert!(!self.finalized, "append after finalize");
        self.buffer
            .push_str(&format!("#EXTINF:{duration:.3},\n{uri}\n"));
    }

    /// Seal the playlist with `#EXT-X-ENDLIST`. Idempotent.
    pub fn finalize(&mut self) {
        if !self.finalized {
            self.buffer.push_str("#EXT-X-ENDLIST\n");
            self.finalized = true;
        }
    }

    pub fn as_str(&self) -> &str {
        &self.buffer
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }
}
