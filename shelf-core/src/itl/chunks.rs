//! Chunk framing and the decoded chunk types: `htim` tracks, `hohm`
//! strings, `hpim` playlists, `hptm` playlist items (spec.md §4.3, §6.2).
//!
//! Every decoded chunk keeps its *entire* on-disk byte buffer and exposes
//! typed accessors/mutators that read and write fixed offsets within it
//! (spec.md §9 "Opaque-span preservation"): a field the codec doesn't know
//! about is never touched because it's never read out of the buffer in
//! the first place.

use super::strings::{decode_string, encode_string, StringEncoding};
use super::ItlError;

pub const TAG_TRACK: &[u8; 4] = b"htim";
pub const TAG_STRING: &[u8; 4] = b"hohm";
pub const TAG_PLAYLIST: &[u8; 4] = b"hpim";
pub const TAG_PLAYLIST_ITEM: &[u8; 4] = b"hptm";

pub const FIELD_TITLE: u32 = 0x02;
pub const FIELD_ALBUM: u32 = 0x03;
pub const FIELD_ARTIST: u32 = 0x04;
pub const FIELD_GENRE: u32 = 0x05;
pub const FIELD_KIND: u32 = 0x06;
pub const FIELD_LOCATION: u32 = 0x0D;
pub const FIELD_PLAYLIST_TITLE: u32 = 0x64;

const TRACK_CHUNK_LEN: usize = 156;
const PLAYLIST_CHUNK_LEN: usize = 32;
const PLAYLIST_ITEM_CHUNK_LEN: usize = 28;
const STRING_CHUNK_HEADER_LEN: usize = 40;

fn be_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

fn put_be_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

/// A parsed/constructed item in the inner-payload chunk sequence. Unknown
/// tags stay `Raw` -- their bytes are captured once and re-emitted
/// unchanged (spec.md §4.3 "Chunk framing": "Unknown chunks are skipped by
/// advancing recordLen bytes; their bytes are captured as an opaque span").
#[derive(Debug, Clone)]
pub enum ItlItem {
    Track(TrackChunk),
    StringField(StringChunk),
    Playlist(PlaylistChunk),
    PlaylistItem(PlaylistItemChunk),
    Raw(Vec<u8>),
}

impl ItlItem {
    /// The bytes this item currently serialises to.
    pub fn bytes(&self) -> &[u8] {
        match self {
            ItlItem::Track(c) => &c.buf,
            ItlItem::StringField(c) => &c.buf,
            ItlItem::Playlist(c) => &c.buf,
            ItlItem::PlaylistItem(c) => &c.buf,
            ItlItem::Raw(buf) => buf,
        }
    }
}

/// A `156`-byte `htim` track chunk (spec.md §4.3 "Tracks").
#[derive(Debug, Clone)]
pub struct TrackChunk {
    buf: Vec<u8>,
}

impl TrackChunk {
    pub fn track_id(&self) -> u32 {
        be_u32(&self.buf, 16)
    }

    pub fn set_track_id(&mut self, value: u32) {
        put_be_u32(&mut self.buf, 16, value);
    }

    pub fn size(&self) -> u32 {
        be_u32(&self.buf, 36)
    }

    pub fn set_size(&mut self, value: u32) {
        put_be_u32(&mut self.buf, 36, value);
    }

    pub fn total_time_ms(&self) -> u32 {
        be_u32(&self.buf, 40)
    }

    pub fn set_total_time_ms(&mut self, value: u32) {
        put_be_u32(&mut self.buf, 40, value);
    }

    pub fn track_number(&self) -> u32 {
        be_u32(&self.buf, 44)
    }

    pub fn set_track_number(&mut self, value: u32) {
        put_be_u32(&mut self.buf, 44, value);
    }

    pub fn year(&self) -> u16 {
        u16::from_be_bytes(self.buf[54..56].try_into().unwrap())
    }

    pub fn set_year(&mut self, value: u16) {
        self.buf[54..56].copy_from_slice(&value.to_be_bytes());
    }

    pub fn play_count(&self) -> u32 {
        be_u32(&self.buf, 76)
    }

    pub fn set_play_count(&mut self, value: u32) {
        put_be_u32(&mut self.buf, 76, value);
    }

    pub fn disc_number(&self) -> u8 {
        self.buf[104]
    }

    pub fn set_disc_number(&mut self, value: u8) {
        self.buf[104] = value;
    }

    pub fn rating(&self) -> u8 {
        self.buf[108]
    }

    pub fn set_rating(&mut self, value: u8) {
        self.buf[108] = value;
    }

    pub fn persistent_id(&self) -> u64 {
        u64::from_be_bytes(self.buf[128..136].try_into().unwrap())
    }

    pub fn set_persistent_id(&mut self, value: u64) {
        self.buf[128..136].copy_from_slice(&value.to_be_bytes());
    }

    pub fn new_blank(track_id: u32, persistent_id: u64) -> Self {
        let mut buf = vec![0u8; TRACK_CHUNK_LEN];
        buf[0..4].copy_from_slice(TAG_TRACK);
        put_be_u32(&mut buf, 4, TRACK_CHUNK_LEN as u32);
        put_be_u32(&mut buf, 8, TRACK_CHUNK_LEN as u32);
        let mut chunk = TrackChunk { buf };
        chunk.set_track_id(track_id);
        chunk.set_persistent_id(persistent_id);
        chunk
    }

    fn decode(buf: &[u8]) -> Result<Self, ItlError> {
        if buf.len() != TRACK_CHUNK_LEN {
            return Err(ItlError::Malformed(format!(
                "htim chunk has length {}, expected {TRACK_CHUNK_LEN}",
                buf.len()
            )));
        }
        Ok(TrackChunk { buf: buf.to_vec() })
    }
}

/// A `hohm` string chunk (spec.md §4.3 "Strings").
#[derive(Debug, Clone)]
pub struct StringChunk {
    buf: Vec<u8>,
}

impl StringChunk {
    pub fn field_type(&self) -> u32 {
        be_u32(&self.buf, 12)
    }

    pub fn value(&self) -> Result<String, ItlError> {
        let encoding = StringEncoding::from_flag(self.buf[27])?;
        decode_string(encoding, &self.buf[STRING_CHUNK_HEADER_LEN..])
    }

    /// Replaces the string value, re-encoding per spec.md §4.3 ("the codec
    /// picks flag 3 when every rune fits Windows-1252, otherwise flag 1")
    /// and refreshing the length field and this chunk's own record length.
    pub fn set_value(&mut self, value: &str) {
        let (encoding, bytes) = encode_string(value);
        self.buf[27] = encoding.flag();
        put_be_u32(&mut self.buf, 28, bytes.len() as u32);
        self.buf.truncate(STRING_CHUNK_HEADER_LEN);
        self.buf.extend_from_slice(&bytes);
        let total_len = self.buf.len() as u32;
        put_be_u32(&mut self.buf, 8, total_len);
    }

    pub fn new_for_field(field_type: u32, value: &str) -> Self {
        let mut buf = vec![0u8; STRING_CHUNK_HEADER_LEN];
        buf[0..4].copy_from_slice(TAG_STRING);
        put_be_u32(&mut buf, 4, STRING_CHUNK_HEADER_LEN as u32);
        put_be_u32(&mut buf, 12, field_type);
        let mut chunk = StringChunk { buf };
        chunk.set_value(value);
        chunk
    }

    fn decode(buf: &[u8]) -> Result<Self, ItlError> {
        if buf.len() < STRING_CHUNK_HEADER_LEN {
            return Err(ItlError::Malformed("hohm chunk shorter than its fixed header".into()));
        }
        let declared_len = be_u32(buf, 28) as usize;
        if STRING_CHUNK_HEADER_LEN + declared_len != buf.len() {
            return Err(ItlError::Malformed("hohm declared string length does not match chunk size".into()));
        }
        // Validate the encoding flag and string bytes eagerly so a
        // malformed flag surfaces at parse time, not on first access.
        let encoding = StringEncoding::from_flag(buf[27])?;
        decode_string(encoding, &buf[STRING_CHUNK_HEADER_LEN..])?;
        Ok(StringChunk { buf: buf.to_vec() })
    }
}

/// A `hpim` playlist chunk (spec.md §4.3 "Playlists").
#[derive(Debug, Clone)]
pub struct PlaylistChunk {
    buf: Vec<u8>,
}

impl PlaylistChunk {
    pub fn item_count(&self) -> u32 {
        be_u32(&self.buf, 16)
    }

    pub fn set_item_count(&mut self, value: u32) {
        put_be_u32(&mut self.buf, 16, value);
    }

    pub fn persistent_id(&self) -> u64 {
        u64::from_be_bytes(self.buf[20..28].try_into().unwrap())
    }

    pub fn set_persistent_id(&mut self, value: u64) {
        self.buf[20..28].copy_from_slice(&value.to_be_bytes());
    }

    pub fn new_blank(persistent_id: u64) -> Self {
        let mut buf = vec![0u8; PLAYLIST_CHUNK_LEN];
        buf[0..4].copy_from_slice(TAG_PLAYLIST);
        put_be_u32(&mut buf, 4, PLAYLIST_CHUNK_LEN as u32);
        put_be_u32(&mut buf, 8, PLAYLIST_CHUNK_LEN as u32);
        let mut chunk = PlaylistChunk { buf };
        chunk.set_persistent_id(persistent_id);
        chunk
    }

    fn decode(buf: &[u8]) -> Result<Self, ItlError> {
        if buf.len() != PLAYLIST_CHUNK_LEN {
            return Err(ItlError::Malformed(format!(
                "hpim chunk has length {}, expected {PLAYLIST_CHUNK_LEN}",
                buf.len()
            )));
        }
        Ok(PlaylistChunk { buf: buf.to_vec() })
    }
}

/// A `hptm` playlist-item chunk (spec.md §4.3 "Playlists").
#[derive(Debug, Clone)]
pub struct PlaylistItemChunk {
    buf: Vec<u8>,
}

impl PlaylistItemChunk {
    pub fn track_id(&self) -> u32 {
        be_u32(&self.buf, 24)
    }

    pub fn new_for_track(track_id: u32) -> Self {
        let mut buf = vec![0u8; PLAYLIST_ITEM_CHUNK_LEN];
        buf[0..4].copy_from_slice(TAG_PLAYLIST_ITEM);
        put_be_u32(&mut buf, 4, PLAYLIST_ITEM_CHUNK_LEN as u32);
        put_be_u32(&mut buf, 8, PLAYLIST_ITEM_CHUNK_LEN as u32);
        put_be_u32(&mut buf, 24, track_id);
        PlaylistItemChunk { buf }
    }

    fn decode(buf: &[u8]) -> Result<Self, ItlError> {
        if buf.len() != PLAYLIST_ITEM_CHUNK_LEN {
            return Err(ItlError::Malformed(format!(
                "hptm chunk has length {}, expected {PLAYLIST_ITEM_CHUNK_LEN}",
                buf.len()
            )));
        }
        Ok(PlaylistItemChunk { buf: buf.to_vec() })
    }
}

/// Parses the flat chunk sequence that makes up the inner payload (spec.md
/// §4.3 "Chunk framing"). Every chunk is tag(4)+header_len(4)+record_len(4)
/// followed by `record_len - 12` more bytes; `record_len` covers the whole
/// chunk including this 12-byte frame.
pub fn parse_chunks(buf: &[u8]) -> Result<Vec<ItlItem>, ItlError> {
    let mut items = Vec::new();
    let mut pos = 0usize;
    while pos < buf.len() {
        if pos + 12 > buf.len() {
            return Err(ItlError::Malformed("trailing bytes too short for a chunk frame".into()));
        }
        let tag: [u8; 4] = buf[pos..pos + 4].try_into().unwrap();
        let record_len = be_u32(buf, pos + 8) as usize;
        if record_len < 12 {
            return Err(ItlError::Malformed("chunk record_len shorter than its own frame".into()));
        }
        if pos + record_len > buf.len() {
            return Err(ItlError::Malformed("chunk length exceeds remaining bytes".into()));
        }
        let chunk_bytes = &buf[pos..pos + record_len];
        let item = match &tag {
            t if t == TAG_TRACK => ItlItem::Track(TrackChunk::decode(chunk_bytes)?),
            t if t == TAG_STRING => ItlItem::StringField(StringChunk::decode(chunk_bytes)?),
            t if t == TAG_PLAYLIST => ItlItem::Playlist(PlaylistChunk::decode(chunk_bytes)?),
            t if t == TAG_PLAYLIST_ITEM => ItlItem::PlaylistItem(PlaylistItemChunk::decode(chunk_bytes)?),
            _ => ItlItem::Raw(chunk_bytes.to_vec()),
        };
        items.push(item);
        pos += record_len;
    }
    Ok(items)
}

/// Re-serialises the chunk sequence, concatenating each item's current
/// byte buffer in order (spec.md §4.3 "Mutation model": untouched/`Raw`
/// items are emitted unchanged; decoded items carry whatever refreshed
/// lengths their setters already wrote).
pub fn emit_chunks(items: &[ItlItem]) -> Vec<u8> {
    let total: usize = items.iter().map(|i| i.bytes().len()).sum();
    let mut out = Vec::with_capacity(total);
    for item in items {
        out.extend_from_slice(item.bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_field_accessors_round_trip() {
        let mut track = TrackChunk::new_blank(42, 0x0102030405060708);
        track.set_size(123_456);
        track.set_total_time_ms(7_200_000);
        track.set_track_number(3);
        track.set_year(2024);
        track.set_play_count(5);
        track.set_disc_number(1);
        track.set_rating(80);

        let decoded = TrackChunk::decode(&track.buf).unwrap();
        assert_eq!(decoded.track_id(), 42);
        assert_eq!(decoded.persistent_id(), 0x0102030405060708);
        assert_eq!(decoded.size(), 123_456);
        assert_eq!(decoded.total_time_ms(), 7_200_000);
        assert_eq!(decoded.track_number(), 3);
        assert_eq!(decoded.year(), 2024);
        assert_eq!(decoded.play_count(), 5);
        assert_eq!(decoded.disc_number(), 1);
        assert_eq!(decoded.rating(), 80);
    }

    #[test]
    fn string_chunk_set_value_updates_length_and_record_len() {
        let mut chunk = StringChunk::new_for_field(FIELD_LOCATION, "/music/a.mp3");
        assert_eq!(chunk.value().unwrap(), "/music/a.mp3");
        chunk.set_value("/music/a much longer destination path.mp3");
        assert_eq!(chunk.value().unwrap(), "/music/a much longer destination path.mp3");
        let record_len = be_u32(&chunk.buf, 8) as usize;
        assert_eq!(record_len, chunk.buf.len());
    }

    #[test]
    fn parse_chunks_round_trips_mixed_sequence() {
        let track = TrackChunk::new_blank(1, 7);
        let title = StringChunk::new_for_field(FIELD_TITLE, "Dune");
        let raw = ItlItem::Raw(b"unkn\x00\x00\x00\x10\x00\x00\x00\x10????????".to_vec());

        let items = vec![ItlItem::Track(track), ItlItem::StringField(title), raw];
        let bytes = emit_chunks(&items);
        let reparsed = parse_chunks(&bytes).unwrap();
        assert_eq!(reparsed.len(), 3);
        assert!(matches!(reparsed[0], ItlItem::Track(_)));
        assert!(matches!(reparsed[1], ItlItem::StringField(_)));
        assert!(matches!(reparsed[2], ItlItem::Raw(_)));
    }

    #[test]
    fn chunk_length_exceeding_remaining_bytes_is_malformed() {
        let mut bytes = vec![0u8; 20];
        bytes[0..4].copy_from_slice(b"htim");
        bytes[8..12].copy_from_slice(&9999u32.to_be_bytes());
        assert!(parse_chunks(&bytes).is_err());
    }
}
