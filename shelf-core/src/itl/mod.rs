//! Bit-exact iTunes Library (`.itl`) binary codec (spec.md §4.3, §6.2).
//!
//! The on-disk shape is `hdfm` header || encrypted body, where the body
//! decrypts to an optionally zlib-compressed sequence of chunks. Every
//! chunk the codec doesn't recognise is preserved as an opaque [`chunks::ItlItem::Raw`]
//! span (spec.md §9 "Opaque-span preservation") so round-tripping a file
//! this codec has never seen still reproduces it byte-for-byte.
//!
//! Tracks and playlists are not separate top-level containers: spec.md
//! §4.3 names only the chunk tags (`htim`, `hohm`, `hpim`, `hptm`, "and
//! many others") and says nothing about a nested record wrapper, so this
//! codec keeps a single flat `Vec<ItlItem>` as the source of truth and
//! derives track/playlist *views* by scanning forward from an `htim`/
//! `hpim` item through its immediately following run of `hohm`/`hptm`
//! siblings. That is the only grouping rule spec.md's text actually
//! supports (see DESIGN.md, "ITL chunk nesting").

mod chunks;
mod crypto;
mod header;
mod strings;

pub use chunks::{
    ItlItem, PlaylistChunk, PlaylistItemChunk, StringChunk, TrackChunk, FIELD_ALBUM, FIELD_ARTIST,
    FIELD_GENRE, FIELD_KIND, FIELD_LOCATION, FIELD_PLAYLIST_TITLE, FIELD_TITLE,
};
pub use header::ItlHeader;
pub use strings::StringEncoding;

use std::path::Path;

use chacha20poly1305::aead::{rand_core::RngCore, OsRng};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ItlError {
    #[error("malformed ITL file: {0}")]
    Malformed(String),
    #[error("I/O error reading or writing an ITL file: {0}")]
    Io(#[from] std::io::Error),
    #[error("ITL encryption error: {0}")]
    Crypto(String),
}

/// A parsed in-memory iTunes library, ready for inspection or mutation.
pub struct ItlLibrary {
    pub header: ItlHeader,
    pub items: Vec<ItlItem>,
    /// Whether the inner payload was zlib-compressed when parsed; `emit`
    /// re-compresses only if it was originally compressed (spec.md §4.3
    /// "Compression is optional; the codec preserves whichever state the
    /// input file was in").
    pub(crate) compressed: bool,
}

/// A read-only view over one track: its `htim` chunk plus whichever
/// `hohm` string fields immediately follow it before the next `htim`/
/// `hpim` (the adjacency rule described in the module doc comment).
pub struct TrackView<'a> {
    pub track: &'a TrackChunk,
    pub fields: Vec<&'a StringChunk>,
}

impl<'a> TrackView<'a> {
    pub fn field(&self, field_type: u32) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.field_type() == field_type)
            .and_then(|f| f.value().ok())
    }

    pub fn title(&self) -> Option<&str> {
        self.field(FIELD_TITLE)
    }

    pub fn location(&self) -> Option<&str> {
        self.field(FIELD_LOCATION)
    }
}

/// A read-only view over one playlist: its `hpim` chunk, trailing
/// `hohm` title field(s), and trailing `hptm` membership entries.
pub struct PlaylistView<'a> {
    pub playlist: &'a PlaylistChunk,
    pub fields: Vec<&'a StringChunk>,
    pub items: Vec<&'a PlaylistItemChunk>,
}

impl<'a> PlaylistView<'a> {
    pub fn title(&self) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.field_type() == FIELD_PLAYLIST_TITLE)
            .and_then(|f| f.value().ok())
    }

    pub fn track_ids(&self) -> Vec<u32> {
        self.items.iter().map(|i| i.track_id()).collect()
    }
}

/// Fields for a track inserted by [`ItlLibrary::insert_track`].
pub struct NewTrack {
    pub title: String,
    pub album: Option<String>,
    pub artist: Option<String>,
    pub genre: Option<String>,
    pub kind: Option<String>,
    pub location: String,
    pub size: u32,
    pub total_time_ms: u32,
    pub track_number: u32,
    pub year: u16,
    pub disc_number: u8,
}

fn random_persistent_id() -> u64 {
    let mut bytes = [0u8; 8];
    OsRng.fill_bytes(&mut bytes);
    u64::from_be_bytes(bytes)
}

/// Derives a playlist's persistent id deterministically from its title
/// (spec.md §4.3 "Playlists": "a deterministic persistent id derived from
/// the playlist title when emitted"), so re-inserting a playlist with the
/// same title always yields the same id instead of a fresh random one.
fn persistent_id_for_title(title: &str) -> u64 {
    let digest = Sha256::digest(title.as_bytes());
    u64::from_be_bytes(digest[0..8].try_into().unwrap())
}

impl ItlLibrary {
    /// Parses a complete `.itl` file (spec.md §4.3 "Parse sequence": header
    /// → decrypt → optional inflate → chunk sequence).
    pub fn parse(bytes: &[u8]) -> Result<Self, ItlError> {
        let (header, header_len) = ItlHeader::parse(bytes)?;
        let body = &bytes[header_len..];
        let decrypted = crypto::decrypt(&header.app_version, body)?;
        let unpadded = crypto::pkcs7_unpad(&decrypted)?;
        let compressed = crypto::looks_compressed(unpadded);
        let payload = if compressed {
            crypto::inflate(unpadded)?
        } else {
            unpadded.to_vec()
        };
        let items = chunks::parse_chunks(&payload)?;
        Ok(ItlLibrary { header, items, compressed })
    }

    /// Reads and parses a `.itl` file from disk.
    pub fn open(path: &Path) -> Result<Self, ItlError> {
        let bytes = std::fs::read(path)?;
        Self::parse(&bytes)
    }

    /// Re-serialises the library (spec.md §4.3 "Emit sequence": chunks →
    /// optional deflate → PKCS#7 pad → encrypt → header with recomputed
    /// total length).
    pub fn emit(&self) -> Vec<u8> {
        let payload = chunks::emit_chunks(&self.items);
        let inner = if self.compressed { crypto::deflate(&payload) } else { payload };
        let padded = crypto::pkcs7_pad(&inner);
        let body = crypto::encrypt(&self.header.app_version, &padded);

        let total_len = (self.header.encoded_len() + body.len()) as u32;
        let mut out = self.header.emit(total_len);
        out.extend_from_slice(&body);
        out
    }

    /// Writes the library to `path` atomically: encode to a sibling temp
    /// file, then rename over the destination (spec.md §6.2 "Writes are
    /// atomic: the codec never leaves a half-written `.itl` file").
    pub fn save(&self, path: &Path) -> Result<(), ItlError> {
        let bytes = self.emit();
        let tmp_path = path.with_extension("itl.tmp");
        std::fs::write(&tmp_path, &bytes)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Groups the flat item sequence into `(htim, trailing hohm run)`
    /// pairs, in file order.
    pub fn tracks(&self) -> Vec<TrackView<'_>> {
        let mut views = Vec::new();
        let mut i = 0;
        while i < self.items.len() {
            if let ItlItem::Track(track) = &self.items[i] {
                let mut fields = Vec::new();
                let mut j = i + 1;
                while let Some(ItlItem::StringField(s)) = self.items.get(j) {
                    fields.push(s);
                    j += 1;
                }
                views.push(TrackView { track, fields });
                i = j;
            } else {
                i += 1;
            }
        }
        views
    }

    /// Groups the flat item sequence into `(hpim, trailing hohm/hptm run)`
    /// triples, in file order.
    pub fn playlists(&self) -> Vec<PlaylistView<'_>> {
        let mut views = Vec::new();
        let mut i = 0;
        while i < self.items.len() {
            if let ItlItem::Playlist(playlist) = &self.items[i] {
                let mut fields = Vec::new();
                let mut items = Vec::new();
                let mut j = i + 1;
                loop {
                    match self.items.get(j) {
                        Some(ItlItem::StringField(s)) => {
                            fields.push(s);
                            j += 1;
                        }
                        Some(ItlItem::PlaylistItem(p)) => {
                            items.push(p);
                            j += 1;
                        }
                        _ => break,
                    }
                }
                views.push(PlaylistView { playlist, fields, items });
                i = j;
            } else {
                i += 1;
            }
        }
        views
    }

    fn next_track_id(&self) -> u32 {
        self.items
            .iter()
            .filter_map(|i| match i {
                ItlItem::Track(t) => Some(t.track_id()),
                _ => None,
            })
            .max()
            .map(|id| id + 1)
            .unwrap_or(1)
    }

    fn track_index_by_id(&self, track_id: u32) -> Option<usize> {
        self.items.iter().position(|i| matches!(i, ItlItem::Track(t) if t.track_id() == track_id))
    }

    /// Rewrites the `location` field of the track identified by
    /// `track_id` (spec.md §4.3 "Mutation model": "location rewrites
    /// update only the matching `hohm` field value and its own length").
    /// Returns an error if no such track exists.
    pub fn update_location(&mut self, track_id: u32, new_location: &str) -> Result<(), ItlError> {
        let idx = self
            .track_index_by_id(track_id)
            .ok_or_else(|| ItlError::Malformed(format!("no track with id {track_id}")))?;
        let mut j = idx + 1;
        while let Some(ItlItem::StringField(s)) = self.items.get_mut(j) {
            if s.field_type() == FIELD_LOCATION {
                s.set_value(new_location);
                return Ok(());
            }
            j += 1;
        }
        // No existing location field on this track: append one right
        // after the track chunk's trailing field run.
        self.items.insert(j, ItlItem::StringField(StringChunk::new_for_field(FIELD_LOCATION, new_location)));
        Ok(())
    }

    /// Appends a new track (and its string fields) at the end of the item
    /// sequence, allocating a fresh `track_id` and `persistent_id`.
    /// Returns the allocated `track_id`.
    pub fn insert_track(&mut self, new_track: NewTrack) -> u32 {
        let track_id = self.next_track_id();
        let persistent_id = random_persistent_id();
        let mut track = TrackChunk::new_blank(track_id, persistent_id);
        track.set_size(new_track.size);
        track.set_total_time_ms(new_track.total_time_ms);
        track.set_track_number(new_track.track_number);
        track.set_year(new_track.year);
        track.set_disc_number(new_track.disc_number);

        self.items.push(ItlItem::Track(track));
        self.items.push(ItlItem::StringField(StringChunk::new_for_field(FIELD_TITLE, &new_track.title)));
        if let Some(album) = &new_track.album {
            self.items.push(ItlItem::StringField(StringChunk::new_for_field(FIELD_ALBUM, album)));
        }
        if let Some(artist) = &new_track.artist {
            self.items.push(ItlItem::StringField(StringChunk::new_for_field(FIELD_ARTIST, artist)));
        }
        if let Some(genre) = &new_track.genre {
            self.items.push(ItlItem::StringField(StringChunk::new_for_field(FIELD_GENRE, genre)));
        }
        if let Some(kind) = &new_track.kind {
            self.items.push(ItlItem::StringField(StringChunk::new_for_field(FIELD_KIND, kind)));
        }
        self.items.push(ItlItem::StringField(StringChunk::new_for_field(FIELD_LOCATION, &new_track.location)));
        track_id
    }

    /// Appends a new playlist containing `track_ids`, allocating a fresh
    /// `persistent_id`. Returns an error if any referenced track id does
    /// not exist (spec.md §4.3 "Invariants": "every `hptm` track_id
    /// references an existing `htim` chunk").
    pub fn insert_playlist(&mut self, title: &str, track_ids: &[u32]) -> Result<(), ItlError> {
        for &id in track_ids {
            if self.track_index_by_id(id).is_none() {
                return Err(ItlError::Malformed(format!("playlist references unknown track id {id}")));
            }
        }
        let persistent_id = persistent_id_for_title(title);
        let mut playlist = PlaylistChunk::new_blank(persistent_id);
        playlist.set_item_count(track_ids.len() as u32);
        self.items.push(ItlItem::Playlist(playlist));
        self.items.push(ItlItem::StringField(StringChunk::new_for_field(FIELD_PLAYLIST_TITLE, title)));
        for &id in track_ids {
            self.items.push(ItlItem::PlaylistItem(PlaylistItemChunk::new_for_track(id)));
        }
        Ok(())
    }

    /// Removes the playlist titled `title`, if one exists, along with its
    /// trailing `hohm` title field and `hptm` membership entries. Returns
    /// `true` if a playlist was removed. Used before re-inserting a playlist
    /// under the same title so re-syncing doesn't accumulate duplicates
    /// (spec.md §4.9 "Write-back": "playlist creation via `InsertPlaylist`").
    pub fn remove_playlist_by_title(&mut self, title: &str) -> bool {
        let mut i = 0;
        while i < self.items.len() {
            if let ItlItem::Playlist(_) = &self.items[i] {
                let mut j = i + 1;
                let mut matches_title = false;
                loop {
                    match self.items.get(j) {
                        Some(ItlItem::StringField(s)) => {
                            if s.field_type() == FIELD_PLAYLIST_TITLE && s.value().ok() == Some(title) {
                                matches_title = true;
                            }
                            j += 1;
                        }
                        Some(ItlItem::PlaylistItem(_)) => j += 1,
                        _ => break,
                    }
                }
                if matches_title {
                    self.items.drain(i..j);
                    return true;
                }
                i = j;
            } else {
                i += 1;
            }
        }
        false
    }

    /// Rewrites the file extension suffix of every track's `location`
    /// field from `from_ext` to `to_ext` (spec.md §4.3 "Bulk rewrite
    /// operations": used after a transcode pass changes container
    /// format). Matching is case-insensitive; non-matching locations are
    /// left untouched.
    pub fn rewrite_extensions(&mut self, from_ext: &str, to_ext: &str) -> usize {
        let from_suffix = format!(".{}", from_ext.trim_start_matches('.'));
        let to_suffix = format!(".{}", to_ext.trim_start_matches('.'));
        let mut rewritten = 0;
        for item in &mut self.items {
            if let ItlItem::StringField(s) = item {
                if s.field_type() != FIELD_LOCATION {
                    continue;
                }
                if let Ok(location) = s.value() {
                    if location.to_lowercase().ends_with(&from_suffix.to_lowercase()) {
                        let new_location = format!("{}{}", &location[..location.len() - from_suffix.len()], to_suffix);
                        s.set_value(&new_location);
                        rewritten += 1;
                    }
                }
            }
        }
        rewritten
    }

    /// Validates structural invariants beyond "parses without error"
    /// (spec.md §4.3 "Invariants"): every playlist's track references
    /// resolve, and no two tracks share a `track_id`.
    pub fn validate(&self) -> Result<(), ItlError> {
        let mut seen_track_ids = std::collections::HashSet::new();
        for view in self.tracks() {
            let id = view.track.track_id();
            if !seen_track_ids.insert(id) {
                return Err(ItlError::Malformed(format!("duplicate track_id {id}")));
            }
        }
        for playlist in self.playlists() {
            for id in playlist.track_ids() {
                if !seen_track_ids.contains(&id) {
                    return Err(ItlError::Malformed(format!(
                        "playlist references unknown track id {id}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Opens the `.itl` file at `path`, applies `mutate`, and atomically
/// rewrites it in place. This is the shape every external-facing
/// operation (`update_locations`, `insert_tracks`, ...) in
/// [`crate::itunes_sync`] is built on.
pub fn with_library<F>(path: &Path, mutate: F) -> Result<(), ItlError>
where
    F: FnOnce(&mut ItlLibrary) -> Result<(), ItlError>,
{
    let mut library = ItlLibrary::open(path)?;
    mutate(&mut library)?;
    library.save(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_library() -> ItlLibrary {
        let header = ItlHeader {
            reserved: [0; 4],
            app_version: "12.9.5.5".to_string(),
            remainder: Vec::new(),
        };
        let mut lib = ItlLibrary { header, items: Vec::new(), compressed: true };
        lib.insert_track(NewTrack {
            title: "The Hobbit".into(),
            album: Some("The Hobbit".into()),
            artist: Some("J.R.R. Tolkien".into()),
            genre: Some("Fantasy".into()),
            kind: Some("MPEG audio file".into()),
            location: "/library/hobbit/hobbit.mp3".into(),
            size: 1024,
            total_time_ms: 3_600_000,
            track_number: 1,
            year: 1937,
            disc_number: 1,
        });
        lib
    }

    #[test]
    fn round_trips_through_emit_and_parse() {
        let lib = sample_library();
        let bytes = lib.emit();
        let reparsed = ItlLibrary::parse(&bytes).unwrap();
        assert_eq!(reparsed.tracks().len(), 1);
        let track = &reparsed.tracks()[0];
        assert_eq!(track.title(), Some("The Hobbit"));
        assert_eq!(track.location(), Some("/library/hobbit/hobbit.mp3"));
    }

    #[test]
    fn update_location_changes_only_that_track() {
        let mut lib = sample_library();
        let track_id = lib.tracks()[0].track.track_id();
        lib.update_location(track_id, "/library/hobbit/hobbit.m4b").unwrap();
        assert_eq!(lib.tracks()[0].location(), Some("/library/hobbit/hobbit.m4b"));
    }

    #[test]
    fn update_location_on_missing_track_errors() {
        let mut lib = sample_library();
        assert!(lib.update_location(9999, "/x").is_err());
    }

    #[test]
    fn insert_playlist_references_existing_tracks() {
        let mut lib = sample_library();
        let track_id = lib.tracks()[0].track.track_id();
        lib.insert_playlist("Fantasy Favorites", &[track_id]).unwrap();
        let playlists = lib.playlists();
        assert_eq!(playlists.len(), 1);
        assert_eq!(playlists[0].title(), Some("Fantasy Favorites"));
        assert_eq!(playlists[0].track_ids(), vec![track_id]);
    }

    #[test]
    fn insert_playlist_rejects_unknown_track_id() {
        let mut lib = sample_library();
        assert!(lib.insert_playlist("Broken", &[9999]).is_err());
    }

    #[test]
    fn insert_playlist_derives_persistent_id_from_title_deterministically() {
        let mut lib_a = sample_library();
        let track_a = lib_a.tracks()[0].track.track_id();
        lib_a.insert_playlist("Fantasy Favorites", &[track_a]).unwrap();

        let mut lib_b = sample_library();
        let track_b = lib_b.tracks()[0].track.track_id();
        lib_b.insert_playlist("Fantasy Favorites", &[track_b]).unwrap();

        assert_eq!(
            lib_a.playlists()[0].playlist.persistent_id(),
            lib_b.playlists()[0].playlist.persistent_id()
        );
        assert_eq!(lib_a.playlists()[0].playlist.persistent_id(), persistent_id_for_title("Fantasy Favorites"));
    }

    #[test]
    fn rewrite_extensions_updates_matching_locations_only() {
        let mut lib = sample_library();
        lib.insert_track(NewTrack {
            title: "Other".into(),
            album: None,
            artist: None,
            genre: None,
            kind: None,
            location: "/library/other/track.m4a".into(),
            size: 10,
            total_time_ms: 10,
            track_number: 1,
            year: 2000,
            disc_number: 1,
        });
        let rewritten = lib.rewrite_extensions("mp3", "m4b");
        assert_eq!(rewritten, 1);
        let tracks = lib.tracks();
        assert_eq!(tracks[0].location(), Some("/library/hobbit/hobbit.m4b"));
        assert_eq!(tracks[1].location(), Some("/library/other/track.m4a"));
    }

    #[test]
    fn validate_rejects_duplicate_track_ids() {
        let mut lib = sample_library();
        let duplicate = TrackChunk::new_blank(lib.tracks()[0].track.track_id(), 1);
        lib.items.push(ItlItem::Track(duplicate));
        assert!(lib.validate().is_err());
    }

    #[test]
    fn validate_passes_for_a_well_formed_library() {
        let mut lib = sample_library();
        let track_id = lib.tracks()[0].track.track_id();
        lib.insert_playlist("All", &[track_id]).unwrap();
        assert!(lib.validate().is_ok());
    }

    #[test]
    fn preserves_unknown_chunks_across_round_trip() {
        let mut lib = sample_library();
        let raw = b"zzzz\x00\x00\x00\x0c\x00\x00\x00\x0c".to_vec();
        lib.items.push(ItlItem::Raw(raw.clone()));
        let bytes = lib.emit();
        let reparsed = ItlLibrary::parse(&bytes).unwrap();
        assert!(matches!(reparsed.items.last(), Some(ItlItem::Raw(b)) if b == &raw));
    }
}
