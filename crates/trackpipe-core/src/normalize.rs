//! Schema normalizer: heterogeneous input columns → canonical record.
//!
//! Input files name the same concept differently (`song`, `track_name`,
//! `name`; `Artist(s)`, `artists`, …). A [`SynonymTable`] maps every known
//! spelling to a [`CanonicalField`], and the [`Normalizer`] applies it to
//! each [`RawRecord`].
//!
//! Labels are compared after folding: a leading BOM is dropped, letters are
//! lowercased, and everything but letters and digits is ignored. So
//! `"Artist(s)"`, `" artists "` and `"ARTISTS"` are the same label.
//!
//! Normalization never fails. Missing fields get a documented default
//! (see [`CanonicalField::default_value`]) and unknown columns are kept as
//! passthrough fields under their original label. A label that is already an
//! output column name (`content_label`, `title`, ...) gets a `raw_` prefix.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use sha2::{Digest, Sha256};

use crate::models::{CanonicalRecord, RawRecord};
use crate::sink::{CANONICAL_COLUMNS, DERIVED_COLUMNS};

/// Separator between artist names in a multi-artist value.
pub const ARTIST_SEPARATOR: char = ';';

/// Fields of the canonical schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CanonicalField {
    TrackId,
    Title,
    Artists,
    Album,
    Genre,
    Duration,
    Popularity,
    Danceability,
    Energy,
    Explicit,
}

impl CanonicalField {
    pub const ALL: [CanonicalField; 10] = [
        Self::TrackId,
        Self::Title,
        Self::Artists,
        Self::Album,
        Self::Genre,
        Self::Duration,
        Self::Popularity,
        Self::Danceability,
        Self::Energy,
        Self::Explicit,
    ];

    /// Column name used for this field in transformed output.
    pub fn name(&self) -> &'static str {
        match self {
            Self::TrackId => "track_id",
            Self::Title => "title",
            Self::Artists => "artists",
            Self::Album => "album",
            Self::Genre => "genre",
            Self::Duration => "duration",
            Self::Popularity => "popularity",
            Self::Danceability => "danceability",
            Self::Energy => "energy",
            Self::Explicit => "explicit",
        }
    }

    /// Value used when the source has no (non-empty) column for this field.
    ///
    /// Text fields default to the empty string, the required scores to `0`,
    /// and the explicit flag to `false`. A missing track id is replaced by a
    /// content identifier instead; see [`content_track_id`].
    pub fn default_value(&self) -> &'static str {
        match self {
            Self::Popularity | Self::Danceability | Self::Energy => "0",
            Self::Explicit => "false",
            _ => "",
        }
    }
}

/// Prefix for passthrough labels that collide with an output column.
pub const PASSTHROUGH_PREFIX: &str = "raw_";

/// Output name of an unknown input column.
pub fn passthrough_name(label: &str) -> String {
    let mut name = label.to_string();
    while CANONICAL_COLUMNS.contains(&name.as_str()) || DERIVED_COLUMNS.contains(&name.as_str()) {
        name.insert_str(0, PASSTHROUGH_PREFIX);
    }
    name
}

/// Fold a column label for synonym lookup.
pub fn fold_label(label: &str) -> String {
    label
        .trim_start_matches('\u{feff}')
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Mapping from folded column labels to canonical fields.
///
/// Synonyms registered earlier for a field take priority when a record
/// carries several of them.
#[derive(Debug, Clone)]
pub struct SynonymTable {
    entries: HashMap<String, (CanonicalField, usize)>,
}

impl SynonymTable {
    /// An empty table. Every column becomes passthrough.
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register synonyms for a field, in priority order.
    ///
    /// A label already registered keeps its first mapping.
    pub fn with(mut self, field: CanonicalField, synonyms: &[&str]) -> Self {
        let base = self
            .entries
            .values()
            .filter(|(f, _)| *f == field)
            .count();
        for (i, synonym) in synonyms.iter().enumerate() {
            self.entries
                .entry(fold_label(synonym))
                .or_insert((field, base + i));
        }
        self
    }

    /// Look up a raw column label.
    pub fn lookup(&self, label: &str) -> Option<(CanonicalField, usize)> {
        self.entries.get(&fold_label(label)).copied()
    }
}

impl Default for SynonymTable {
    fn default() -> Self {
        Self::empty()
            .with(CanonicalField::TrackId, &["track_id", "id", "track_uri", "uri"])
            .with(CanonicalField::Title, &["song", "track_name", "name", "title"])
            .with(
                CanonicalField::Artists,
                &["Artist(s)", "artists", "artist_name", "artist"],
            )
            .with(CanonicalField::Album, &["Album", "album_name"])
            .with(CanonicalField::Genre, &["Genre", "track_genre"])
            .with(CanonicalField::Duration, &["Length", "duration", "duration_ms"])
            .with(CanonicalField::Popularity, &["Popularity"])
            .with(CanonicalField::Danceability, &["Danceability"])
            .with(CanonicalField::Energy, &["Energy"])
            .with(CanonicalField::Explicit, &["Explicit"])
    }
}

/// Applies a [`SynonymTable`] to raw records.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    synonyms: SynonymTable,
}

impl Normalizer {
    pub fn new(synonyms: SynonymTable) -> Self {
        Self { synonyms }
    }

    /// Passthrough labels for a header: unknown columns, sorted, deduplicated.
    ///
    /// Depends only on the header, so an output schema can be fixed before
    /// the first record is read.
    pub fn passthrough_labels(&self, labels: &[String]) -> Vec<String> {
        labels
            .iter()
            .filter(|l| self.synonyms.lookup(l).is_none())
            .map(|l| passthrough_name(l))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Map a raw record onto the canonical schema.
    pub fn normalize(&self, raw: &RawRecord) -> CanonicalRecord {
        let mut picked: BTreeMap<CanonicalField, (usize, &str)> = BTreeMap::new();
        let mut passthrough = BTreeMap::new();

        for (label, value) in raw.iter() {
            match self.synonyms.lookup(label) {
                Some((field, priority)) => {
                    let value = value.trim();
                    if value.is_empty() {
                        continue;
                    }
                    let better = picked
                        .get(&field)
                        .map_or(true, |(current, _)| priority < *current);
                    if better {
                        picked.insert(field, (priority, value));
                    }
                }
                None => {
                    passthrough.insert(passthrough_name(label), value.to_string());
                }
            }
        }

        let text = |field: CanonicalField| -> String {
            picked
                .get(&field)
                .map(|(_, v)| *v)
                .unwrap_or_else(|| field.default_value())
                .to_string()
        };

        let title = text(CanonicalField::Title);
        let artists = split_artists(&text(CanonicalField::Artists));
        let album = text(CanonicalField::Album);
        let duration = text(CanonicalField::Duration);
        let track_id = match picked.get(&CanonicalField::TrackId) {
            Some((_, id)) => id.to_string(),
            None => content_track_id(&title, &artists, &album, &duration),
        };

        CanonicalRecord {
            track_id,
            title,
            artists,
            album,
            genre: text(CanonicalField::Genre).to_lowercase(),
            duration,
            popularity: text(CanonicalField::Popularity),
            danceability: text(CanonicalField::Danceability),
            energy: text(CanonicalField::Energy),
            explicit: text(CanonicalField::Explicit),
            passthrough,
        }
    }
}

/// Split a multi-artist value into trimmed, non-empty names.
pub fn split_artists(value: &str) -> Vec<String> {
    value
        .split(ARTIST_SEPARATOR)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Deterministic identifier for records whose source has no track id.
///
/// Identical title/artists/album/duration always produce the same id, so
/// reloading a file upserts instead of duplicating.
pub fn content_track_id(title: &str, artists: &[String], album: &str, duration: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update([0x1f]);
    for artist in artists {
        hasher.update(artist.as_bytes());
        hasher.update([0x1e]);
    }
    hasher.update([0x1f]);
    hasher.update(album.as_bytes());
    hasher.update([0x1f]);
    hasher.update(duration.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("sha256:{}", &digest[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::RecordSource;

    fn first_record(input: &str) -> RawRecord {
        RecordSource::new(input.as_bytes())
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_fold_label() {
        assert_eq!(fold_label("Artist(s)"), "artists");
        assert_eq!(fold_label("  Track Name "), "trackname");
        assert_eq!(fold_label("\u{feff}song"), "song");
        assert_eq!(fold_label("duration_ms"), "durationms");
    }

    #[test]
    fn test_synonyms_map_to_canonical() {
        let raw = first_record(
            "song,Artist(s),Album,Genre,Length,Popularity,Danceability,Energy,Explicit\n\
             Hey,A;B,Alb,ROCK,3:45,80,0.5,70,true\n",
        );
        let record = Normalizer::default().normalize(&raw);
        assert_eq!(record.title, "Hey");
        assert_eq!(record.artists, vec!["A", "B"]);
        assert_eq!(record.album, "Alb");
        assert_eq!(record.genre, "rock");
        assert_eq!(record.duration, "3:45");
        assert_eq!(record.popularity, "80");
        assert_eq!(record.danceability, "0.5");
        assert_eq!(record.energy, "70");
        assert_eq!(record.explicit, "true");
        assert!(record.passthrough.is_empty());
    }

    #[test]
    fn test_case_and_whitespace_insensitive() {
        let raw = first_record(" TRACK_NAME , popularity \nSong,12\n");
        let record = Normalizer::default().normalize(&raw);
        assert_eq!(record.title, "Song");
        assert_eq!(record.popularity, "12");
    }

    #[test]
    fn test_missing_fields_get_defaults() {
        let raw = first_record("track_id,name\nt1,Only Title\n");
        let record = Normalizer::default().normalize(&raw);
        assert_eq!(record.track_id, "t1");
        assert_eq!(record.artists, Vec::<String>::new());
        assert_eq!(record.album, "");
        assert_eq!(record.duration, "");
        assert_eq!(record.popularity, "0");
        assert_eq!(record.danceability, "0");
        assert_eq!(record.energy, "0");
        assert_eq!(record.explicit, "false");
    }

    #[test]
    fn test_empty_values_count_as_missing() {
        let raw = first_record("song,track_name,Popularity\n,Second,\n");
        let record = Normalizer::default().normalize(&raw);
        assert_eq!(record.title, "Second");
        assert_eq!(record.popularity, "0");
    }

    #[test]
    fn test_synonym_priority() {
        let raw = first_record("name,song\nlow priority,high priority\n");
        let record = Normalizer::default().normalize(&raw);
        assert_eq!(record.title, "high priority");
    }

    #[test]
    fn test_unknown_columns_pass_through() {
        let raw = first_record("song,tempo,Key\nx,120.5,C#\n");
        let normalizer = Normalizer::default();
        let record = normalizer.normalize(&raw);
        assert_eq!(record.passthrough.get("tempo").map(String::as_str), Some("120.5"));
        assert_eq!(record.passthrough.get("Key").map(String::as_str), Some("C#"));
        assert_eq!(
            normalizer.passthrough_labels(raw.labels()),
            vec!["Key".to_string(), "tempo".to_string()]
        );
    }

    #[test]
    fn test_output_column_labels_renamed() {
        let raw = first_record("song,content_label,popularity_tier\nx,mine,gold\n");
        let normalizer = Normalizer::default();
        let record = normalizer.normalize(&raw);
        assert_eq!(
            record.passthrough.get("raw_content_label").map(String::as_str),
            Some("mine")
        );
        assert_eq!(
            record.passthrough.get("raw_popularity_tier").map(String::as_str),
            Some("gold")
        );
        assert_eq!(
            normalizer.passthrough_labels(raw.labels()),
            vec!["raw_content_label".to_string(), "raw_popularity_tier".to_string()]
        );
    }

    #[test]
    fn test_canonical_name_renamed_with_custom_table() {
        let normalizer = Normalizer::new(SynonymTable::empty());
        let raw = first_record("title\nx\n");
        assert_eq!(
            normalizer.normalize(&raw).passthrough.get("raw_title").map(String::as_str),
            Some("x")
        );
        assert_eq!(passthrough_name("tempo"), "tempo");
    }

    #[test]
    fn test_content_track_id_is_deterministic() {
        let raw = first_record("song,artists,Length\nx,y,3:00\n");
        let a = Normalizer::default().normalize(&raw);
        let b = Normalizer::default().normalize(&raw);
        assert!(a.track_id.starts_with("sha256:"));
        assert_eq!(a.track_id.len(), "sha256:".len() + 16);
        assert_eq!(a.track_id, b.track_id);

        let other = first_record("song,artists,Length\nx,z,3:00\n");
        assert_ne!(a.track_id, Normalizer::default().normalize(&other).track_id);
    }
}
