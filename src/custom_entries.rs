use log::{debug, error, info, warn};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::SkipMode;
use crate::library::LibraryIndex;

pub const GUID_PREFIXES: [&str; 3] = ["imdb://", "tmdb://", "tvdb://"];

const CUSTOM_FILENAME: &str = "custom.json";

#[derive(Debug, Error)]
pub enum MarkerError {
    #[error("marker is missing a start or end value")]
    MissingBounds,
    #[error("marker start/end is not a number: {0}")]
    NotANumber(String),
    #[error("negative marker value {0} requires a known duration")]
    NegativeWithoutDuration(i64),
}

/// Marker entry as written in the custom JSON document. Values stay loose
/// here so a single bad marker can be dropped without rejecting the file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawMarker {
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub start: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub end: Value,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub marker_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub cascade: Value,
}

impl RawMarker {
    pub fn cascade_enabled(&self) -> bool {
        truthy(&self.cascade)
    }

    pub fn start_ms(&self) -> Result<i64, MarkerError> {
        parse_ms(&self.start)
    }

    pub fn end_ms(&self) -> Result<i64, MarkerError> {
        parse_ms(&self.end)
    }
}

fn parse_ms(value: &Value) -> Result<i64, MarkerError> {
    match value {
        Value::Null => Err(MarkerError::MissingBounds),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64))
            .ok_or_else(|| MarkerError::NotANumber(n.to_string())),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| MarkerError::NotANumber(s.clone())),
        other => Err(MarkerError::NotANumber(other.to_string())),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64().map(|i| i != 0).unwrap_or(false),
        Value::String(s) => matches!(
            s.trim().to_lowercase().as_str(),
            "y" | "yes" | "t" | "true" | "on" | "1"
        ),
        _ => false,
    }
}

/// A resolved user-declared marker: absolute millisecond bounds, owning key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomMarker {
    pub start: i64,
    pub end: i64,
    pub marker_type: String,
    pub mode: SkipMode,
    pub cascade: bool,
    pub key: i64,
}

impl CustomMarker {
    /// Resolve a raw document marker against the owning item. Negative values
    /// count back from the end and therefore require a known duration;
    /// resolved bounds are clamped to `[0, duration]`.
    pub fn try_parse(
        raw: &RawMarker,
        key: i64,
        duration: Option<i64>,
        default_mode: SkipMode,
    ) -> Result<Self, MarkerError> {
        let start = Self::resolve(raw.start_ms()?, duration)?;
        let end = Self::resolve(raw.end_ms()?, duration)?;
        let mode = raw
            .mode
            .as_deref()
            .and_then(SkipMode::parse)
            .unwrap_or(default_mode);
        Ok(CustomMarker {
            start,
            end,
            marker_type: raw
                .marker_type
                .as_deref()
                .unwrap_or("custom")
                .to_lowercase(),
            mode,
            cascade: raw.cascade_enabled(),
            key,
        })
    }

    fn resolve(value: i64, duration: Option<i64>) -> Result<i64, MarkerError> {
        if value >= 0 {
            return Ok(match duration {
                Some(d) => value.min(d),
                None => value,
            });
        }
        let duration = duration.ok_or(MarkerError::NegativeWithoutDuration(value))?;
        Ok((duration + value).clamp(0, duration))
    }

    pub fn duration(&self) -> i64 {
        self.end - self.start
    }
}

/// An item identifier in the document: a numeric ratingKey or an external
/// GUID. Numeric keys serialize back as JSON numbers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ItemKey(pub String);

impl ItemKey {
    pub fn is_guid(&self) -> bool {
        key_is_guid(&self.0)
    }
}

impl Serialize for ItemKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0.parse::<i64>() {
            Ok(n) => serializer.serialize_i64(n),
            Err(_) => serializer.serialize_str(&self.0),
        }
    }
}

impl<'de> Deserialize<'de> for ItemKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::String(s) => Ok(ItemKey(s)),
            Value::Number(n) => Ok(ItemKey(n.to_string())),
            other => Err(serde::de::Error::custom(format!(
                "expected string or number key, got {other}"
            ))),
        }
    }
}

/// One or more markers; a bare object in the document is treated as a
/// single-element list.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct MarkerList(pub Vec<RawMarker>);

impl<'de> Deserialize<'de> for MarkerList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum OneOrMany {
            One(RawMarker),
            Many(Vec<RawMarker>),
        }
        Ok(match OneOrMany::deserialize(deserializer)? {
            OneOrMany::One(m) => MarkerList(vec![m]),
            OneOrMany::Many(v) => MarkerList(v),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OffsetEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessList {
    pub users: Vec<String>,
    pub clients: Vec<String>,
    pub keys: Vec<ItemKey>,
    #[serde(rename = "skip-next")]
    pub skip_next: Vec<String>,
}

impl AccessList {
    pub fn contains_key(&self, rating_key: i64) -> bool {
        let needle = rating_key.to_string();
        self.keys.iter().any(|k| k.0 == needle)
    }

    pub fn contains_client(&self, title: &str, identifier: &str) -> bool {
        self.clients.iter().any(|c| c == title || c == identifier)
    }

    pub fn skip_next_matches(&self, title: &str, identifier: &str) -> bool {
        self.skip_next.iter().any(|c| c == title || c == identifier)
    }
}

/// The user's declarative overrides, decoded from the custom JSON document.
/// Unknown top-level fields ride along in `extra` and survive a rewrite.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomEntries {
    pub markers: BTreeMap<String, MarkerList>,
    pub offsets: BTreeMap<String, OffsetEntry>,
    pub tags: BTreeMap<String, Vec<String>>,
    pub allowed: AccessList,
    pub blocked: AccessList,
    pub clients: BTreeMap<String, String>,
    pub mode: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CustomEntries {
    /// Load and deep-merge every custom JSON file under `dir`. When none
    /// exists, the default skeleton is written to `custom.json`. Files that
    /// fail to load are skipped; they are never overwritten.
    pub fn load_dir(dir: &Path) -> Self {
        let files = json_files(dir);
        if files.is_empty() {
            let skeleton = CustomEntries::default();
            let path = dir.join(CUSTOM_FILENAME);
            if let Err(e) = skeleton.save(&path) {
                warn!("Unable to write custom entry skeleton to {}: {}", path.display(), e);
            }
            return skeleton;
        }

        let mut merged = Value::Null;
        let mut loaded = false;
        for path in files {
            match load_json(&path) {
                Some(data) => {
                    info!("Loading custom JSON file {}", path.display());
                    merge(&mut merged, data);
                    loaded = true;
                }
                None => warn!("Found custom file {} but failed to load, using defaults", path.display()),
            }
        }
        if !loaded {
            return CustomEntries::default();
        }

        match serde_json::from_value::<CustomEntries>(merged) {
            Ok(entries) => entries,
            Err(e) => {
                error!("Invalid custom entry data: {}, using defaults", e);
                CustomEntries::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self).unwrap_or_default();
        std::fs::write(path, contents)
    }

    pub fn markers_for(&self, rating_key: i64) -> Option<&[RawMarker]> {
        self.markers.get(&rating_key.to_string()).map(|l| l.0.as_slice())
    }

    pub fn offsets_for(&self, rating_key: i64) -> Option<&OffsetEntry> {
        self.offsets.get(&rating_key.to_string())
    }

    pub fn tags_for(&self, rating_key: i64) -> Option<&[String]> {
        self.tags.get(&rating_key.to_string()).map(|t| t.as_slice())
    }

    pub fn mode_for_key(&self, rating_key: i64) -> Option<SkipMode> {
        self.mode
            .get(&rating_key.to_string())
            .and_then(|m| SkipMode::parse(m))
    }

    pub fn mode_for_client(&self, title: &str, identifier: &str) -> Option<SkipMode> {
        self.mode
            .get(title)
            .or_else(|| self.mode.get(identifier))
            .and_then(|m| SkipMode::parse(m))
    }

    pub fn command_delay_for_client(&self, title: &str, identifier: &str) -> Option<u64> {
        self.offsets
            .get(title)
            .or_else(|| self.offsets.get(identifier))
            .and_then(|o| o.command)
    }

    pub fn client_base_url(&self, title: &str, identifier: &str) -> Option<&str> {
        self.clients
            .get(title)
            .or_else(|| self.clients.get(identifier))
            .map(String::as_str)
    }

    pub fn needs_guid_resolution(&self) -> bool {
        self.markers.keys().any(|k| key_is_guid(k))
            || self.offsets.keys().any(|k| key_is_guid(k))
            || self.tags.keys().any(|k| key_is_guid(k))
            || self.mode.keys().any(|k| key_is_guid(k))
            || self.allowed.keys.iter().any(ItemKey::is_guid)
            || self.blocked.keys.iter().any(ItemKey::is_guid)
    }

    /// Rewrite every GUID identifier to its numeric ratingKey using the
    /// library index. Identifiers that cannot be resolved are dropped.
    pub fn convert_to_rating_keys(&mut self, index: &LibraryIndex) {
        self.markers = convert_map(std::mem::take(&mut self.markers), "markers", |k| {
            resolve_guid_key(k, index)
        });
        self.offsets = convert_map(std::mem::take(&mut self.offsets), "offsets", |k| {
            resolve_guid_key(k, index)
        });
        self.tags = convert_map(std::mem::take(&mut self.tags), "tags", |k| {
            resolve_guid_key(k, index)
        });
        self.mode = convert_map(std::mem::take(&mut self.mode), "mode", |k| {
            resolve_guid_key(k, index)
        });
        convert_keys(&mut self.allowed.keys, "allowed keys", |k| resolve_guid_key(k, index));
        convert_keys(&mut self.blocked.keys, "blocked keys", |k| resolve_guid_key(k, index));
    }

    /// The inverse rewrite, used by the auditor to produce portable files.
    pub fn convert_to_guids(&mut self, index: &LibraryIndex) {
        self.markers = convert_map(std::mem::take(&mut self.markers), "markers", |k| {
            resolve_key_guid(k, index)
        });
        self.offsets = convert_map(std::mem::take(&mut self.offsets), "offsets", |k| {
            resolve_key_guid(k, index)
        });
        self.tags = convert_map(std::mem::take(&mut self.tags), "tags", |k| {
            resolve_key_guid(k, index)
        });
        self.mode = convert_map(std::mem::take(&mut self.mode), "mode", |k| {
            resolve_key_guid(k, index)
        });
        convert_keys(&mut self.allowed.keys, "allowed keys", |k| resolve_key_guid(k, index));
        convert_keys(&mut self.blocked.keys, "blocked keys", |k| resolve_key_guid(k, index));
    }
}

pub fn key_is_guid(key: &str) -> bool {
    GUID_PREFIXES.iter().any(|p| key.starts_with(p))
}

fn resolve_guid_key(key: &str, index: &LibraryIndex) -> Option<String> {
    if !key_is_guid(key) {
        return Some(key.to_string());
    }
    match index.resolve_guid(key) {
        Some(rating_key) => {
            debug!("Resolved GUID {} to ratingKey {}", key, rating_key);
            Some(rating_key.to_string())
        }
        None => None,
    }
}

fn resolve_key_guid(key: &str, index: &LibraryIndex) -> Option<String> {
    if key_is_guid(key) {
        return Some(key.to_string());
    }
    let rating_key: i64 = key.parse().ok()?;
    match index.key_to_guid(rating_key) {
        Some(guid) => {
            debug!("Resolved ratingKey {} to GUID {}", key, guid);
            Some(guid)
        }
        None => None,
    }
}

fn convert_map<V>(
    map: BTreeMap<String, V>,
    section: &str,
    mut resolve: impl FnMut(&str) -> Option<String>,
) -> BTreeMap<String, V> {
    let mut converted = BTreeMap::new();
    for (key, value) in map {
        match resolve(&key) {
            Some(new_key) => {
                converted.insert(new_key, value);
            }
            None => error!("Unable to resolve {} entry {}, dropping", section, key),
        }
    }
    converted
}

fn convert_keys(
    keys: &mut Vec<ItemKey>,
    section: &str,
    mut resolve: impl FnMut(&str) -> Option<String>,
) {
    keys.retain_mut(|key| match resolve(&key.0) {
        Some(new_key) => {
            key.0 = new_key;
            true
        }
        None => {
            error!("Unable to resolve {} entry {}, dropping", section, key.0);
            false
        }
    });
}

/// Every `.json` file under `dir`, recursing into subdirectories.
pub fn json_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    collect_json_files(dir, &mut files);
    files.sort();
    files
}

fn collect_json_files(dir: &Path, files: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_json_files(&path, files);
        } else if path.extension().is_some_and(|e| e == "json") {
            files.push(path);
        }
    }
}

fn load_json(path: &Path) -> Option<Value> {
    let contents = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

/// Deep merge in document order: maps recurse, lists extend, scalars replace.
fn merge(base: &mut Value, incoming: Value) {
    match (base, incoming) {
        (Value::Object(base_map), Value::Object(incoming_map)) => {
            for (key, value) in incoming_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(base_list), Value::Array(incoming_list)) => {
            base_list.extend(incoming_list);
        }
        (base, incoming) => *base = incoming,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker(start: i64, end: i64) -> RawMarker {
        RawMarker {
            start: Value::from(start),
            end: Value::from(end),
            ..RawMarker::default()
        }
    }

    #[test]
    fn absolute_values_are_preserved() {
        let m = CustomMarker::try_parse(&marker(1000, 2000), 7, Some(10_000), SkipMode::Skip)
            .unwrap();
        assert_eq!((m.start, m.end), (1000, 2000));
        assert_eq!(m.key, 7);
        assert_eq!(m.duration(), 1000);
    }

    #[test]
    fn negative_values_count_back_from_duration() {
        let m = CustomMarker::try_parse(
            &marker(-120_000, -1),
            7,
            Some(1_800_000),
            SkipMode::Skip,
        )
        .unwrap();
        assert_eq!((m.start, m.end), (1_680_000, 1_799_999));
    }

    #[test]
    fn values_clamp_to_duration() {
        let m = CustomMarker::try_parse(&marker(-99_999_999, 99_999_999), 1, Some(5000), SkipMode::Skip)
            .unwrap();
        assert_eq!((m.start, m.end), (0, 5000));
    }

    #[test]
    fn negative_value_without_duration_is_an_error() {
        let err = CustomMarker::try_parse(&marker(-5000, -1), 1, None, SkipMode::Skip).unwrap_err();
        assert!(matches!(err, MarkerError::NegativeWithoutDuration(-5000)));
    }

    #[test]
    fn missing_bounds_are_an_error() {
        let raw = RawMarker { start: Value::from(10), ..RawMarker::default() };
        let err = CustomMarker::try_parse(&raw, 1, None, SkipMode::Skip).unwrap_err();
        assert!(matches!(err, MarkerError::MissingBounds));
    }

    #[test]
    fn non_numeric_bounds_are_an_error() {
        let raw = RawMarker {
            start: Value::from("soon"),
            end: Value::from(10),
            ..RawMarker::default()
        };
        let err = CustomMarker::try_parse(&raw, 1, None, SkipMode::Skip).unwrap_err();
        assert!(matches!(err, MarkerError::NotANumber(_)));
    }

    #[test]
    fn cascade_accepts_string_spellings() {
        for (text, expected) in [("true", true), ("Yes", true), ("1", true), ("off", false)] {
            let raw = RawMarker { cascade: Value::from(text), ..RawMarker::default() };
            assert_eq!(raw.cascade_enabled(), expected, "{text}");
        }
        let raw = RawMarker { cascade: Value::Bool(true), ..RawMarker::default() };
        assert!(raw.cascade_enabled());
    }

    #[test]
    fn single_marker_object_becomes_a_list() {
        let doc = r#"{"markers": {"123": {"start": 0, "end": 1000}}}"#;
        let entries: CustomEntries = serde_json::from_str(doc).unwrap();
        assert_eq!(entries.markers_for(123).unwrap().len(), 1);
    }

    #[test]
    fn marker_mode_overrides_default() {
        let raw = RawMarker {
            start: Value::from(0),
            end: Value::from(100),
            mode: Some("mute".to_string()),
            ..RawMarker::default()
        };
        let m = CustomMarker::try_parse(&raw, 1, None, SkipMode::Skip).unwrap();
        assert_eq!(m.mode, SkipMode::Volume);
    }

    #[test]
    fn unknown_fields_survive_a_round_trip() {
        let doc = r#"{"markers": {}, "notes": {"why": "manual edits"}}"#;
        let entries: CustomEntries = serde_json::from_str(doc).unwrap();
        let out = serde_json::to_string(&entries).unwrap();
        assert!(out.contains("manual edits"));
    }

    #[test]
    fn numeric_keys_round_trip_as_numbers() {
        let doc = r#"{"allowed": {"keys": [123, "imdb://tt0944947"]}}"#;
        let entries: CustomEntries = serde_json::from_str(doc).unwrap();
        assert!(entries.allowed.contains_key(123));
        let out = serde_json::to_string(&entries).unwrap();
        assert!(out.contains("[123,"));
        assert!(out.contains("imdb://tt0944947"));
    }

    #[test]
    fn merge_extends_lists_and_recurses_maps() {
        let mut base: Value =
            serde_json::from_str(r#"{"allowed": {"users": ["a"]}, "markers": {"1": []}}"#).unwrap();
        let incoming: Value =
            serde_json::from_str(r#"{"allowed": {"users": ["b"]}, "markers": {"2": []}}"#).unwrap();
        merge(&mut base, incoming);
        let entries: CustomEntries = serde_json::from_value(base).unwrap();
        assert_eq!(entries.allowed.users, ["a", "b"]);
        assert_eq!(entries.markers.len(), 2);
    }

    #[test]
    fn json_files_recurse_into_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("custom.json"), "{}").unwrap();
        let nested = dir.path().join("shows");
        std::fs::create_dir(&nested).unwrap();
        std::fs::write(nested.join("more.json"), "{}").unwrap();
        std::fs::write(nested.join("notes.txt"), "not custom data").unwrap();

        let files = json_files(dir.path());
        assert_eq!(files.len(), 2);
        assert!(files.iter().any(|f| f.ends_with("shows/more.json")));
    }

    #[test]
    fn guid_detection() {
        let doc = r#"{"markers": {"tmdb://1399.1.1": [{"start": 0, "end": 1000}]}}"#;
        let entries: CustomEntries = serde_json::from_str(doc).unwrap();
        assert!(entries.needs_guid_resolution());

        let doc = r#"{"markers": {"123": [{"start": 0, "end": 1000}]}}"#;
        let entries: CustomEntries = serde_json::from_str(doc).unwrap();
        assert!(!entries.needs_guid_resolution());
    }
}
