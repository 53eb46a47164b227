use log::{debug, error, info, warn};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};

pub const ENV_CONFIG: &str = "PAS_CONFIG";
pub const ENV_VERBOSE: &str = "PAS_VERBOSE";

const CONFIG_FILENAME: &str = "config.yaml";

/// Skip or lower volume when a matching range is playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SkipMode {
    #[default]
    Skip,
    #[serde(alias = "mute")]
    Volume,
}

impl SkipMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "skip" => Some(SkipMode::Skip),
            "volume" | "mute" => Some(SkipMode::Volume),
            _ => None,
        }
    }
}

/// First-episode gating. Accepts the legacy boolean spellings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FirstEpisode {
    Never,
    Watched,
    #[default]
    Always,
}

impl<'de> Deserialize<'de> for FirstEpisode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_yml::Value::deserialize(deserializer)?;
        match value {
            serde_yml::Value::Bool(true) => Ok(FirstEpisode::Always),
            serde_yml::Value::Bool(false) => Ok(FirstEpisode::Never),
            serde_yml::Value::String(s) => match s.to_lowercase().as_str() {
                "never" | "false" => Ok(FirstEpisode::Never),
                "watched" | "played" => Ok(FirstEpisode::Watched),
                "always" | "all" | "true" => Ok(FirstEpisode::Always),
                other => Err(serde::de::Error::custom(format!(
                    "unknown first-episode value {other:?}"
                ))),
            },
            _ => Err(serde::de::Error::custom("expected string or bool")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PlexTvSection {
    pub username: String,
    pub password: String,
    pub token: String,
    pub servername: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub address: String,
    pub ssl: bool,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self { address: String::new(), ssl: true, port: 32400 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SecuritySection {
    #[serde(rename = "ignore-certs")]
    pub ignore_certs: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SkipSection {
    pub mode: SkipMode,
    pub tags: Vec<String>,
    pub types: Vec<String>,
    #[serde(rename = "ignored-libraries")]
    pub ignored_libraries: Vec<String>,
    #[serde(rename = "last-chapter")]
    pub last_chapter: f64,
    pub unwatched: bool,
    #[serde(rename = "first-episode-series")]
    pub first_episode_series: FirstEpisode,
    #[serde(rename = "first-episode-season")]
    pub first_episode_season: FirstEpisode,
    pub next: bool,
    pub binge: u32,
    #[serde(rename = "binge-safe-tags")]
    pub binge_safe_tags: Vec<String>,
    #[serde(rename = "binge-same-show-only")]
    pub binge_same_show_only: bool,
    #[serde(rename = "skip-next-max")]
    pub skip_next_max: u32,
}

impl Default for SkipSection {
    fn default() -> Self {
        Self {
            mode: SkipMode::Skip,
            tags: ["intro", "commercial", "advertisement", "credits"]
                .map(String::from)
                .to_vec(),
            types: ["movie", "episode"].map(String::from).to_vec(),
            ignored_libraries: Vec::new(),
            last_chapter: 0.0,
            unwatched: true,
            first_episode_series: FirstEpisode::Watched,
            first_episode_season: FirstEpisode::Always,
            next: false,
            binge: 0,
            binge_safe_tags: Vec::new(),
            binge_same_show_only: true,
            skip_next_max: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OffsetsSection {
    pub start: i64,
    pub end: i64,
    pub command: u64,
    pub tags: Vec<String>,
}

impl Default for OffsetsSection {
    fn default() -> Self {
        Self { start: 3000, end: 1000, command: 500, tags: vec!["intro".to_string()] }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeSection {
    pub low: u8,
    pub high: u8,
}

impl Default for VolumeSection {
    fn default() -> Self {
        Self { low: 0, high: 100 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    #[serde(rename = "Plex.tv")]
    pub plex_tv: PlexTvSection,
    #[serde(rename = "Server")]
    pub server: ServerSection,
    #[serde(rename = "Security")]
    pub security: SecuritySection,
    #[serde(rename = "Skip")]
    pub skip: SkipSection,
    #[serde(rename = "Offsets")]
    pub offsets: OffsetsSection,
    #[serde(rename = "Volume")]
    pub volume: VolumeSection,
}

impl Config {
    /// Resolve the config file path: explicit argument, then the PAS_CONFIG
    /// environment variable, then the per-user config directory. A directory
    /// is joined with the default filename.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        let mut path = explicit
            .map(Path::to_path_buf)
            .or_else(|| {
                std::env::var_os(ENV_CONFIG).map(|v| {
                    debug!("{} environment variable override found", ENV_CONFIG);
                    PathBuf::from(v)
                })
            })
            .unwrap_or_else(Self::config_path);
        if path.is_dir() {
            path = path.join(CONFIG_FILENAME);
        }
        path
    }

    pub fn load(path: &Path) -> Self {
        info!("Loading config file {}", path.display());

        let raw = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(_) => {
                let config = Config::default();
                if let Err(e) = config.save(path) {
                    warn!("Unable to write default config to {}: {}", path.display(), e);
                }
                return config;
            }
        };

        let mut value: serde_yml::Value = match serde_yml::from_str(&raw) {
            Ok(v) => v,
            Err(e) => {
                error!("Malformed config file {}: {}, using defaults", path.display(), e);
                return Config::default();
            }
        };
        if !value.is_mapping() {
            value = serde_yml::Value::Mapping(Default::default());
        }

        // Materialize any missing sections or options and rewrite the file so
        // the user can see everything that is configurable.
        if materialize_defaults(&mut value) {
            match serde_yml::to_string(&value) {
                Ok(contents) => {
                    if let Err(e) = std::fs::write(path, contents) {
                        warn!("Unable to rewrite config {}: {}", path.display(), e);
                    } else {
                        debug!("Missing options materialized, config rewritten");
                    }
                }
                Err(e) => warn!("Unable to serialize config: {}", e),
            }
        }

        match serde_yml::from_value::<Config>(value) {
            Ok(mut config) => {
                config.normalize();
                config
            }
            Err(e) => {
                error!("Invalid config values in {}: {}, using defaults", path.display(), e);
                Config::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_yml::to_string(self).unwrap_or_default();
        std::fs::write(path, contents)
    }

    fn normalize(&mut self) {
        for list in [
            &mut self.skip.tags,
            &mut self.skip.types,
            &mut self.skip.ignored_libraries,
            &mut self.skip.binge_safe_tags,
            &mut self.offsets.tags,
        ] {
            for entry in list.iter_mut() {
                *entry = entry.trim().to_lowercase();
            }
            list.retain(|entry| !entry.is_empty());
        }
        self.volume.low = self.volume.low.min(100);
        self.volume.high = self.volume.high.min(100);
        self.skip.last_chapter = self.skip.last_chapter.clamp(0.0, 1.0);
    }

    pub fn verbose() -> bool {
        std::env::var(ENV_VERBOSE)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    fn config_path() -> PathBuf {
        Self::app_dir().join(CONFIG_FILENAME)
    }

    pub fn log_path() -> PathBuf {
        Self::app_dir().join("autoskip-for-plex.log")
    }

    pub fn app_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("autoskip-for-plex")
    }
}

/// Insert every default section/option missing from `value`. Returns true if
/// anything was added.
fn materialize_defaults(value: &mut serde_yml::Value) -> bool {
    let defaults = serde_yml::to_value(Config::default()).expect("default config serializes");
    merge_missing(value, &defaults)
}

fn merge_missing(value: &mut serde_yml::Value, defaults: &serde_yml::Value) -> bool {
    let (Some(map), Some(default_map)) = (value.as_mapping_mut(), defaults.as_mapping()) else {
        return false;
    };
    let mut changed = false;
    for (key, default_value) in default_map {
        match map.get_mut(key) {
            None => {
                map.insert(key.clone(), default_value.clone());
                changed = true;
            }
            Some(existing) if existing.is_mapping() && default_value.is_mapping() => {
                changed |= merge_missing(existing, default_value);
            }
            Some(_) => {}
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.skip.mode, SkipMode::Skip);
        assert_eq!(config.skip.tags, ["intro", "commercial", "advertisement", "credits"]);
        assert_eq!(config.offsets.start, 3000);
        assert_eq!(config.offsets.end, 1000);
        assert_eq!(config.offsets.command, 500);
        assert_eq!(config.volume.low, 0);
        assert_eq!(config.volume.high, 100);
        assert_eq!(config.server.port, 32400);
        assert!(config.server.ssl);
    }

    #[test]
    fn missing_options_are_materialized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "Skip:\n  mode: volume\n").unwrap();

        let config = Config::load(&path);
        assert_eq!(config.skip.mode, SkipMode::Volume);
        assert_eq!(config.offsets.start, 3000);

        let rewritten = std::fs::read_to_string(&path).unwrap();
        assert!(rewritten.contains("Offsets"));
        assert!(rewritten.contains("Volume"));
        assert!(rewritten.contains("mode: volume"));
    }

    #[test]
    fn malformed_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "Skip: [unclosed").unwrap();

        let config = Config::load(&path);
        assert_eq!(config.skip.mode, SkipMode::Skip);
    }

    #[test]
    fn first_episode_accepts_legacy_spellings() {
        let parsed: SkipSection =
            serde_yml::from_str("first-episode-series: played\nfirst-episode-season: false\n")
                .unwrap();
        assert_eq!(parsed.first_episode_series, FirstEpisode::Watched);
        assert_eq!(parsed.first_episode_season, FirstEpisode::Never);

        let parsed: SkipSection = serde_yml::from_str("first-episode-series: true\n").unwrap();
        assert_eq!(parsed.first_episode_series, FirstEpisode::Always);
    }

    #[test]
    fn mode_accepts_mute_synonym() {
        let parsed: SkipSection = serde_yml::from_str("mode: mute\n").unwrap();
        assert_eq!(parsed.mode, SkipMode::Volume);
        assert_eq!(SkipMode::parse("MUTE"), Some(SkipMode::Volume));
        assert_eq!(SkipMode::parse("nope"), None);
    }

    #[test]
    fn tags_are_lowercased_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "Skip:\n  tags: [Intro, ' Credits ']\n").unwrap();

        let config = Config::load(&path);
        assert_eq!(config.skip.tags, ["intro", "credits"]);
    }
}
