//! One-shot auditor for custom entry files: shift marker offsets, validate
//! marker lengths, rewrite identifiers between ratingKeys and GUIDs, and dump
//! the server's current markers for an item.

use autoskip_for_plex::config::Config;
use autoskip_for_plex::custom_entries::{json_files, key_is_guid, CustomEntries, MarkerList, RawMarker};
use autoskip_for_plex::library::LibraryIndex;
use autoskip_for_plex::server::PlexServer;
use clap::Parser;
use log::{error, info, warn};
use serde_json::Value;
use simplelog::{Config as LogConfig, LevelFilter, SimpleLogger};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "autoskip-audit", version, about = "Autoskip custom JSON auditor")]
struct Args {
    /// Alternate configuration file location
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Path to a custom JSON file or directory; defaults to the config folder
    #[arg(short, long)]
    path: Option<PathBuf>,
    /// Adjust both start and end of every marker by this many milliseconds
    #[arg(short, long)]
    offset: Option<i64>,
    /// Adjust only marker starts by this many milliseconds
    #[arg(long = "startoffset")]
    start_offset: Option<i64>,
    /// Adjust only marker ends by this many milliseconds
    #[arg(long = "endoffset")]
    end_offset: Option<i64>,
    /// Validate that every marker is exactly this many milliseconds long
    #[arg(short, long)]
    duration: Option<i64>,
    /// Overwrite ratingKeys with GUIDs
    #[arg(short = 'g', long = "write_guids")]
    write_guids: bool,
    /// Overwrite GUIDs with ratingKeys
    #[arg(long = "write_ratingkeys")]
    write_ratingkeys: bool,
    /// Dump an item's current server markers keyed by GUID
    #[arg(long = "dump_guids", value_name = "ID")]
    dump_guids: Option<String>,
    /// Dump an item's current server markers keyed by ratingKey
    #[arg(long = "dump_ratingkeys", value_name = "ID")]
    dump_ratingkeys: Option<String>,
}

impl Args {
    fn needs_server(&self) -> bool {
        self.write_guids
            || self.write_ratingkeys
            || self.dump_guids.is_some()
            || self.dump_ratingkeys.is_some()
    }
}

#[tokio::main]
async fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        // Help and version go through the normal path; real argument errors
        // exit with a failure status.
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            std::process::exit(1);
        }
        Err(e) => e.exit(),
    };
    let _ = SimpleLogger::init(LevelFilter::Info, LogConfig::default());

    let config_path = Config::resolve_path(args.config.as_deref());
    let path = args.path.clone().unwrap_or_else(|| {
        config_path.parent().map(PathBuf::from).unwrap_or_else(Config::app_dir)
    });
    let config = Config::load(&config_path);

    let mut server = None;
    let mut index = None;
    if args.needs_server() {
        let connected = match PlexServer::connect(&config).await {
            Ok(s) => s,
            Err(e) => {
                error!("Unable to connect to a Plex server: {}", e);
                std::process::exit(1);
            }
        };
        let items = match connected.library_items().await {
            Ok(items) => items,
            Err(e) => {
                error!("Unable to walk the library: {}", e);
                std::process::exit(1);
            }
        };
        index = Some(LibraryIndex::build(items));
        server = Some(connected);
    }

    if let Some(identifier) = args.dump_guids.clone().or_else(|| args.dump_ratingkeys.clone()) {
        let use_guids = args.dump_guids.is_some();
        let (Some(server), Some(index)) = (server.as_ref(), index.as_ref()) else {
            error!("A server connection is required to dump markers");
            std::process::exit(1);
        };
        match dump_markers(server, index, &config, &identifier, use_guids).await {
            Some(dump) => {
                if path.extension().is_some_and(|e| e == "json") {
                    if let Err(e) = dump.save(&path) {
                        error!("Unable to write {}: {}", path.display(), e);
                        std::process::exit(1);
                    }
                    process_file(&path, &args, Some(index));
                } else {
                    info!("{}", serde_json::to_string_pretty(&dump).unwrap_or_default());
                }
                return;
            }
            None => {
                error!("Unable to resolve {} to a library item", identifier);
                std::process::exit(1);
            }
        }
    }

    if path.is_dir() {
        for file in json_files(&path) {
            process_file(&file, &args, index.as_ref());
        }
    } else if path.exists() {
        process_file(&path, &args, index.as_ref());
    } else {
        error!("Invalid path {}, does it exist?", path.display());
        std::process::exit(1);
    }
}

fn process_file(path: &Path, args: &Args, index: Option<&LibraryIndex>) {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            warn!("Unable to read {}: {}", path.display(), e);
            return;
        }
    };
    let mut entries: CustomEntries = match serde_json::from_str(&contents) {
        Ok(e) => e,
        Err(e) => {
            warn!("Unable to parse {}: {}", path.display(), e);
            return;
        }
    };

    info!("Reading file {}", path.display());
    audit_markers(&mut entries, args);

    if let Some(index) = index {
        if args.write_guids {
            entries.convert_to_guids(index);
        } else if args.write_ratingkeys {
            entries.convert_to_rating_keys(index);
        }
    }

    analyze_markers(&entries);

    if let Err(e) = entries.save(path) {
        error!("Unable to write {}: {}", path.display(), e);
        std::process::exit(1);
    }
}

/// Apply the requested offsets to every marker, flagging suspicious entries.
fn audit_markers(entries: &mut CustomEntries, args: &Args) {
    for (key, markers) in entries.markers.iter_mut() {
        for marker in markers.0.iter_mut() {
            let (Ok(start), Ok(end)) = (marker.start_ms(), marker.end_ms()) else {
                warn!("{} entry has invalid start/end values, leaving untouched", key);
                continue;
            };
            let length = end - start;

            let (start_shift, end_shift) = match args.offset {
                Some(offset) => (offset, offset),
                None => (
                    args.start_offset.unwrap_or(0),
                    args.end_offset.unwrap_or(0),
                ),
            };
            let mut start = start + start_shift;
            let mut end = end + end_shift;
            if start_shift != 0 {
                info!("Adjusting start offset by {} for {}", start_shift, start - start_shift);
            }
            if end_shift != 0 {
                info!("Adjusting end offset by {} for {}", end_shift, end - end_shift);
            }

            if length < 0 {
                warn!("{} entry is less than zero, likely invalid", key);
            }
            if let Some(expected) = args.duration {
                if length != expected {
                    warn!(
                        "{} does not equal specified duration of {} milliseconds ({})",
                        key, expected, length
                    );
                }
            }
            if start < 0 {
                info!("Start point {} is < 0, setting to 0", start);
                start = 0;
            }
            if end < 0 {
                info!("End point {} is < 0, setting to 0", end);
                end = 0;
            }
            marker.start = Value::from(start);
            marker.end = Value::from(end);
        }
    }
}

fn analyze_markers(entries: &CustomEntries) {
    let total = entries.markers.len();
    let populated = entries.markers.values().filter(|m| !m.0.is_empty()).count();
    if total > 0 {
        info!(
            "{} total entries, {} populated, {} empty ({:.0}%)",
            total,
            populated,
            total - populated,
            (populated as f64 / total as f64) * 100.0
        );
    }
}

/// Collect the server's current markers and matching chapters for an item
/// (every episode, for a show or season) into a custom entries document.
async fn dump_markers(
    server: &PlexServer,
    index: &LibraryIndex,
    config: &Config,
    identifier: &str,
    use_guids: bool,
) -> Option<CustomEntries> {
    let rating_key = if key_is_guid(identifier) {
        index.resolve_guid(identifier)?
    } else {
        identifier.parse().ok()?
    };
    let item = index.item(rating_key)?;

    let mut keys = Vec::new();
    match item.kind.as_str() {
        "show" | "season" => {
            // Every episode under the item, in key order for stable output.
            let mut episodes = collect_episodes(index, rating_key, &item.kind);
            episodes.sort_unstable();
            keys = episodes;
        }
        _ => keys.push(rating_key),
    }

    let mut dump = CustomEntries::default();
    for key in keys {
        let Ok(Some(media)) = server.item_metadata(key).await else {
            warn!("Unable to fetch metadata for {}", key);
            continue;
        };
        let entry_key = if use_guids {
            match index.key_to_guid(key) {
                Some(guid) => guid,
                None => {
                    warn!("Unable to resolve {} to a GUID, using ratingKey", key);
                    key.to_string()
                }
            }
        } else {
            key.to_string()
        };

        let mut markers = Vec::new();
        for marker in &media.markers {
            if config.skip.tags.contains(&marker.marker_type.to_lowercase()) {
                markers.push(raw_marker(marker.start, marker.end));
            }
        }
        for chapter in &media.chapters {
            if config.skip.tags.contains(&chapter.title.to_lowercase()) {
                markers.push(raw_marker(chapter.start, chapter.end));
            }
        }
        dump.markers.insert(entry_key, MarkerList(markers));
    }
    Some(dump)
}

fn collect_episodes(index: &LibraryIndex, rating_key: i64, kind: &str) -> Vec<i64> {
    // The index has no child listings, so scan for items pointing back at us.
    let mut episodes = Vec::new();
    for key in index.keys() {
        let Some(item) = index.item(key) else { continue };
        if item.kind != "episode" {
            continue;
        }
        let matches = match kind {
            "show" => item.grandparent_key == Some(rating_key),
            "season" => item.parent_key == Some(rating_key),
            _ => false,
        };
        if matches {
            episodes.push(key);
        }
    }
    episodes
}

fn raw_marker(start: i64, end: i64) -> RawMarker {
    RawMarker {
        start: Value::from(start),
        end: Value::from(end),
        ..RawMarker::default()
    }
}
