pub mod binge;
pub mod commander;
pub mod config;
pub mod custom_entries;
pub mod library;
pub mod listener;
pub mod server;
pub mod session;
pub mod skipper;

pub const APP_NAME: &str = "autoskip-for-plex";
pub const USER_AGENT: &str = concat!("AutoskipForPlex/", env!("CARGO_PKG_VERSION"));
