use log::debug;
use std::collections::HashMap;

/// One library item as seen during the startup walk. Only what identifier
/// resolution needs: keys, numbering, and external GUIDs.
#[derive(Debug, Clone)]
pub struct LibraryItem {
    pub rating_key: i64,
    pub kind: String,
    pub title: String,
    pub guids: Vec<String>,
    pub parent_key: Option<i64>,
    pub grandparent_key: Option<i64>,
    pub season_number: Option<u32>,
    pub episode_number: Option<u32>,
}

/// Bidirectional identifier lookup built once from a full library walk and
/// treated as read-only afterwards.
#[derive(Debug, Default)]
pub struct LibraryIndex {
    by_key: HashMap<i64, LibraryItem>,
    by_guid: HashMap<String, i64>,
    seasons: HashMap<(i64, u32), i64>,
    episodes: HashMap<(i64, u32, u32), i64>,
}

impl LibraryIndex {
    pub fn build(items: Vec<LibraryItem>) -> Self {
        let mut index = LibraryIndex::default();
        for item in items {
            for guid in &item.guids {
                index.by_guid.insert(guid.clone(), item.rating_key);
            }
            match item.kind.as_str() {
                "season" => {
                    if let (Some(show), Some(season)) = (item.parent_key, item.season_number) {
                        index.seasons.insert((show, season), item.rating_key);
                    }
                }
                "episode" => {
                    if let (Some(show), Some(season), Some(episode)) =
                        (item.grandparent_key, item.season_number, item.episode_number)
                    {
                        index.episodes.insert((show, season, episode), item.rating_key);
                    }
                }
                _ => {}
            }
            index.by_key.insert(item.rating_key, item);
        }
        debug!("Library index built with {} items, {} GUIDs", index.by_key.len(), index.by_guid.len());
        index
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn item(&self, rating_key: i64) -> Option<&LibraryItem> {
        self.by_key.get(&rating_key)
    }

    pub fn keys(&self) -> impl Iterator<Item = i64> + '_ {
        self.by_key.keys().copied()
    }

    /// Resolve an external GUID to a ratingKey. A `.S` suffix addresses a
    /// season of the show the GUID names, `.S.E` an episode.
    pub fn resolve_guid(&self, guid: &str) -> Option<i64> {
        let parts: Vec<&str> = guid.split('.').collect();
        let base_key = *self.by_guid.get(parts[0])?;
        let base = self.by_key.get(&base_key)?;
        match parts.len() {
            1 => Some(base_key),
            2 if base.kind == "show" => {
                let season: u32 = parts[1].parse().ok()?;
                self.seasons.get(&(base_key, season)).copied()
            }
            3 if base.kind == "show" => {
                let season: u32 = parts[1].parse().ok()?;
                let episode: u32 = parts[2].parse().ok()?;
                self.episodes.get(&(base_key, season, episode)).copied()
            }
            _ => Some(base_key),
        }
    }

    /// Resolve a ratingKey to a portable GUID. Seasons and episodes are
    /// expressed against their show's GUID with `.S` / `.S.E` suffixes.
    pub fn key_to_guid(&self, rating_key: i64) -> Option<String> {
        self.key_to_guid_with_prefix(rating_key, "tmdb://")
    }

    pub fn key_to_guid_with_prefix(&self, rating_key: i64, prefix: &str) -> Option<String> {
        let item = self.by_key.get(&rating_key)?;
        match item.kind.as_str() {
            "episode" => {
                let show = self.by_key.get(&item.grandparent_key?)?;
                let guid = show.guids.iter().find(|g| g.starts_with(prefix))?;
                Some(format!("{}.{}.{}", guid, item.season_number?, item.episode_number?))
            }
            "season" => {
                let show = self.by_key.get(&item.parent_key?)?;
                let guid = show.guids.iter().find(|g| g.starts_with(prefix))?;
                Some(format!("{}.{}", guid, item.season_number?))
            }
            _ => item.guids.iter().find(|g| g.starts_with(prefix)).cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> LibraryIndex {
        LibraryIndex::build(vec![
            LibraryItem {
                rating_key: 100,
                kind: "show".to_string(),
                title: "Some Show".to_string(),
                guids: vec!["tmdb://1399".to_string(), "imdb://tt0944947".to_string()],
                parent_key: None,
                grandparent_key: None,
                season_number: None,
                episode_number: None,
            },
            LibraryItem {
                rating_key: 110,
                kind: "season".to_string(),
                title: "Season 1".to_string(),
                guids: vec![],
                parent_key: Some(100),
                grandparent_key: None,
                season_number: Some(1),
                episode_number: None,
            },
            LibraryItem {
                rating_key: 111,
                kind: "episode".to_string(),
                title: "Pilot".to_string(),
                guids: vec![],
                parent_key: Some(110),
                grandparent_key: Some(100),
                season_number: Some(1),
                episode_number: Some(2),
            },
            LibraryItem {
                rating_key: 200,
                kind: "movie".to_string(),
                title: "Some Movie".to_string(),
                guids: vec!["tmdb://603".to_string()],
                parent_key: None,
                grandparent_key: None,
                season_number: None,
                episode_number: None,
            },
        ])
    }

    #[test]
    fn resolves_plain_guids() {
        let index = sample();
        assert_eq!(index.resolve_guid("tmdb://1399"), Some(100));
        assert_eq!(index.resolve_guid("imdb://tt0944947"), Some(100));
        assert_eq!(index.resolve_guid("tmdb://603"), Some(200));
        assert_eq!(index.resolve_guid("tmdb://999"), None);
    }

    #[test]
    fn resolves_season_and_episode_suffixes() {
        let index = sample();
        assert_eq!(index.resolve_guid("tmdb://1399.1"), Some(110));
        assert_eq!(index.resolve_guid("tmdb://1399.1.2"), Some(111));
        assert_eq!(index.resolve_guid("tmdb://1399.2"), None);
        assert_eq!(index.resolve_guid("tmdb://1399.1.9"), None);
    }

    #[test]
    fn keys_resolve_back_to_guids() {
        let index = sample();
        assert_eq!(index.key_to_guid(200), Some("tmdb://603".to_string()));
        assert_eq!(index.key_to_guid(110), Some("tmdb://1399.1".to_string()));
        assert_eq!(index.key_to_guid(111), Some("tmdb://1399.1.2".to_string()));
        assert_eq!(
            index.key_to_guid_with_prefix(100, "imdb://"),
            Some("imdb://tt0944947".to_string())
        );
    }
}
