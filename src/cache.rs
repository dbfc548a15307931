//! Memoized pipeline results, keyed by the full input tuple.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::data::Sources;
use crate::pipeline::{self, Analysis, Request};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    version: String,
    request: Request,
}

/// Results are pure functions of (sources, selection, filter), so the key
/// carries all three. Seeing a new source version drops every entry.
#[derive(Debug)]
pub struct ResultCache {
    version: Option<String>,
    entries: HashMap<CacheKey, Arc<Analysis>>,
    capacity: usize,
}

impl ResultCache {
    pub fn new(capacity: usize) -> Self {
        ResultCache {
            version: None,
            entries: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every entry when `sources` carries a version not seen before.
    fn sync_version(&mut self, sources: &Sources) {
        if self.version.as_deref() == Some(sources.version.as_str()) {
            return;
        }
        if self.version.is_some() {
            tracing::info!("Source version changed; clearing {} cached results", self.entries.len());
        }
        self.entries.clear();
        self.version = Some(sources.version.clone());
    }

    fn key(sources: &Sources, request: &Request) -> CacheKey {
        CacheKey {
            version: sources.version.clone(),
            request: request.clone(),
        }
    }

    pub fn get(&mut self, sources: &Sources, request: &Request) -> Option<Arc<Analysis>> {
        self.sync_version(sources);
        self.entries.get(&Self::key(sources, request)).cloned()
    }

    /// Stores a result computed outside the cache. Two callers racing on the
    /// same key both compute; the later insert wins and both are equal.
    pub fn insert(&mut self, sources: &Sources, request: &Request, analysis: Arc<Analysis>) {
        self.sync_version(sources);
        // Interactive use revisits a handful of selections; a full reset
        // keeps the bound without tracking recency.
        if self.entries.len() >= self.capacity {
            self.entries.clear();
        }
        self.entries.insert(Self::key(sources, request), analysis);
    }
}

/// Looks `request` up, computing it without holding the lock on a miss.
pub fn cached_run(cache: &Mutex<ResultCache>, sources: &Sources, request: &Request) -> Arc<Analysis> {
    let lock = || cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let hit = lock().get(sources, request);
    if let Some(hit) = hit {
        return hit;
    }
    let analysis = Arc::new(pipeline::run(sources, request));
    let mut cache = lock();
    cache.insert(sources, request, Arc::clone(&analysis));
    tracing::debug!("Cached result for groups {} ({} entries)", request.selection, cache.len());
    analysis
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{Filter, LocalityFilter};
    use crate::ranking::tests::zone;
    use crate::selection::GroupSelection;
    use crate::types::{Group, ZoneDataset};

    fn sources(version: &str) -> Sources {
        let dataset = ZoneDataset {
            zones: vec![zone(1, [1, 2, 3, 4]), zone(2, [4, 3, 2, 1])],
            available_groups: Group::ALL.into_iter().collect(),
        };
        Sources::new(dataset, version)
    }

    fn request(groups: &str, locality: Option<&str>) -> Request {
        Request {
            selection: GroupSelection::parse(groups).unwrap(),
            filter: Filter {
                locality: LocalityFilter::parse(locality),
                rank_range: None,
            },
        }
    }

    #[test]
    fn repeats_hit_the_cache() {
        let cache = Mutex::new(ResultCache::new(8));
        let s = sources("v1");
        let a = cached_run(&cache, &s, &request("A", None));
        let b = cached_run(&cache, &s, &request("A", None));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.lock().unwrap().len(), 1);
    }

    #[test]
    fn filter_is_part_of_the_key() {
        let cache = Mutex::new(ResultCache::new(8));
        let s = sources("v1");
        let all = cached_run(&cache, &s, &request("A", None));
        let none = cached_run(&cache, &s, &request("A", Some("Suba")));
        assert_eq!(all.rows.len(), 2);
        assert_eq!(none.rows.len(), 0);
        assert_eq!(cache.lock().unwrap().len(), 2);
    }

    #[test]
    fn new_version_invalidates_everything() {
        let cache = Mutex::new(ResultCache::new(8));
        let a = cached_run(&cache, &sources("v1"), &request("A", None));
        cached_run(&cache, &sources("v1"), &request("B", None));
        assert_eq!(cache.lock().unwrap().len(), 2);

        let b = cached_run(&cache, &sources("v2"), &request("A", None));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(cache.lock().unwrap().len(), 1);
    }

    #[test]
    fn capacity_bounds_entries() {
        let cache = Mutex::new(ResultCache::new(2));
        let s = sources("v1");
        for groups in ["A", "B", "C"] {
            cached_run(&cache, &s, &request(groups, None));
        }
        assert!(cache.lock().unwrap().len() <= 2);
        assert!(!cache.lock().unwrap().is_empty());
    }

    #[test]
    fn lock_is_free_while_computing() {
        let cache = Mutex::new(ResultCache::new(8));
        let s = sources("v1");
        let req = request("A", None);
        assert!(cache.lock().unwrap().get(&s, &req).is_none());

        // A miss leaves the cache unlocked, so another caller can look up
        // or insert before the first computation is stored.
        let computed = Arc::new(pipeline::run(&s, &req));
        cache.lock().unwrap().insert(&s, &req, Arc::clone(&computed));
        let hit = cached_run(&cache, &s, &req);
        assert!(Arc::ptr_eq(&hit, &computed));
    }
}
