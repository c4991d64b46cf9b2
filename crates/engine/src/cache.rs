//! Full-response cache keyed by request target and declared variance.
//!
//! Entries for one `METHOD path?query` live together in one map slot. A lookup
//! picks the candidates for that key and then compares the request's values of
//! each candidate's own `Vary` headers, so differently varying responses to the
//! same URL can coexist.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use pool::{Request, Response};

/// Response header naming the cookies a `Vary: Cookie` response depends on.
pub const VARY_COOKIES_HEADER: &str = "x-vary-cookies";

/// Fixed per-entry overhead used when estimating cache size.
const ENTRY_OVERHEAD: usize = 1000;

const CACHEABLE_STATUSES: [u16; 3] = [200, 204, 301];

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub limit_bytes: usize,
    pub entry_limit_bytes: usize,
    pub refresh_ahead: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            limit_bytes: 64 * 1024 * 1024,
            entry_limit_bytes: 1_000_000,
            refresh_ahead: None,
        }
    }
}

struct CacheEntry {
    response: Response,
    /// Lowercased request header names paired with the values the response was rendered for.
    vary: Vec<(String, String)>,
    vary_cookies: Option<String>,
    expires_at: Instant,
    size: usize,
    last_used: AtomicU64,
}

impl CacheEntry {
    fn matches(&self, request: &Request) -> bool {
        self.vary.iter().all(|(name, stored)| {
            variance_value(request, name, self.vary_cookies.as_deref()) == *stored
        })
    }

    fn same_variance(&self, other: &CacheEntry) -> bool {
        self.vary == other.vary && self.vary_cookies == other.vary_cookies
    }
}

/// A cache hit. `refresh` is set when the entry is close enough to expiry
/// that the caller should re-render it in the background.
#[derive(Debug)]
pub struct CacheHit {
    pub response: Response,
    pub refresh: bool,
}

pub struct ResponseCache {
    config: CacheConfig,
    entries: DashMap<String, Vec<Arc<CacheEntry>>>,
    size: AtomicUsize,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    refreshing: DashMap<String, ()>,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            size: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            refreshing: DashMap::new(),
        }
    }

    /// `METHOD path?query`, the slot every variant of one target shares.
    pub fn key(request: &Request) -> String {
        format!("{} {}", request.method, request.target())
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Freshest unexpired entry whose variance matches `request`.
    pub fn lookup(&self, request: &Request) -> Option<CacheHit> {
        if !cacheable_request(request) {
            return None;
        }
        let key = Self::key(request);
        let now = Instant::now();

        let (found, saw_expired) = match self.entries.get(&key) {
            Some(list) => {
                let saw_expired = list.iter().any(|entry| entry.expires_at <= now);
                let found = list
                    .iter()
                    .filter(|entry| entry.expires_at > now && entry.matches(request))
                    .max_by_key(|entry| entry.expires_at)
                    .cloned();
                (found, saw_expired)
            }
            None => (None, false),
        };
        if saw_expired {
            self.evict_expired(&key, now);
        }

        let Some(entry) = found else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        entry.last_used.store(self.tick(), Ordering::Relaxed);
        self.hits.fetch_add(1, Ordering::Relaxed);

        let refresh = self
            .config
            .refresh_ahead
            .is_some_and(|window| entry.expires_at.duration_since(now) < window);
        Some(CacheHit {
            response: entry.response.clone(),
            refresh,
        })
    }

    /// Store `response` if it is cacheable. `vary_cookies` is the value of the
    /// response's cookie-scoping directive, already removed from its headers.
    pub fn store(&self, request: &Request, response: &Response, vary_cookies: Option<&str>) -> bool {
        if !cacheable_request(request) || !CACHEABLE_STATUSES.contains(&response.status) {
            return false;
        }
        if response.header("set-cookie").is_some() {
            return false;
        }
        let Some(max_age) = max_age(response) else {
            return false;
        };
        if response.body.len() > self.config.entry_limit_bytes {
            tracing::debug!("{} too large to cache ({} bytes)", request.target(), response.body.len());
            return false;
        }

        let mut names: Vec<String> = Vec::new();
        if let Some(vary) = response.header_joined("vary") {
            for name in vary.split(',').map(str::trim).filter(|name| !name.is_empty()) {
                if name == "*" {
                    return false;
                }
                let name = name.to_ascii_lowercase();
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        let vary_cookies = vary_cookies
            .map(str::trim)
            .filter(|names| !names.is_empty())
            .map(str::to_string);
        let vary = names
            .into_iter()
            .map(|name| {
                let value = variance_value(request, &name, vary_cookies.as_deref());
                (name, value)
            })
            .collect();

        let entry = Arc::new(CacheEntry {
            response: response.clone(),
            vary,
            vary_cookies,
            expires_at: Instant::now() + max_age,
            size: ENTRY_OVERHEAD + response.body.len(),
            last_used: AtomicU64::new(self.tick()),
        });

        if self.size() + entry.size > self.config.limit_bytes {
            self.prune(entry.size);
        }

        let key = Self::key(request);
        let mut list = self.entries.entry(key.clone()).or_default();
        match list.iter().position(|existing| existing.same_variance(&entry)) {
            Some(index) => {
                let old = std::mem::replace(&mut list[index], Arc::clone(&entry));
                self.size.fetch_sub(old.size, Ordering::Relaxed);
            }
            None => list.push(Arc::clone(&entry)),
        }
        self.size.fetch_add(entry.size, Ordering::Relaxed);
        drop(list);

        tracing::debug!("cached {} for {}s", key, max_age.as_secs());
        true
    }

    fn evict_expired(&self, key: &str, now: Instant) {
        if let Some(mut list) = self.entries.get_mut(key) {
            let mut freed = 0;
            list.retain(|entry| {
                let keep = entry.expires_at > now;
                if !keep {
                    freed += entry.size;
                }
                keep
            });
            self.size.fetch_sub(freed, Ordering::Relaxed);
        }
        self.entries.remove_if(key, |_, list| list.is_empty());
    }

    /// Make room for `incoming` bytes: expired entries go first, then the least recently used.
    pub fn prune(&self, incoming: usize) {
        let before = self.size();
        let now = Instant::now();
        let mut freed = 0;
        self.entries.retain(|_, list| {
            list.retain(|entry| {
                let keep = entry.expires_at > now;
                if !keep {
                    freed += entry.size;
                }
                keep
            });
            !list.is_empty()
        });
        self.size.fetch_sub(freed, Ordering::Relaxed);

        if self.size() + incoming > self.config.limit_bytes {
            let mut candidates: Vec<(u64, String, Arc<CacheEntry>)> = Vec::new();
            for item in self.entries.iter() {
                for entry in item.value() {
                    candidates.push((
                        entry.last_used.load(Ordering::Relaxed),
                        item.key().clone(),
                        Arc::clone(entry),
                    ));
                }
            }
            candidates.sort_by_key(|(last_used, _, _)| *last_used);

            for (_, key, entry) in candidates {
                if self.size() + incoming <= self.config.limit_bytes {
                    break;
                }
                self.remove_entry(&key, &entry);
            }
        }

        tracing::info!("pruned response cache from {} to {} bytes", before, self.size());
    }

    fn remove_entry(&self, key: &str, target: &Arc<CacheEntry>) {
        if let Some(mut list) = self.entries.get_mut(key) {
            let len = list.len();
            list.retain(|entry| !Arc::ptr_eq(entry, target));
            if list.len() < len {
                self.size.fetch_sub(target.size, Ordering::Relaxed);
            }
        }
        self.entries.remove_if(key, |_, list| list.is_empty());
    }

    /// Claim the right to refresh `key`. False if a refresh is already running.
    pub fn begin_refresh(&self, key: &str) -> bool {
        self.refreshing.insert(key.to_string(), ()).is_none()
    }

    pub fn end_refresh(&self, key: &str) {
        self.refreshing.remove(key);
    }

    /// Estimated bytes held.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Number of stored variants across all keys.
    pub fn len(&self) -> usize {
        self.entries.iter().map(|item| item.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> serde_json::Value {
        serde_json::json!({
            "entries": self.len(),
            "size_bytes": self.size(),
            "limit_bytes": self.config.limit_bytes,
            "hits": self.hits.load(Ordering::Relaxed),
            "misses": self.misses.load(Ordering::Relaxed),
        })
    }
}

fn cacheable_request(request: &Request) -> bool {
    matches!(request.method.as_str(), "GET" | "HEAD") && request.header("authorization").is_none()
}

/// `max-age` from `Cache-Control`. `None` when absent, zero, or overridden by
/// `no-store`, `no-cache` or `private`.
fn max_age(response: &Response) -> Option<Duration> {
    let cache_control = response.header_joined("cache-control")?;
    let mut max_age = None;
    for directive in cache_control.split(',').map(str::trim) {
        let directive = directive.to_ascii_lowercase();
        match directive.as_str() {
            "no-store" | "no-cache" | "private" => return None,
            _ => {
                if let Some(seconds) = directive.strip_prefix("max-age=") {
                    max_age = seconds.trim().parse::<u64>().ok();
                }
            }
        }
    }
    max_age.filter(|seconds| *seconds > 0).map(Duration::from_secs)
}

fn variance_value(request: &Request, name: &str, vary_cookies: Option<&str>) -> String {
    let value = request.header(name).unwrap_or_default();
    match vary_cookies {
        Some(filter) if name == "cookie" => extract_cookies(value, filter),
        _ => value.to_string(),
    }
}

/// Reduce a `Cookie` header to the cookies named in `filter`, in filter order.
/// A missing cookie contributes `name=` so its absence is part of the key too.
pub fn extract_cookies(cookies: &str, filter: &str) -> String {
    let jar: Vec<(&str, &str)> = cookies
        .split(';')
        .filter_map(|cookie| cookie.trim().split_once('='))
        .collect();

    filter
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| {
            let value = jar
                .iter()
                .find(|(key, _)| key.trim() == name)
                .map(|(_, value)| *value)
                .unwrap_or_default();
            format!("{}={}", name, value)
        })
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> ResponseCache {
        ResponseCache::new(CacheConfig::default())
    }

    fn cacheable(body: &str) -> Response {
        Response::ok(body.to_string()).with_header("Cache-Control", "max-age=60")
    }

    #[tokio::test(start_paused = true)]
    async fn caches_until_max_age_passes() {
        let cache = cache();
        let request = Request::new("GET", "/time/");
        assert!(cache.store(&request, &cacheable("a"), None));

        let hit = cache.lookup(&request).expect("hit");
        assert_eq!(hit.response.body, "a");

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.lookup(&request).is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn variance_headers_split_entries() {
        let cache = cache();
        let english = Request::new("GET", "/").with_header("Accept-Language", "en");
        let french = Request::new("GET", "/").with_header("Accept-Language", "fr");
        let vary = |body: &str| cacheable(body).with_header("Vary", "Accept-Language");

        cache.store(&english, &vary("hello"), None);
        cache.store(&french, &vary("bonjour"), None);

        let other_header = english.clone().with_header("User-Agent", "x");
        assert_eq!(cache.lookup(&english).expect("en").response.body, "hello");
        assert_eq!(cache.lookup(&french).expect("fr").response.body, "bonjour");
        assert_eq!(cache.lookup(&other_header).expect("shared").response.body, "hello");
        assert!(cache.lookup(&Request::new("GET", "/")).is_none());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn query_is_part_of_the_key() {
        let cache = cache();
        cache.store(&Request::new("GET", "/a").with_query("x=1"), &cacheable("1"), None);
        assert!(cache.lookup(&Request::new("GET", "/a").with_query("x=2")).is_none());
        assert!(cache.lookup(&Request::new("GET", "/a")).is_none());
    }

    #[test]
    fn same_variance_replaces_entry() {
        let cache = cache();
        let request = Request::new("GET", "/");
        cache.store(&request, &cacheable("old"), None);
        cache.store(&request, &cacheable("new!"), None);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.size(), ENTRY_OVERHEAD + 4);
        assert_eq!(cache.lookup(&request).expect("hit").response.body, "new!");
    }

    #[test]
    fn ineligible_responses_are_not_stored() {
        let cache = cache();
        let get = Request::new("GET", "/");
        assert!(!cache.store(&get, &Response::ok("no directive"), None));
        assert!(!cache.store(&Request::new("POST", "/"), &cacheable("x"), None));
        assert!(!cache.store(&get.clone().with_header("Authorization", "Basic x"), &cacheable("x"), None));
        assert!(!cache.store(&get, &cacheable("x").with_header("Set-Cookie", "a=b"), None));
        assert!(!cache.store(&get, &Response::ok("x").with_header("Cache-Control", "max-age=0"), None));
        assert!(!cache.store(&get, &Response::ok("x").with_header("Cache-Control", "private, max-age=60"), None));
        assert!(!cache.store(&get, &cacheable("x").with_header("Vary", "*"), None));
        let mut error = cacheable("x");
        error.status = 500;
        assert!(!cache.store(&get, &error, None));
        assert!(cache.is_empty());
    }

    #[test]
    fn cookie_filter_ignores_unrelated_cookies() {
        let cache = cache();
        let response = cacheable("session page").with_header("Vary", "Cookie");
        let first = Request::new("GET", "/").with_header("Cookie", "session=1; tracking=abc");
        let second = Request::new("GET", "/").with_header("Cookie", "tracking=xyz; session=1");
        let other = Request::new("GET", "/").with_header("Cookie", "session=2");

        cache.store(&first, &response, Some("session"));
        assert!(cache.lookup(&second).is_some());
        assert!(cache.lookup(&other).is_none());
    }

    #[test]
    fn extract_cookies_follows_filter_order() {
        assert_eq!(extract_cookies("b=2; a=1; c=3", "a, b"), "a=1; b=2");
        assert_eq!(extract_cookies("", "a"), "a=");
    }

    #[test]
    fn oversized_entries_are_rejected() {
        let cache = ResponseCache::new(CacheConfig {
            entry_limit_bytes: 4,
            ..CacheConfig::default()
        });
        assert!(!cache.store(&Request::new("GET", "/"), &cacheable("too long"), None));
    }

    #[test]
    fn prune_evicts_least_recently_used() {
        let cache = ResponseCache::new(CacheConfig {
            limit_bytes: 2 * ENTRY_OVERHEAD + 10,
            ..CacheConfig::default()
        });
        let a = Request::new("GET", "/a");
        let b = Request::new("GET", "/b");
        let c = Request::new("GET", "/c");
        cache.store(&a, &cacheable("a"), None);
        cache.store(&b, &cacheable("b"), None);
        assert!(cache.lookup(&a).is_some());

        cache.store(&c, &cacheable("c"), None);
        assert!(cache.lookup(&a).is_some());
        assert!(cache.lookup(&b).is_none());
        assert!(cache.lookup(&c).is_some());
        assert!(cache.size() <= 2 * ENTRY_OVERHEAD + 10);
    }

    #[tokio::test(start_paused = true)]
    async fn hits_near_expiry_ask_for_refresh() {
        let cache = ResponseCache::new(CacheConfig {
            refresh_ahead: Some(Duration::from_secs(10)),
            ..CacheConfig::default()
        });
        let request = Request::new("GET", "/");
        cache.store(&request, &cacheable("x"), None);
        assert!(!cache.lookup(&request).expect("hit").refresh);

        tokio::time::advance(Duration::from_secs(55)).await;
        assert!(cache.lookup(&request).expect("hit").refresh);

        let key = ResponseCache::key(&request);
        assert!(cache.begin_refresh(&key));
        assert!(!cache.begin_refresh(&key));
        cache.end_refresh(&key);
        assert!(cache.begin_refresh(&key));
    }
}
