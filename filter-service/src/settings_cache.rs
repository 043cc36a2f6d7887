//! TTL-cached mirror of persisted "last seen" timestamps.
//!
//! Each setting key (one per filter instance) owns its own entry and lock, so
//! filters never contend with each other. An entry older than the TTL is
//! reloaded from the `SettingStore` before it is trusted; the reload merges
//! with what is in memory and keeps the newer timestamp for every type, so a
//! value written since the last load is never lost.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use datum_client::domain::{decode_timestamp, Setting};
use datum_client::SettingStore;
use parking_lot::Mutex;
use time::OffsetDateTime;

pub const DEFAULT_CACHE_SECS: u64 = 15;

#[derive(Default)]
struct CacheEntry {
    loaded_at: Option<Instant>,
    seen: HashMap<String, OffsetDateTime>,
}

impl CacheEntry {
    fn is_stale(&self, ttl: Duration) -> bool {
        match self.loaded_at {
            Some(at) => at.elapsed() > ttl,
            None => true,
        }
    }

    fn merge(&mut self, setting_type: String, ts: OffsetDateTime) {
        self.seen
            .entry(setting_type)
            .and_modify(|cur| {
                if ts > *cur {
                    *cur = ts;
                }
            })
            .or_insert(ts);
    }
}

pub struct SettingCache {
    store: Arc<dyn SettingStore>,
    ttl: Duration,
    entries: Mutex<HashMap<String, Arc<Mutex<CacheEntry>>>>,
}

impl SettingCache {
    pub fn new(store: Arc<dyn SettingStore>) -> Self {
        Self::with_ttl(store, Duration::from_secs(DEFAULT_CACHE_SECS))
    }

    pub fn with_ttl(store: Arc<dyn SettingStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn entry(&self, setting_key: &str) -> Arc<Mutex<CacheEntry>> {
        self.entries
            .lock()
            .entry(setting_key.to_string())
            .or_default()
            .clone()
    }

    fn refresh(&self, setting_key: &str, entry: &mut CacheEntry) {
        if !entry.is_stale(self.ttl) {
            return;
        }
        match self.store.get_settings(setting_key) {
            Ok(pairs) => {
                let count = pairs.len();
                for (setting_type, value) in pairs {
                    match decode_timestamp(&value) {
                        Some(ts) => entry.merge(setting_type, ts),
                        None => tracing::warn!(
                            setting_key = %setting_key,
                            setting_type = %setting_type,
                            value = %value,
                            "ignoring setting that is not a hex timestamp"
                        ),
                    }
                }
                entry.loaded_at = Some(Instant::now());
                tracing::trace!(setting_key = %setting_key, count, "loaded settings");
            }
            Err(e) => {
                // Leave loaded_at alone so the next call tries again.
                metrics::counter!("setting_store_errors_total").increment(1);
                tracing::warn!(
                    error = %e,
                    setting_key = %setting_key,
                    "failed to load settings; treating unknown subjects as never seen"
                );
            }
        }
    }

    fn persist(&self, setting_key: &str, setting_type: &str, at: OffsetDateTime) {
        let setting = Setting::volatile_timestamp(setting_key, setting_type, at);
        if let Err(e) = self.store.store_setting(&setting) {
            metrics::counter!("setting_store_errors_total").increment(1);
            tracing::warn!(
                error = %e,
                setting_key = %setting_key,
                setting_type = %setting_type,
                "failed to persist last seen date; keeping cached value"
            );
        }
    }

    /// When `setting_type` was last recorded under `setting_key`.
    pub fn last_seen(&self, setting_key: &str, setting_type: &str) -> Option<OffsetDateTime> {
        let entry = self.entry(setting_key);
        let mut entry = entry.lock();
        self.refresh(setting_key, &mut entry);
        entry.seen.get(setting_type).copied()
    }

    /// Record `at` as the last time `setting_type` was seen. The store is
    /// written before this returns; a failed write is logged and the cached
    /// value kept.
    pub fn record_seen(&self, setting_key: &str, setting_type: &str, at: OffsetDateTime) {
        let entry = self.entry(setting_key);
        let mut entry = entry.lock();
        self.refresh(setting_key, &mut entry);
        entry.seen.insert(setting_type.to_string(), at);
        self.persist(setting_key, setting_type, at);
    }

    /// Look up and record in one step: if `setting_type` has never been seen,
    /// or at least `min_interval` has passed between its last recorded time and
    /// `at`, record `at` and return `true`. Otherwise leave everything as is
    /// and return `false`.
    pub fn check_and_record(
        &self,
        setting_key: &str,
        setting_type: &str,
        at: OffsetDateTime,
        min_interval: Duration,
    ) -> bool {
        let entry = self.entry(setting_key);
        let mut entry = entry.lock();
        self.refresh(setting_key, &mut entry);
        if let Some(last) = entry.seen.get(setting_type) {
            let elapsed = at - *last;
            if elapsed < min_interval {
                tracing::debug!(
                    setting_key = %setting_key,
                    setting_type = %setting_type,
                    elapsed_ms = elapsed.whole_milliseconds() as i64,
                    "seen within the last {}ms",
                    min_interval.as_millis()
                );
                return false;
            }
        }
        entry.seen.insert(setting_type.to_string(), at);
        self.persist(setting_key, setting_type, at);
        true
    }

    /// Drop every cached entry; the next access reloads from the store.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use datum_client::domain::{encode_timestamp, SettingFlag};
    use datum_client::store::InMemorySettingStore;
    use datum_client::StoreError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use time::macros::datetime;

    const KEY: &str = "test/valueCaptured";

    /// A store whose reads and writes can be switched to fail.
    #[derive(Default)]
    pub(crate) struct FlakySettingStore {
        pub inner: InMemorySettingStore,
        pub fail_reads: std::sync::atomic::AtomicBool,
        pub fail_writes: std::sync::atomic::AtomicBool,
        pub reads: AtomicUsize,
    }

    impl SettingStore for FlakySettingStore {
        fn get_settings(&self, key: &str) -> Result<Vec<(String, String)>, StoreError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("read refused".into()));
            }
            self.inner.get_settings(key)
        }

        fn store_setting(&self, setting: &Setting) -> Result<(), StoreError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("write refused".into()));
            }
            self.inner.store_setting(setting)
        }
    }

    #[test]
    fn record_persists_volatile_hex_timestamp() {
        let store = Arc::new(InMemorySettingStore::new());
        let cache = SettingCache::new(store.clone());
        let at = datetime!(2024-01-01 00:00:00 UTC);

        cache.record_seen(KEY, "FILTER_ME", at);

        let writes = store.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].key, KEY);
        assert_eq!(writes[0].setting_type, "FILTER_ME");
        assert_eq!(writes[0].value, encode_timestamp(at));
        assert!(writes[0].flags.contains(&SettingFlag::Volatile));
        assert!(writes[0].flags.contains(&SettingFlag::IgnoreModificationDate));
        assert_eq!(cache.last_seen(KEY, "FILTER_ME"), Some(at));
    }

    #[test]
    fn loads_existing_settings_once_within_ttl() {
        let store = Arc::new(FlakySettingStore::default());
        let at = datetime!(2024-01-01 00:00:00 UTC);
        store.inner.seed(Setting::volatile_timestamp(KEY, "a", at));
        let cache = SettingCache::with_ttl(store.clone(), Duration::from_secs(60));

        assert_eq!(cache.last_seen(KEY, "a"), Some(at));
        assert_eq!(cache.last_seen(KEY, "b"), None);
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stale_entry_reloads_without_regressing_newer_writes() {
        let store = Arc::new(FlakySettingStore::default());
        let cache = SettingCache::with_ttl(store.clone(), Duration::ZERO);
        let newer = datetime!(2024-01-01 00:10:00 UTC);
        let older = datetime!(2024-01-01 00:00:00 UTC);

        // write goes to memory only
        store.fail_writes.store(true, Ordering::SeqCst);
        cache.record_seen(KEY, "a", newer);
        store.fail_writes.store(false, Ordering::SeqCst);

        // another process persisted an older value meanwhile
        store.inner.seed(Setting::volatile_timestamp(KEY, "a", older));
        std::thread::sleep(Duration::from_millis(2));

        assert_eq!(cache.last_seen(KEY, "a"), Some(newer));
        assert!(store.reads.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn stale_entry_picks_up_newer_persisted_values() {
        let store = Arc::new(FlakySettingStore::default());
        let cache = SettingCache::with_ttl(store.clone(), Duration::ZERO);
        assert_eq!(cache.last_seen(KEY, "a"), None);

        let at = datetime!(2024-01-01 00:00:00 UTC);
        store.inner.seed(Setting::volatile_timestamp(KEY, "a", at));
        std::thread::sleep(Duration::from_millis(2));

        assert_eq!(cache.last_seen(KEY, "a"), Some(at));
    }

    #[test]
    fn read_failure_means_never_seen() {
        let store = Arc::new(FlakySettingStore::default());
        store
            .inner
            .seed(Setting::volatile_timestamp(KEY, "a", datetime!(2024-01-01 00:00:00 UTC)));
        store.fail_reads.store(true, Ordering::SeqCst);
        let cache = SettingCache::new(store.clone());

        assert_eq!(cache.last_seen(KEY, "a"), None);

        // retried on the next access once the store recovers
        store.fail_reads.store(false, Ordering::SeqCst);
        assert!(cache.last_seen(KEY, "a").is_some());
    }

    #[test]
    fn check_and_record_enforces_interval() {
        let store = Arc::new(InMemorySettingStore::new());
        let cache = SettingCache::new(store.clone());
        let t0 = datetime!(2024-01-01 00:00:00 UTC);
        let second = Duration::from_secs(1);

        assert!(cache.check_and_record(KEY, "a", t0, second));
        assert!(!cache.check_and_record(KEY, "a", t0 + time::Duration::milliseconds(999), second));
        assert!(cache.check_and_record(KEY, "a", t0 + time::Duration::seconds(1), second));
        assert_eq!(store.writes().len(), 2);
    }

    #[test]
    fn ignores_undecodable_values() {
        let store = Arc::new(InMemorySettingStore::new());
        store.seed(Setting::new(KEY, "a", "zz-not-hex"));
        let cache = SettingCache::new(store);
        assert_eq!(cache.last_seen(KEY, "a"), None);
    }

    #[test]
    fn clear_forces_reload() {
        let store = Arc::new(FlakySettingStore::default());
        let cache = SettingCache::new(store.clone());
        cache.last_seen(KEY, "a");
        cache.last_seen(KEY, "a");
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);

        cache.clear();
        cache.last_seen(KEY, "a");
        assert_eq!(store.reads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn concurrent_callers_pass_one_window_once() {
        let store = Arc::new(InMemorySettingStore::new());
        let cache = Arc::new(SettingCache::new(store.clone()));
        let at = datetime!(2024-01-01 00:00:00 UTC);
        let passed = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let passed = passed.clone();
                std::thread::spawn(move || {
                    if cache.check_and_record(KEY, "src", at, Duration::from_secs(1)) {
                        passed.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(passed.load(Ordering::SeqCst), 1);
        assert_eq!(store.writes().len(), 1);
    }
}
