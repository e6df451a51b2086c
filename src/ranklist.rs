//! Contest ranklist cache.
//!
//! Serves a contest's sorted team-score list from a shared cache while
//! throttling expensive re-aggregation. Entries are written with a 1-year
//! nominal TTL so the remaining TTL doubles as the entry's age; an entry
//! older than one second qualifies for recomputation, but only the caller
//! that atomically claims the contest's obsolete flag performs it. Everyone
//! else reads the cached list, stale by at most about a second.
//!
//! The write side (`mark_obsolete`) only sets the flag; recomputation is
//! always pulled lazily by the next qualifying read.

use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::debug;

use crate::error::Result;
use crate::types::TeamScore;

/// Nominal cache entry lifetime: one year.
const NOMINAL_TTL_SECS: u64 = 31_536_000;

/// An entry younger than this never triggers recomputation.
const MAX_FRESH_MS: i64 = 1000;

fn ranklist_key(contest_id: &str) -> String {
    format!("ranklist:{}", contest_id)
}

fn obsolete_key(contest_id: &str) -> String {
    format!("ranklist:{}:obsolete", contest_id)
}

/// Cache store capability: per-key TTL plus an atomically claimable flag.
/// `take_flag` must read and clear in one operation so at most one racer
/// wins a recomputation cycle.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Value and remaining TTL in milliseconds, or None when absent/expired.
    async fn get_with_pttl(&self, key: &str) -> Result<Option<(String, i64)>>;
    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;
    async fn set_flag(&self, key: &str) -> Result<()>;
    async fn take_flag(&self, key: &str) -> Result<bool>;
}

/// Sorted projection of the persisted team scores, owned by the scoring
/// collaborator: `(totalScore desc, lastTime asc)` within one contest.
#[async_trait]
pub trait TeamScoreStore: Send + Sync {
    async fn fetch_ranklist(&self, contest_id: &str) -> Result<Vec<TeamScore>>;
}

pub struct RanklistCache {
    cache: Arc<dyn CacheStore>,
    scores: Arc<dyn TeamScoreStore>,
}

impl RanklistCache {
    pub fn new(cache: Arc<dyn CacheStore>, scores: Arc<dyn TeamScoreStore>) -> Self {
        Self { cache, scores }
    }

    /// Fetch a contest's ranklist, recomputing at most once per second per
    /// contest and only when the contest was marked obsolete.
    pub async fn get_ranklist(&self, contest_id: &str) -> Result<Vec<TeamScore>> {
        let key = ranklist_key(contest_id);

        if let Some((cached, pttl_ms)) = self.cache.get_with_pttl(&key).await? {
            let age_ms = NOMINAL_TTL_SECS as i64 * 1000 - pttl_ms;
            if age_ms <= MAX_FRESH_MS || !self.cache.take_flag(&obsolete_key(contest_id)).await? {
                return Ok(serde_json::from_str(&cached)?);
            }
        }

        debug!("Recomputing ranklist for contest {}", contest_id);
        let ranklist = self.scores.fetch_ranklist(contest_id).await?;
        self.cache
            .set_with_ttl(&key, &serde_json::to_string(&ranklist)?, NOMINAL_TTL_SECS)
            .await?;
        Ok(ranklist)
    }

    /// Mark a contest's ranklist as needing recomputation. Called whenever a
    /// team's score changes; never recomputes by itself.
    pub async fn mark_obsolete(&self, contest_id: &str) -> Result<()> {
        mark_obsolete(self.cache.as_ref(), contest_id).await
    }
}

/// Flag a contest's ranklist for lazy recomputation by its next reader.
/// Write-side entry point for components that never read the ranklist.
pub async fn mark_obsolete(cache: &dyn CacheStore, contest_id: &str) -> Result<()> {
    cache.set_flag(&obsolete_key(contest_id)).await
}

/// Redis-backed cache store (GET/PTTL, SET/EXPIRE, GETDEL).
pub struct RedisCacheStore {
    conn: MultiplexedConnection,
}

impl RedisCacheStore {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get_with_pttl(&self, key: &str) -> Result<Option<(String, i64)>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        match value {
            Some(value) => {
                let pttl: i64 = conn.pttl(key).await?;
                Ok(Some((value, pttl)))
            }
            None => Ok(None),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value).await?;
        conn.expire::<_, ()>(key, ttl_secs as i64).await?;
        Ok(())
    }

    async fn set_flag(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, "1").await?;
        Ok(())
    }

    async fn take_flag(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let taken: Option<String> = redis::cmd("GETDEL")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(taken.is_some())
    }
}

/// In-memory cache store with real TTL accounting, for tests and embedding.
#[derive(Default)]
pub struct MemoryCacheStore {
    inner: std::sync::Mutex<MemoryCacheInner>,
}

#[derive(Default)]
struct MemoryCacheInner {
    entries: std::collections::HashMap<String, (String, std::time::Instant)>,
    flags: std::collections::HashSet<String>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get_with_pttl(&self, key: &str) -> Result<Option<(String, i64)>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.entries.get(key).and_then(|(value, deadline)| {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                None
            } else {
                Some((value.clone(), remaining.as_millis() as i64))
            }
        }))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.insert(
            key.to_string(),
            (
                value.to_string(),
                std::time::Instant::now() + std::time::Duration::from_secs(ttl_secs),
            ),
        );
        Ok(())
    }

    async fn set_flag(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.flags.insert(key.to_string());
        Ok(())
    }

    async fn take_flag(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.flags.remove(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Score store double that counts how many sorted queries it served.
    #[derive(Default)]
    struct CountingScoreStore {
        teams: std::sync::Mutex<Vec<TeamScore>>,
        fetches: AtomicUsize,
    }

    impl CountingScoreStore {
        fn with_teams(teams: Vec<TeamScore>) -> Self {
            Self {
                teams: std::sync::Mutex::new(teams),
                fetches: AtomicUsize::new(0),
            }
        }

        fn fetch_count(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TeamScoreStore for CountingScoreStore {
        async fn fetch_ranklist(&self, contest_id: &str) -> Result<Vec<TeamScore>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let mut teams: Vec<TeamScore> = self
                .teams
                .lock()
                .unwrap()
                .iter()
                .filter(|t| t.contest_id == contest_id)
                .cloned()
                .collect();
            teams.sort_by(|a, b| {
                b.total_score
                    .cmp(&a.total_score)
                    .then(a.last_time.cmp(&b.last_time))
            });
            Ok(teams)
        }
    }

    fn team(id: &str, total_score: u32, last_time: u64) -> TeamScore {
        TeamScore {
            id: id.to_string(),
            contest_id: "c1".to_string(),
            scores: HashMap::new(),
            time: HashMap::new(),
            total_score,
            last_time,
        }
    }

    fn cache_with(
        teams: Vec<TeamScore>,
    ) -> (RanklistCache, Arc<MemoryCacheStore>, Arc<CountingScoreStore>) {
        let store = Arc::new(MemoryCacheStore::new());
        let scores = Arc::new(CountingScoreStore::with_teams(teams));
        (
            RanklistCache::new(store.clone(), scores.clone()),
            store,
            scores,
        )
    }

    /// Insert a cache entry whose remaining TTL marks it older than the
    /// freshness window.
    async fn insert_stale_entry(store: &MemoryCacheStore, contest_id: &str, value: &str) {
        store
            .set_with_ttl(&ranklist_key(contest_id), value, NOMINAL_TTL_SECS - 5)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_first_read_populates_cache_sorted() {
        let (cache, store, scores) = cache_with(vec![
            team("t1", 50, 900),
            team("t2", 70, 500),
            team("t3", 70, 300),
        ]);

        let ranklist = cache.get_ranklist("c1").await.unwrap();
        let ids: Vec<&str> = ranklist.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, ["t3", "t2", "t1"]);
        assert_eq!(scores.fetch_count(), 1);

        assert!(store
            .get_with_pttl(&ranklist_key("c1"))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_reads_within_freshness_window_are_identical() {
        let (cache, _, scores) = cache_with(vec![team("t1", 10, 100)]);

        let first = cache.get_ranklist("c1").await.unwrap();
        // A score change marks the contest obsolete, but the entry is still
        // inside the freshness window.
        cache.mark_obsolete("c1").await.unwrap();
        let second = cache.get_ranklist("c1").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(scores.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_entry_without_flag_served_verbatim() {
        let (cache, store, scores) = cache_with(vec![team("t1", 10, 100)]);

        let stale = serde_json::to_string(&vec![team("old", 1, 1)]).unwrap();
        insert_stale_entry(&store, "c1", &stale).await;

        let ranklist = cache.get_ranklist("c1").await.unwrap();
        assert_eq!(ranklist[0].id, "old");
        assert_eq!(scores.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_entry_with_flag_recomputes_and_clears_claim() {
        let (cache, store, scores) = cache_with(vec![team("t1", 10, 100)]);

        let stale = serde_json::to_string(&vec![team("old", 1, 1)]).unwrap();
        insert_stale_entry(&store, "c1", &stale).await;
        cache.mark_obsolete("c1").await.unwrap();

        let ranklist = cache.get_ranklist("c1").await.unwrap();
        assert_eq!(ranklist[0].id, "t1");
        assert_eq!(scores.fetch_count(), 1);

        // The claim was consumed and the entry refreshed, so the next read
        // serves from cache.
        let again = cache.get_ranklist("c1").await.unwrap();
        assert_eq!(again, ranklist);
        assert_eq!(scores.fetch_count(), 1);
        assert!(!store.take_flag(&obsolete_key("c1")).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_qualifying_reads_have_single_winner() {
        let (cache, store, scores) = cache_with(vec![team("t1", 10, 100)]);

        let stale = serde_json::to_string(&vec![team("old", 1, 1)]).unwrap();
        insert_stale_entry(&store, "c1", &stale).await;
        cache.mark_obsolete("c1").await.unwrap();

        let cache = Arc::new(cache);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(
                async move { cache.get_ranklist("c1").await.unwrap() },
            ));
        }

        for handle in handles {
            let ranklist = handle.await.unwrap();
            // Either the winner's fresh list or the prior cached value.
            assert!(matches!(ranklist[0].id.as_str(), "t1" | "old"));
        }

        // Exactly one racer performed the underlying sorted query.
        assert_eq!(scores.fetch_count(), 1);
    }
}
