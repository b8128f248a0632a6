//! # Upvote Ledger
//!
//! Source of truth for upvotes: a set of (voter, proposal) facts.
//!
//! ## Invariant
//!
//! At most one [`UpvoteFact`] per `(voter_id, proposal_slug)`. Every store enforces it natively:
//!
//! - Redis: `HSETNX` on the proposal hash, `HDEL` to remove
//! - SQLite: compound primary key, `INSERT .. ON CONFLICT DO NOTHING`
//! - Memory: a single map entry under a write lock
//!
//! ## Toggle
//!
//! There is no existence check before a write. The toggle tries the insert first and treats a
//! conflict as "already voted", which triggers the delete instead. If the delete then finds
//! nothing, a concurrent toggle removed the fact in between and the whole toggle runs again,
//! after a short jittered pause so that racing toggles drift apart. See [`retry_delay`].
//!
//! ## Timestamps
//!
//! Toggling off deletes the fact, so an upvote after a toggle-off/toggle-on cycle always carries a
//! fresh `created_at`.
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const MAX_TOGGLE_ATTEMPTS: usize = 8;
pub const TOGGLE_BACKOFF_MS: u64 = 2;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpvoteFact {
    pub voter_id: String,
    pub voter_handle: String,
    pub proposal_slug: String,
    pub created_at: DateTime<Utc>,
}

impl UpvoteFact {
    pub fn new(voter_id: &str, voter_handle: &str, proposal_slug: &str) -> Self {
        Self {
            voter_id: voter_id.to_string(),
            voter_handle: voter_handle.to_string(),
            proposal_slug: proposal_slug.to_string(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteStats {
    pub count: u64,
    pub has_voted: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toggled {
    pub voted: bool,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis unavailable: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("SQLite unavailable: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("Corrupt upvote record: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("Invalid upvote timestamp: {0}")]
    InvalidTimestamp(i64),

    #[error("Toggle by {voter_id} on {proposal_slug} did not settle after {attempts} attempts")]
    Contention {
        voter_id: String,
        proposal_slug: String,
        attempts: usize,
    },
}

/// Storage capabilities the ledger needs. Both conditional writes must be atomic on their own.
#[async_trait]
pub trait UpvoteStore: Send + Sync {
    /// Stores `fact` unless its pair already has one. Returns whether it was stored.
    async fn insert_if_absent(&self, fact: &UpvoteFact) -> Result<bool, StoreError>;

    /// Removes the fact for the pair. Returns whether one was removed.
    async fn delete_if_present(
        &self,
        voter_id: &str,
        proposal_slug: &str,
    ) -> Result<bool, StoreError>;

    async fn count(&self, proposal_slug: &str) -> Result<u64, StoreError>;

    async fn scan_slug(&self, proposal_slug: &str) -> Result<Vec<UpvoteFact>, StoreError>;

    async fn scan_all(&self) -> Result<Vec<UpvoteFact>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

pub struct Ledger {
    store: Arc<dyn UpvoteStore>,
}

impl Ledger {
    pub fn new(store: Arc<dyn UpvoteStore>) -> Self {
        Self { store }
    }

    pub async fn toggle(
        &self,
        voter_id: &str,
        voter_handle: &str,
        proposal_slug: &str,
    ) -> Result<Toggled, StoreError> {
        for attempt in 1..=MAX_TOGGLE_ATTEMPTS {
            let fact = UpvoteFact::new(voter_id, voter_handle, proposal_slug);

            if self.store.insert_if_absent(&fact).await? {
                debug!(voter = voter_id, slug = proposal_slug, voted = true, "Toggled");
                return Ok(Toggled { voted: true });
            }

            if self.store.delete_if_present(voter_id, proposal_slug).await? {
                debug!(voter = voter_id, slug = proposal_slug, voted = false, "Toggled");
                return Ok(Toggled { voted: false });
            }

            debug!(
                voter = voter_id,
                slug = proposal_slug,
                attempt,
                "Toggle raced a concurrent toggle, retrying"
            );

            if attempt < MAX_TOGGLE_ATTEMPTS {
                tokio::time::sleep(retry_delay(attempt)).await;
            }
        }

        warn!(voter = voter_id, slug = proposal_slug, "Toggle gave up under contention");

        Err(StoreError::Contention {
            voter_id: voter_id.to_string(),
            proposal_slug: proposal_slug.to_string(),
            attempts: MAX_TOGGLE_ATTEMPTS,
        })
    }

    pub async fn count_for(&self, proposal_slug: &str) -> Result<u64, StoreError> {
        self.store.count(proposal_slug).await
    }

    pub async fn voters_for(&self, proposal_slug: &str) -> Result<Vec<String>, StoreError> {
        Ok(voter_handles(self.store.scan_slug(proposal_slug).await?))
    }

    /// Single-proposal stats, one store query.
    pub async fn stats_for(
        &self,
        proposal_slug: &str,
        caller: Option<&str>,
    ) -> Result<VoteStats, StoreError> {
        let facts = self.store.scan_slug(proposal_slug).await?;

        Ok(tally(&facts, caller)
            .remove(proposal_slug)
            .unwrap_or_default())
    }

    pub async fn stats_for_all(
        &self,
        caller: Option<&str>,
    ) -> Result<BTreeMap<String, VoteStats>, StoreError> {
        Ok(tally(&self.store.scan_all().await?, caller))
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        self.store.ping().await
    }
}

/// Linear backoff plus up to the same amount again of random jitter.
pub fn retry_delay(attempt: usize) -> Duration {
    let base = TOGGLE_BACKOFF_MS * attempt as u64;
    let jitter = rand::thread_rng().gen_range(0..=base);

    Duration::from_millis(base + jitter)
}

pub fn tally(facts: &[UpvoteFact], caller: Option<&str>) -> BTreeMap<String, VoteStats> {
    let mut stats: BTreeMap<String, VoteStats> = BTreeMap::new();

    for fact in facts {
        let entry = stats.entry(fact.proposal_slug.clone()).or_default();
        entry.count += 1;

        if caller == Some(fact.voter_id.as_str()) {
            entry.has_voted = true;
        }
    }

    stats
}

/// One handle per voter id, the most recent one, ordered by each voter's first cast.
pub fn voter_handles(facts: Vec<UpvoteFact>) -> Vec<String> {
    // voter_id -> (first cast, latest cast, latest handle)
    let mut voters: HashMap<String, (DateTime<Utc>, DateTime<Utc>, String)> = HashMap::new();

    for fact in facts {
        match voters.get_mut(&fact.voter_id) {
            Some((first, latest, handle)) => {
                *first = (*first).min(fact.created_at);

                if fact.created_at >= *latest {
                    *latest = fact.created_at;
                    *handle = fact.voter_handle;
                }
            }
            None => {
                voters.insert(
                    fact.voter_id,
                    (fact.created_at, fact.created_at, fact.voter_handle),
                );
            }
        }
    }

    let mut ordered: Vec<(DateTime<Utc>, String)> = voters
        .into_values()
        .map(|(first, _, handle)| (first, handle))
        .collect();
    ordered.sort();

    ordered.into_iter().map(|(_, handle)| handle).collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::TimeDelta;

    use super::*;
    use crate::memory::MemoryStore;

    fn ledger() -> Ledger {
        Ledger::new(Arc::new(MemoryStore::default()))
    }

    #[tokio::test]
    async fn toggle_parity_decides_vote() {
        let ledger = ledger();

        for round in 1..=7 {
            let toggled = ledger.toggle("1", "alice", "s1").await.unwrap();
            assert_eq!(toggled.voted, round % 2 == 1);

            let stats = ledger.stats_for("s1", Some("1")).await.unwrap();
            assert_eq!(stats.has_voted, round % 2 == 1);
        }
    }

    #[tokio::test]
    async fn vote_is_visible_to_voter_only() {
        let ledger = ledger();

        assert_eq!(
            ledger.toggle("1", "alice", "s1").await.unwrap(),
            Toggled { voted: true }
        );

        let alice = ledger.stats_for("s1", Some("1")).await.unwrap();
        let bob = ledger.stats_for("s1", Some("2")).await.unwrap();
        let anonymous = ledger.stats_for("s1", None).await.unwrap();

        assert_eq!(alice, VoteStats { count: 1, has_voted: true });
        assert_eq!(bob, VoteStats { count: 1, has_voted: false });
        assert_eq!(anonymous, VoteStats { count: 1, has_voted: false });
    }

    #[tokio::test]
    async fn double_toggle_clears_vote() {
        let ledger = ledger();

        assert!(ledger.toggle("1", "alice", "s1").await.unwrap().voted);
        assert!(!ledger.toggle("1", "alice", "s1").await.unwrap().voted);
        assert_eq!(ledger.count_for("s1").await.unwrap(), 0);
        assert!(ledger.voters_for("s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn all_stats_single_pass() {
        let ledger = ledger();

        ledger.toggle("1", "alice", "s1").await.unwrap();
        ledger.toggle("2", "bob", "s1").await.unwrap();
        ledger.toggle("1", "alice", "s2").await.unwrap();

        let stats = ledger.stats_for_all(Some("2")).await.unwrap();

        assert_eq!(stats.len(), 2);
        assert_eq!(stats["s1"], VoteStats { count: 2, has_voted: true });
        assert_eq!(stats["s2"], VoteStats { count: 1, has_voted: false });
    }

    #[tokio::test]
    async fn count_matches_voters() {
        let ledger = ledger();

        for (id, handle) in [("1", "alice"), ("2", "bob"), ("3", "carol")] {
            ledger.toggle(id, handle, "s1").await.unwrap();
        }
        ledger.toggle("2", "bob", "s1").await.unwrap();

        let count = ledger.count_for("s1").await.unwrap();
        let voters = ledger.voters_for("s1").await.unwrap();

        assert_eq!(count, 2);
        assert_eq!(voters.len() as u64, count);
        assert_eq!(voters, vec!["alice".to_string(), "carol".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_toggles_never_duplicate() {
        let ledger = Arc::new(ledger());

        for n in 1..=16usize {
            let handles: Vec<_> = (0..n)
                .map(|_| {
                    let ledger = ledger.clone();
                    tokio::spawn(async move { ledger.toggle("1", "alice", "race").await })
                })
                .collect();

            let mut on = 0i64;
            let mut off = 0i64;
            for handle in handles {
                match handle.await.unwrap() {
                    Ok(Toggled { voted: true }) => on += 1,
                    Ok(Toggled { voted: false }) => off += 1,
                    // gave up without writing anything
                    Err(StoreError::Contention { .. }) => {}
                    Err(e) => panic!("unexpected store error: {e}"),
                }
            }

            let count = ledger.count_for("race").await.unwrap();
            assert!(count <= 1);
            assert_eq!(on - off, count as i64);

            // reset for the next round
            if count == 1 {
                ledger.toggle("1", "alice", "race").await.unwrap();
            }
        }
    }

    #[test]
    fn voter_handles_dedup_to_latest_handle() {
        let now = Utc::now();
        let fact = |id: &str, handle: &str, offset: i64| UpvoteFact {
            voter_id: id.to_string(),
            voter_handle: handle.to_string(),
            proposal_slug: "s1".to_string(),
            created_at: now + TimeDelta::seconds(offset),
        };

        let voters = voter_handles(vec![
            fact("1", "old-alice", 0),
            fact("2", "bob", 5),
            fact("1", "alice", 10),
        ]);

        assert_eq!(voters, vec!["alice".to_string(), "bob".to_string()]);
    }

    /// Reports a conflict and then loses the delete, as if another toggle removed the fact.
    struct RacedStore {
        inner: MemoryStore,
        races_left: AtomicUsize,
    }

    #[async_trait]
    impl UpvoteStore for RacedStore {
        async fn insert_if_absent(&self, fact: &UpvoteFact) -> Result<bool, StoreError> {
            if self.races_left.load(Ordering::SeqCst) > 0 {
                return Ok(false);
            }
            self.inner.insert_if_absent(fact).await
        }

        async fn delete_if_present(&self, voter: &str, slug: &str) -> Result<bool, StoreError> {
            if self
                .races_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Ok(false);
            }
            self.inner.delete_if_present(voter, slug).await
        }

        async fn count(&self, slug: &str) -> Result<u64, StoreError> {
            self.inner.count(slug).await
        }

        async fn scan_slug(&self, slug: &str) -> Result<Vec<UpvoteFact>, StoreError> {
            self.inner.scan_slug(slug).await
        }

        async fn scan_all(&self) -> Result<Vec<UpvoteFact>, StoreError> {
            self.inner.scan_all().await
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn toggle_retries_after_lost_delete() {
        let ledger = Ledger::new(Arc::new(RacedStore {
            inner: MemoryStore::default(),
            races_left: AtomicUsize::new(2),
        }));

        assert!(ledger.toggle("1", "alice", "s1").await.unwrap().voted);
        assert_eq!(ledger.count_for("s1").await.unwrap(), 1);
    }

    #[test]
    fn retry_delay_grows_with_bounded_jitter() {
        for attempt in 1..MAX_TOGGLE_ATTEMPTS {
            let base = Duration::from_millis(TOGGLE_BACKOFF_MS * attempt as u64);

            for _ in 0..50 {
                let delay = retry_delay(attempt);
                assert!(delay >= base);
                assert!(delay <= base * 2);
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lost_races_back_off_before_retrying() {
        let ledger = Ledger::new(Arc::new(RacedStore {
            inner: MemoryStore::default(),
            races_left: AtomicUsize::new(3),
        }));

        let started = std::time::Instant::now();
        assert!(ledger.toggle("1", "alice", "s1").await.unwrap().voted);

        // three retries sleep at least 2 + 4 + 6 ms
        assert!(started.elapsed() >= Duration::from_millis(12));
        assert_eq!(ledger.count_for("s1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn toggle_gives_up_under_endless_contention() {
        let ledger = Ledger::new(Arc::new(RacedStore {
            inner: MemoryStore::default(),
            races_left: AtomicUsize::new(usize::MAX),
        }));

        let err = ledger.toggle("1", "alice", "s1").await.unwrap_err();

        assert!(matches!(
            err,
            StoreError::Contention { attempts: MAX_TOGGLE_ATTEMPTS, .. }
        ));
        assert_eq!(ledger.count_for("s1").await.unwrap(), 0);
    }
}
