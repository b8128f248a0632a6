//! # Redis
//!
//! RAM database.
//!
//! Core purpose is to store upvote facts and answer count/voter lookups. Also, used for the atomic
//! conditional writes behind a toggle.
//!
//! ## Requirements
//!
//! - Fast lookups
//! - Small dataset, a few hundred proposals
//! - At most one fact per (voter, proposal), enforced by Redis itself
//!
//! ## Implementation
//!
//! - One hash per proposal: `upvotes:slug:{slug}`, field voter id, value JSON `{handle, createdAt}`
//! - `HSETNX` is the conditional insert, `HDEL` the conditional delete
//! - `HLEN` is the count
//! - Set `upvotes:index` of every slug with at least one vote. Added to in the same `MULTI` as the
//!   insert; the delete is a Lua script that `SREM`s the slug once its hash is empty
//! - All-stats is `SMEMBERS` + one pipelined `HGETALL` per slug, a single round trip
//! - Atomic operations, Redis loads operations into a queue
use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{
    AsyncCommands, Client, RedisError, Script,
    aio::{ConnectionManager, ConnectionManagerConfig},
};
use serde::{Deserialize, Serialize};

use crate::ledger::{StoreError, UpvoteFact, UpvoteStore};

pub const UPVOTES_PREFIX: &str = "upvotes:slug";
pub const UPVOTES_INDEX: &str = "upvotes:index";

/// KEYS: slug hash, index. ARGV: voter id, slug. Returns the number of fields removed.
const DELETE_VOTE: &str = r"
local removed = redis.call('HDEL', KEYS[1], ARGV[1])
if removed == 1 and redis.call('HLEN', KEYS[1]) == 0 then
    redis.call('SREM', KEYS[2], ARGV[2])
end
return removed
";

pub async fn init_redis(redis_url: &str) -> Result<ConnectionManager, RedisError> {
    let config = ConnectionManagerConfig::new()
        .set_number_of_retries(1)
        .set_connection_timeout(Duration::from_millis(100));

    let client = Client::open(redis_url)?;

    client.get_connection_manager_with_config(config).await
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredVote {
    handle: String,
    created_at: DateTime<Utc>,
}

fn slug_key(proposal_slug: &str) -> String {
    format!("{UPVOTES_PREFIX}:{proposal_slug}")
}

fn facts_from_hash(
    proposal_slug: &str,
    hash: HashMap<String, String>,
) -> Result<Vec<UpvoteFact>, StoreError> {
    hash.into_iter()
        .map(|(voter_id, raw)| {
            let stored: StoredVote = serde_json::from_str(&raw)?;

            Ok(UpvoteFact {
                voter_id,
                voter_handle: stored.handle,
                proposal_slug: proposal_slug.to_string(),
                created_at: stored.created_at,
            })
        })
        .collect()
}

#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    delete_vote: Script,
}

impl RedisStore {
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            connection,
            delete_vote: Script::new(DELETE_VOTE),
        }
    }
}

#[async_trait]
impl UpvoteStore for RedisStore {
    async fn insert_if_absent(&self, fact: &UpvoteFact) -> Result<bool, StoreError> {
        let mut connection = self.connection.clone();
        let value = serde_json::to_string(&StoredVote {
            handle: fact.voter_handle.clone(),
            created_at: fact.created_at,
        })?;

        let (inserted,): (bool,) = redis::pipe()
            .atomic()
            .hset_nx(slug_key(&fact.proposal_slug), &fact.voter_id, value)
            .sadd(UPVOTES_INDEX, &fact.proposal_slug)
            .ignore()
            .query_async(&mut connection)
            .await?;

        Ok(inserted)
    }

    async fn delete_if_present(
        &self,
        voter_id: &str,
        proposal_slug: &str,
    ) -> Result<bool, StoreError> {
        let mut connection = self.connection.clone();

        let removed: i64 = self
            .delete_vote
            .key(slug_key(proposal_slug))
            .key(UPVOTES_INDEX)
            .arg(voter_id)
            .arg(proposal_slug)
            .invoke_async(&mut connection)
            .await?;

        Ok(removed == 1)
    }

    async fn count(&self, proposal_slug: &str) -> Result<u64, StoreError> {
        let mut connection = self.connection.clone();

        let count: u64 = connection.hlen(slug_key(proposal_slug)).await?;

        Ok(count)
    }

    async fn scan_slug(&self, proposal_slug: &str) -> Result<Vec<UpvoteFact>, StoreError> {
        let mut connection = self.connection.clone();

        let hash: HashMap<String, String> = connection.hgetall(slug_key(proposal_slug)).await?;

        facts_from_hash(proposal_slug, hash)
    }

    async fn scan_all(&self) -> Result<Vec<UpvoteFact>, StoreError> {
        let mut connection = self.connection.clone();

        let slugs: Vec<String> = connection.smembers(UPVOTES_INDEX).await?;
        if slugs.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for slug in &slugs {
            pipe.hgetall(slug_key(slug));
        }
        let hashes: Vec<HashMap<String, String>> = pipe.query_async(&mut connection).await?;

        let mut facts = Vec::new();
        for (slug, hash) in slugs.iter().zip(hashes) {
            facts.extend(facts_from_hash(slug, hash)?);
        }

        Ok(facts)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();

        let _: String = redis::cmd("PING").query_async(&mut connection).await?;

        Ok(())
    }
}
