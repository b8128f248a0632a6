use std::sync::Arc;

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use tracing::info;

use super::{
    aggregator::VoteAggregator,
    catalogue::Catalogue,
    config::{Config, SessionBackend, StoreBackend},
    database::{RedisStore, init_redis},
    ledger::{Ledger, UpvoteStore},
    membership::{GitHub, IdentityProvider, MembershipCache, MembershipGate, MembershipProvider},
    memory::MemoryStore,
    session::{MemorySessions, RedisSessions, SessionStore},
    sqlite::SqliteStore,
};

pub struct State {
    pub config: Config,
    pub ledger: Arc<Ledger>,
    pub aggregator: VoteAggregator,
    pub catalogue: Arc<Catalogue>,
    pub sessions: Arc<dyn SessionStore>,
    pub gate: MembershipGate,
    pub identities: Arc<dyn IdentityProvider>,
}

impl State {
    pub async fn new() -> Result<Arc<Self>> {
        let config = Config::load()?;

        let mut redis_connection: Option<ConnectionManager> = None;
        if config.store_backend == StoreBackend::Redis
            || config.session_backend == SessionBackend::Redis
        {
            info!("Connecting to Redis...");
            redis_connection = Some(
                init_redis(&config.redis_url)
                    .await
                    .context("Redis misconfigured!")?,
            );
        }

        let store: Arc<dyn UpvoteStore> = match (config.store_backend, &redis_connection) {
            (StoreBackend::Redis, Some(connection)) => {
                Arc::new(RedisStore::new(connection.clone()))
            }
            (StoreBackend::Sqlite, _) => Arc::new(
                SqliteStore::open(&config.sqlite_path)
                    .await
                    .context("SQLite misconfigured!")?,
            ),
            _ => Arc::new(MemoryStore::default()),
        };

        let sessions: Arc<dyn SessionStore> = match (config.session_backend, &redis_connection) {
            (SessionBackend::Redis, Some(connection)) => {
                Arc::new(RedisSessions::new(connection.clone(), config.session_ttl))
            }
            _ => Arc::new(MemorySessions::new(config.session_ttl)),
        };

        info!(
            store = ?config.store_backend,
            sessions = ?config.session_backend,
            required_org = %config.required_org,
            "Backends ready"
        );

        let github = Arc::new(GitHub::new(&config.github_api_url)?);

        Ok(Self::from_parts(
            config,
            store,
            sessions,
            github.clone(),
            github,
        ))
    }

    pub fn from_parts(
        config: Config,
        store: Arc<dyn UpvoteStore>,
        sessions: Arc<dyn SessionStore>,
        membership: Arc<dyn MembershipProvider>,
        identities: Arc<dyn IdentityProvider>,
    ) -> Arc<Self> {
        let catalogue = Arc::new(
            config
                .proposal_slugs
                .as_ref()
                .map(Catalogue::from_slugs)
                .unwrap_or_else(Catalogue::open),
        );
        let ledger = Arc::new(Ledger::new(store));
        let cache = Arc::new(MembershipCache::new(
            config.membership_cache_capacity,
            config.session_ttl,
        ));

        Arc::new(Self {
            aggregator: VoteAggregator::new(ledger.clone(), catalogue.clone()),
            gate: MembershipGate::new(membership, cache, &config.required_org),
            ledger,
            catalogue,
            sessions,
            identities,
            config,
        })
    }
}
