//! # Membership Gate
//!
//! Only members of the configured GitHub organization may vote.
//!
//! ## Cache
//!
//! GitHub is rate-limited and a network hop away, so the organization list of a session is fetched
//! once and kept in [`MembershipCache`]:
//!
//! - Key: session id
//! - Lifetime: the session TTL
//! - Invalidated on logout
//!
//! A membership change on GitHub therefore shows up with the next session at the latest.
//!
//! ## Failure
//!
//! A failed lookup denies the vote (fail-closed) and is not cached, so the next attempt asks
//! GitHub again. Concurrent misses for one session wait on a single GitHub call.
//!
//! A token GitHub no longer accepts is reported as [`Verdict::TokenRevoked`]; the caller ends the
//! session rather than keep a dead one around.
use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use moka::future::Cache;
use reqwest::{
    Client, StatusCode,
    header::{ACCEPT, AUTHORIZATION, USER_AGENT},
};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{principal::Identity, session::Session};

pub const GITHUB_ACCEPT: &str = "application/vnd.github+json";
pub const GITHUB_USER_AGENT: &str = "dachs-upvotes";

#[derive(Error, Debug)]
pub enum MembershipError {
    #[error("GitHub request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("GitHub rejected the access token")]
    InvalidToken,

    #[error("GitHub answered {0}")]
    Status(StatusCode),
}

#[async_trait]
pub trait MembershipProvider: Send + Sync {
    /// Organization logins the token's owner belongs to.
    async fn organizations(&self, access_token: &str) -> Result<Vec<String>, MembershipError>;
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn identity(&self, access_token: &str) -> Result<Identity, MembershipError>;
}

#[derive(Deserialize)]
struct GitHubOrg {
    login: String,
}

#[derive(Deserialize)]
struct GitHubUser {
    id: u64,
    login: String,
}

pub struct GitHub {
    client: Client,
    api_url: String,
}

impl GitHub {
    pub fn new(api_url: &str) -> Result<Self, MembershipError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        access_token: &str,
    ) -> Result<T, MembershipError> {
        let response = self
            .client
            .get(format!("{}{path}", self.api_url))
            .header(AUTHORIZATION, format!("token {access_token}"))
            .header(ACCEPT, GITHUB_ACCEPT)
            .header(USER_AGENT, GITHUB_USER_AGENT)
            .send()
            .await?;

        match response.status() {
            StatusCode::UNAUTHORIZED => Err(MembershipError::InvalidToken),
            status if !status.is_success() => Err(MembershipError::Status(status)),
            _ => Ok(response.json().await?),
        }
    }
}

#[async_trait]
impl MembershipProvider for GitHub {
    async fn organizations(&self, access_token: &str) -> Result<Vec<String>, MembershipError> {
        let orgs: Vec<GitHubOrg> = self.get("/user/orgs", access_token).await?;

        Ok(orgs.into_iter().map(|org| org.login).collect())
    }
}

#[async_trait]
impl IdentityProvider for GitHub {
    async fn identity(&self, access_token: &str) -> Result<Identity, MembershipError> {
        let user: GitHubUser = self.get("/user", access_token).await?;

        Ok(Identity {
            voter_id: user.id.to_string(),
            voter_handle: user.login,
        })
    }
}

pub struct MembershipCache {
    organizations: Cache<String, Arc<Vec<String>>>,
}

impl MembershipCache {
    pub fn new(capacity: u64, session_ttl: Duration) -> Self {
        Self {
            organizations: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(session_ttl)
                .build(),
        }
    }

    pub async fn get_or_fetch<F>(
        &self,
        session_id: &str,
        fetch: F,
    ) -> Result<Arc<Vec<String>>, Arc<MembershipError>>
    where
        F: Future<Output = Result<Vec<String>, MembershipError>>,
    {
        self.organizations
            .try_get_with(session_id.to_string(), async { fetch.await.map(Arc::new) })
            .await
    }

    pub async fn invalidate(&self, session_id: &str) {
        self.organizations.invalidate(session_id).await;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Member,
    NotMember,
    /// GitHub rejected the session's token.
    TokenRevoked,
    /// Lookup failed for any other reason.
    Unavailable,
}

pub struct MembershipGate {
    provider: Arc<dyn MembershipProvider>,
    cache: Arc<MembershipCache>,
    required_org: String,
}

impl MembershipGate {
    pub fn new(
        provider: Arc<dyn MembershipProvider>,
        cache: Arc<MembershipCache>,
        required_org: &str,
    ) -> Self {
        Self {
            provider,
            cache,
            required_org: required_org.to_string(),
        }
    }

    pub fn required_org(&self) -> &str {
        &self.required_org
    }

    pub async fn list_organizations(
        &self,
        session: &Session,
    ) -> Result<Arc<Vec<String>>, Arc<MembershipError>> {
        self.cache
            .get_or_fetch(&session.id, async {
                debug!(voter = %session.identity.voter_handle, "Fetching organizations");
                self.provider.organizations(&session.access_token).await
            })
            .await
    }

    pub async fn authorize(&self, session: &Session) -> Verdict {
        match self.list_organizations(session).await {
            Ok(organizations)
                if organizations
                    .iter()
                    .any(|org| org.eq_ignore_ascii_case(&self.required_org)) =>
            {
                Verdict::Member
            }
            Ok(_) => Verdict::NotMember,
            Err(e) if matches!(*e, MembershipError::InvalidToken) => {
                warn!(voter = %session.identity.voter_handle, "Access token revoked");
                Verdict::TokenRevoked
            }
            Err(e) => {
                warn!(
                    voter = %session.identity.voter_handle,
                    "Membership lookup failed, denying: {e}"
                );
                Verdict::Unavailable
            }
        }
    }

    /// Fail-closed: anything but a confirmed membership is a no.
    pub async fn is_authorized(&self, session: &Session) -> bool {
        self.authorize(session).await == Verdict::Member
    }

    /// Session ended.
    pub async fn forget(&self, session_id: &str) {
        self.cache.invalidate(session_id).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::session::{MemorySessions, SessionStore};

    struct CountingProvider {
        calls: AtomicUsize,
        organizations: Option<Vec<String>>,
        delay: Duration,
    }

    #[async_trait]
    impl MembershipProvider for CountingProvider {
        async fn organizations(&self, access_token: &str) -> Result<Vec<String>, MembershipError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;

            if access_token == "revoked" {
                return Err(MembershipError::InvalidToken);
            }

            self.organizations
                .clone()
                .ok_or(MembershipError::Status(StatusCode::FORBIDDEN))
        }
    }

    fn gate(organizations: Option<Vec<&str>>) -> (MembershipGate, Arc<CountingProvider>) {
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
            organizations: organizations
                .map(|orgs| orgs.into_iter().map(str::to_string).collect()),
            delay: Duration::ZERO,
        });
        let cache = Arc::new(MembershipCache::new(100, Duration::from_secs(60)));

        (MembershipGate::new(provider.clone(), cache, "dachs-dev"), provider)
    }

    async fn session_with(access_token: &str) -> Session {
        MemorySessions::new(Duration::from_secs(60))
            .open(
                Identity {
                    voter_id: "1".to_string(),
                    voter_handle: "alice".to_string(),
                },
                access_token.to_string(),
            )
            .await
            .unwrap()
    }

    async fn session() -> Session {
        session_with("token").await
    }

    #[tokio::test]
    async fn member_is_authorized_case_insensitively() {
        let (gate, _) = gate(Some(vec!["rust-lang", "Dachs-Dev"]));

        assert!(gate.is_authorized(&session().await).await);
    }

    #[tokio::test]
    async fn non_member_is_denied() {
        let (gate, _) = gate(Some(vec!["rust-lang"]));

        assert!(!gate.is_authorized(&session().await).await);
    }

    #[tokio::test]
    async fn lookup_is_cached_per_session() {
        let (gate, provider) = gate(Some(vec!["dachs-dev"]));
        let session = session().await;

        assert!(gate.is_authorized(&session).await);
        assert!(gate.is_authorized(&session).await);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        gate.forget(&session.id).await;
        assert!(gate.is_authorized(&session).await);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_lookup_fails_closed_and_is_not_cached() {
        let (gate, provider) = gate(None);
        let session = session().await;

        assert!(!gate.is_authorized(&session).await);
        assert!(!gate.is_authorized(&session).await);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert!(gate.list_organizations(&session).await.is_err());
    }

    #[tokio::test]
    async fn verdict_tells_revoked_token_apart() {
        let (member, _) = gate(Some(vec!["dachs-dev"]));
        assert_eq!(member.authorize(&session().await).await, Verdict::Member);
        assert_eq!(
            member.authorize(&session_with("revoked").await).await,
            Verdict::TokenRevoked
        );

        let (outsider, _) = gate(Some(vec!["rust-lang"]));
        assert_eq!(outsider.authorize(&session().await).await, Verdict::NotMember);

        let (broken, _) = gate(None);
        assert_eq!(broken.authorize(&session().await).await, Verdict::Unavailable);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_share_one_lookup() {
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
            organizations: Some(vec!["dachs-dev".to_string()]),
            delay: Duration::from_millis(100),
        });
        let cache = Arc::new(MembershipCache::new(100, Duration::from_secs(60)));
        let gate = Arc::new(MembershipGate::new(provider.clone(), cache, "dachs-dev"));
        let session = session().await;

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let gate = gate.clone();
                let session = session.clone();
                tokio::spawn(async move { gate.is_authorized(&session).await })
            })
            .collect();

        for handle in handles {
            assert!(handle.await.unwrap());
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }
}
