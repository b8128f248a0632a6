//! # Sessions
//!
//! Opened once the external OAuth flow hands us an access token, keyed by a random id that
//! travels in the session cookie. A session ends on logout or when its TTL runs out; the
//! membership cache follows the same lifetime.
//!
//! - Redis: `session:{id}` JSON with `SET EX`, shared across replicas
//! - Memory: moka cache with the same TTL, single process
//!
//! A Redis session that no longer decodes is deleted and reads as no session at all.
use std::{fmt, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use redis::{AsyncCommands, aio::ConnectionManager};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::principal::Identity;

pub const SESSION_PREFIX: &str = "session";
pub const MAX_SESSION_ID_LEN: usize = 64;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session store unavailable: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Corrupt session: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub identity: Identity,
    pub access_token: String,
    pub created_at: DateTime<Utc>,
}

impl Session {
    fn new(identity: Identity, access_token: String) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            identity,
            access_token,
            created_at: Utc::now(),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("access_token", &"<redacted>")
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Anything that is not one of our ids is never looked up.
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id.bytes().all(|b| b.is_ascii_alphanumeric())
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn open(&self, identity: Identity, access_token: String)
    -> Result<Session, SessionError>;

    async fn get(&self, id: &str) -> Result<Option<Session>, SessionError>;

    async fn close(&self, id: &str) -> Result<(), SessionError>;
}

pub struct RedisSessions {
    connection: ConnectionManager,
    ttl: Duration,
}

impl RedisSessions {
    pub fn new(connection: ConnectionManager, ttl: Duration) -> Self {
        Self { connection, ttl }
    }
}

fn session_key(id: &str) -> String {
    format!("{SESSION_PREFIX}:{id}")
}

fn decode_session(raw: &str) -> Option<Session> {
    match serde_json::from_str(raw) {
        Ok(session) => Some(session),
        Err(e) => {
            warn!("Dropping undecodable session: {e}");
            None
        }
    }
}

#[async_trait]
impl SessionStore for RedisSessions {
    async fn open(
        &self,
        identity: Identity,
        access_token: String,
    ) -> Result<Session, SessionError> {
        let mut connection = self.connection.clone();
        let session = Session::new(identity, access_token);

        let _: () = connection
            .set_ex(
                session_key(&session.id),
                serde_json::to_string(&session)?,
                self.ttl.as_secs(),
            )
            .await?;

        Ok(session)
    }

    async fn get(&self, id: &str) -> Result<Option<Session>, SessionError> {
        if !is_valid_session_id(id) {
            return Ok(None);
        }

        let mut connection = self.connection.clone();
        let key = session_key(id);
        let Some(raw) = connection.get::<_, Option<String>>(&key).await? else {
            return Ok(None);
        };

        let session = decode_session(&raw);
        if session.is_none() {
            let _: () = connection.del(&key).await?;
        }

        Ok(session)
    }

    async fn close(&self, id: &str) -> Result<(), SessionError> {
        if !is_valid_session_id(id) {
            return Ok(());
        }

        let mut connection = self.connection.clone();
        let _: () = connection.del(session_key(id)).await?;

        Ok(())
    }
}

pub struct MemorySessions {
    sessions: Cache<String, Session>,
}

impl MemorySessions {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Cache::builder().time_to_live(ttl).build(),
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessions {
    async fn open(
        &self,
        identity: Identity,
        access_token: String,
    ) -> Result<Session, SessionError> {
        let session = Session::new(identity, access_token);
        self.sessions
            .insert(session.id.clone(), session.clone())
            .await;

        Ok(session)
    }

    async fn get(&self, id: &str) -> Result<Option<Session>, SessionError> {
        Ok(self.sessions.get(id).await)
    }

    async fn close(&self, id: &str) -> Result<(), SessionError> {
        self.sessions.invalidate(id).await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Identity {
        Identity {
            voter_id: "1".to_string(),
            voter_handle: "alice".to_string(),
        }
    }

    #[tokio::test]
    async fn memory_sessions_open_and_close() {
        let sessions = MemorySessions::new(Duration::from_secs(60));

        let session = sessions.open(alice(), "token".to_string()).await.unwrap();
        assert!(is_valid_session_id(&session.id));
        assert_eq!(sessions.get(&session.id).await.unwrap(), Some(session.clone()));

        sessions.close(&session.id).await.unwrap();
        assert_eq!(sessions.get(&session.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_sessions_expire() {
        let sessions = MemorySessions::new(Duration::from_millis(50));

        let session = sessions.open(alice(), "token".to_string()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(sessions.get(&session.id).await.unwrap(), None);
    }

    #[test]
    fn session_ids_are_checked() {
        assert!(is_valid_session_id("0f3a9c"));
        assert!(!is_valid_session_id(""));
        assert!(!is_valid_session_id("../etc"));
        assert!(!is_valid_session_id("a*"));
        assert!(!is_valid_session_id(&"a".repeat(MAX_SESSION_ID_LEN + 1)));
    }

    #[test]
    fn undecodable_session_reads_as_none() {
        let session = Session::new(alice(), "token".to_string());
        let raw = serde_json::to_string(&session).unwrap();

        assert_eq!(decode_session(&raw), Some(session));
        assert_eq!(decode_session("{\"id\":\"abc\""), None);
        assert_eq!(decode_session("not json"), None);
        assert_eq!(decode_session("{\"id\":\"abc\",\"identity\":null}"), None);
    }

    #[test]
    fn debug_redacts_token() {
        let session = Session::new(alice(), "secret-token".to_string());

        assert!(!format!("{session:?}").contains("secret-token"));
    }
}
