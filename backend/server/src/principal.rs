//! Turns the session cookie of a request into who is asking.
//!
//! A missing, malformed, unknown or expired cookie is [`Principal::Anonymous`]; whether that is
//! acceptable is up to the handler. Only an unreachable session store is an error, and read routes
//! asked for `?fallback=empty` swallow even that (see [`resolve_for_read`]).
use std::sync::Arc;

use axum::{
    extract::FromRequestParts,
    http::{HeaderMap, request::Parts},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    aggregator::{Degradable, Fallback},
    error::AppError,
    session::Session,
    state::State,
    utils::session_cookie,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// GitHub account id, stable across renames.
    pub voter_id: String,
    /// GitHub login when the session was opened.
    pub voter_handle: String,
}

#[derive(Clone, Debug)]
pub enum Principal {
    Authenticated(Session),
    Anonymous,
}

impl Principal {
    pub fn session(&self) -> Option<&Session> {
        match self {
            Principal::Authenticated(session) => Some(session),
            Principal::Anonymous => None,
        }
    }

    pub fn voter_id(&self) -> Option<&str> {
        self.session()
            .map(|session| session.identity.voter_id.as_str())
    }

    pub fn require(self) -> Result<Session, AppError> {
        match self {
            Principal::Authenticated(session) => Ok(session),
            Principal::Anonymous => Err(AppError::Unauthenticated),
        }
    }
}

pub async fn resolve(headers: &HeaderMap, state: &State) -> Result<Principal, AppError> {
    let Some(session_id) = session_cookie(headers, &state.config.session_cookie) else {
        return Ok(Principal::Anonymous);
    };

    match state.sessions.get(session_id).await? {
        Some(session) => Ok(Principal::Authenticated(session)),
        None => {
            debug!("Unknown or expired session, treating as anonymous");
            Ok(Principal::Anonymous)
        }
    }
}

/// Same as [`resolve`], except that with [`Fallback::Empty`] an unreachable session store
/// degrades the caller to anonymous instead of failing the read.
pub async fn resolve_for_read(
    headers: &HeaderMap,
    state: &State,
    fallback: Fallback,
) -> Result<Degradable<Principal>, AppError> {
    match (resolve(headers, state).await, fallback) {
        (Ok(principal), _) => Ok(Degradable {
            value: principal,
            degraded: false,
        }),
        (Err(e), Fallback::Empty) => {
            warn!("Session lookup failed, reading as anonymous: {e}");
            Ok(Degradable {
                value: Principal::Anonymous,
                degraded: true,
            })
        }
        (Err(e), Fallback::Error) => Err(e),
    }
}

impl FromRequestParts<Arc<State>> for Principal {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<State>,
    ) -> Result<Self, Self::Rejection> {
        resolve(&parts.headers, state).await
    }
}
