use std::{collections::BTreeMap, sync::Arc};

use axum::{
    Json,
    extract::{Path, Query, State as AxumState},
    http::{HeaderMap, HeaderValue, StatusCode, header::SET_COOKIE},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    aggregator::{Degradable, Fallback},
    error::AppError,
    ledger::{Toggled, VoteStats},
    membership::Verdict,
    principal::{Identity, Principal, resolve_for_read},
    state::State,
    utils::{check_slug, clear_session_cookie, parse_slugs, set_session_cookie},
};

pub const DEGRADED_HEADER: &str = "x-dachs-degraded";

#[derive(Deserialize, Default)]
pub struct ReadQuery {
    #[serde(default)]
    fallback: Fallback,
}

#[derive(Deserialize)]
pub struct SlugsQuery {
    slugs: String,
    #[serde(default)]
    fallback: Fallback,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenSession {
    access_token: String,
}

fn respond<T: Serialize>(result: Degradable<T>) -> Response {
    let mut response = Json(result.value).into_response();

    if result.degraded {
        response
            .headers_mut()
            .insert(DEGRADED_HEADER, HeaderValue::from_static("true"));
    }

    response
}

pub async fn stats_handler(
    AxumState(state): AxumState<Arc<State>>,
    Path(slug): Path<String>,
    Query(query): Query<ReadQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    check_slug(&slug)?;
    state.catalogue.ensure_known(&slug)?;

    let caller = resolve_for_read(&headers, &state, query.fallback).await?;

    let mut stats: Degradable<VoteStats> = state
        .aggregator
        .stats_for(&slug, caller.value.voter_id(), query.fallback)
        .await?;
    stats.degraded |= caller.degraded;

    Ok(respond(stats))
}

pub async fn voters_handler(
    AxumState(state): AxumState<Arc<State>>,
    Path(slug): Path<String>,
    Query(query): Query<ReadQuery>,
) -> Result<Response, AppError> {
    check_slug(&slug)?;
    state.catalogue.ensure_known(&slug)?;

    Ok(respond(
        state.aggregator.voters_for(&slug, query.fallback).await?,
    ))
}

pub async fn upvote_handler(
    AxumState(state): AxumState<Arc<State>>,
    Path(slug): Path<String>,
    principal: Principal,
) -> Result<Json<Toggled>, AppError> {
    let session = principal.require()?;

    match state.gate.authorize(&session).await {
        Verdict::Member => {}
        Verdict::TokenRevoked => {
            state.sessions.close(&session.id).await?;
            state.gate.forget(&session.id).await;

            info!(voter = %session.identity.voter_handle, "Session closed, token revoked");
            return Err(AppError::Unauthenticated);
        }
        Verdict::NotMember | Verdict::Unavailable => return Err(AppError::Forbidden),
    }

    check_slug(&slug)?;
    state.catalogue.ensure_known(&slug)?;

    let toggled = state
        .ledger
        .toggle(
            &session.identity.voter_id,
            &session.identity.voter_handle,
            &slug,
        )
        .await?;

    #[cfg(feature = "verbose")]
    info!(
        "{} toggled {slug}: voted = {}",
        session.identity.voter_handle, toggled.voted
    );

    Ok(Json(toggled))
}

pub async fn all_stats_handler(
    AxumState(state): AxumState<Arc<State>>,
    Query(query): Query<ReadQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let caller = resolve_for_read(&headers, &state, query.fallback).await?;

    let mut stats = state
        .aggregator
        .stats_for_all(caller.value.voter_id(), query.fallback)
        .await?;
    stats.degraded |= caller.degraded;

    Ok(respond(stats))
}

pub async fn slugs_stats_handler(
    AxumState(state): AxumState<Arc<State>>,
    Query(query): Query<SlugsQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let slugs = parse_slugs(&query.slugs)?;
    let caller = resolve_for_read(&headers, &state, query.fallback).await?;

    let mut stats: Degradable<BTreeMap<String, VoteStats>> = state
        .aggregator
        .stats_for_slugs(&slugs, caller.value.voter_id(), query.fallback)
        .await?;
    stats.degraded |= caller.degraded;

    Ok(respond(stats))
}

pub async fn open_session_handler(
    AxumState(state): AxumState<Arc<State>>,
    Json(payload): Json<OpenSession>,
) -> Result<Response, AppError> {
    if payload.access_token.trim().is_empty() {
        return Err(AppError::MalformedPayload);
    }

    let identity = state.identities.identity(&payload.access_token).await?;
    let session = state
        .sessions
        .open(identity.clone(), payload.access_token)
        .await?;

    info!(voter = %identity.voter_handle, "Session opened");

    let cookie = set_session_cookie(&state.config, &session.id)
        .map_err(|e| AppError::InternalError(Box::new(e)))?;

    Ok(([(SET_COOKIE, cookie)], Json(identity)).into_response())
}

pub async fn me_handler(principal: Principal) -> Json<Option<Identity>> {
    Json(principal.session().map(|session| session.identity.clone()))
}

pub async fn orgs_handler(
    AxumState(state): AxumState<Arc<State>>,
    principal: Principal,
) -> Result<Json<Vec<String>>, AppError> {
    let Some(session) = principal.session() else {
        return Ok(Json(Vec::new()));
    };

    let organizations = state.gate.list_organizations(session).await?;

    Ok(Json(organizations.as_ref().clone()))
}

pub async fn logout_handler(
    AxumState(state): AxumState<Arc<State>>,
    principal: Principal,
) -> Result<Response, AppError> {
    if let Some(session) = principal.session() {
        state.sessions.close(&session.id).await?;
        state.gate.forget(&session.id).await;

        info!(voter = %session.identity.voter_handle, "Session closed");
    }

    let cookie =
        clear_session_cookie(&state.config).map_err(|e| AppError::InternalError(Box::new(e)))?;

    Ok((StatusCode::NO_CONTENT, [(SET_COOKIE, cookie)]).into_response())
}

pub async fn health_handler(
    AxumState(state): AxumState<Arc<State>>,
) -> Result<impl IntoResponse, AppError> {
    state.ledger.ping().await?;

    Ok((StatusCode::OK, "OK"))
}
