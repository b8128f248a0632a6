use axum::http::{
    HeaderMap, HeaderValue,
    header::{COOKIE, InvalidHeaderValue},
};

use crate::{config::Config, config::split_list, error::AppError};

pub const MAX_SLUG_LEN: usize = 200;
pub const MAX_SLUGS_PER_REQUEST: usize = 500;

/// Value of the session cookie, if the request carries one.
pub fn session_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim_matches('"'))
        .filter(|value| !value.is_empty())
}

pub fn set_session_cookie(
    config: &Config,
    session_id: &str,
) -> Result<HeaderValue, InvalidHeaderValue> {
    cookie(config, session_id, config.session_ttl.as_secs())
}

pub fn clear_session_cookie(config: &Config) -> Result<HeaderValue, InvalidHeaderValue> {
    cookie(config, "", 0)
}

fn cookie(config: &Config, value: &str, max_age: u64) -> Result<HeaderValue, InvalidHeaderValue> {
    let secure = if config.cookie_secure { "; Secure" } else { "" };

    HeaderValue::from_str(&format!(
        "{}={value}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age}{secure}",
        config.session_cookie
    ))
}

/// Slugs are opaque but end up in store keys.
pub fn check_slug(proposal_slug: &str) -> Result<(), AppError> {
    if proposal_slug.is_empty()
        || proposal_slug.len() > MAX_SLUG_LEN
        || proposal_slug.chars().any(char::is_control)
    {
        return Err(AppError::MalformedPayload);
    }

    Ok(())
}

pub fn parse_slugs(raw: &str) -> Result<Vec<String>, AppError> {
    let slugs = split_list(raw);

    if slugs.len() > MAX_SLUGS_PER_REQUEST {
        return Err(AppError::MalformedPayload);
    }
    for slug in &slugs {
        check_slug(slug)?;
    }

    Ok(slugs)
}
