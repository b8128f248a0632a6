//! Known proposal slugs.
//!
//! The catalogue itself lives in the content repository. When `PROPOSAL_SLUGS` is configured the
//! backend rejects votes on anything else and lists every proposal in all-stats, even without
//! votes. Otherwise slugs are opaque and accepted as is.
use std::collections::BTreeSet;

use crate::error::AppError;

#[derive(Clone, Debug, Default)]
pub struct Catalogue {
    slugs: Option<BTreeSet<String>>,
}

impl Catalogue {
    pub fn open() -> Self {
        Self { slugs: None }
    }

    pub fn from_slugs<I, S>(slugs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            slugs: Some(slugs.into_iter().map(Into::into).collect()),
        }
    }

    pub fn ensure_known(&self, proposal_slug: &str) -> Result<(), AppError> {
        match &self.slugs {
            Some(slugs) if !slugs.contains(proposal_slug) => {
                Err(AppError::NotFound(proposal_slug.to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Empty when slugs are opaque.
    pub fn known(&self) -> impl Iterator<Item = &str> {
        self.slugs.iter().flatten().map(String::as_str)
    }
}
