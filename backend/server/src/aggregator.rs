//! # Vote Aggregator
//!
//! Read side. Derives `{count, hasVoted}` from the ledger for one, some or all proposals in a
//! single response. Stateless, no cache of its own.
//!
//! ## Degraded reads
//!
//! A reader may opt into [`Fallback::Empty`]: if the store is down the answer is a zero/empty
//! result flagged as degraded instead of an error. Writes never degrade.
use std::{collections::BTreeMap, sync::Arc};

use serde::Deserialize;
use tracing::error;

use crate::{
    catalogue::Catalogue,
    ledger::{Ledger, StoreError, VoteStats},
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fallback {
    #[default]
    Error,
    Empty,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Degradable<T> {
    pub value: T,
    pub degraded: bool,
}

fn degrade<T: Default>(
    result: Result<T, StoreError>,
    fallback: Fallback,
    what: &str,
) -> Result<Degradable<T>, StoreError> {
    match (result, fallback) {
        (Ok(value), _) => Ok(Degradable {
            value,
            degraded: false,
        }),
        (Err(e), Fallback::Empty) => {
            error!("Serving empty {what}: {e}");
            Ok(Degradable {
                value: T::default(),
                degraded: true,
            })
        }
        (Err(e), Fallback::Error) => Err(e),
    }
}

pub struct VoteAggregator {
    ledger: Arc<Ledger>,
    catalogue: Arc<Catalogue>,
}

impl VoteAggregator {
    pub fn new(ledger: Arc<Ledger>, catalogue: Arc<Catalogue>) -> Self {
        Self { ledger, catalogue }
    }

    pub async fn stats_for(
        &self,
        proposal_slug: &str,
        caller: Option<&str>,
        fallback: Fallback,
    ) -> Result<Degradable<VoteStats>, StoreError> {
        degrade(
            self.ledger.stats_for(proposal_slug, caller).await,
            fallback,
            "stats",
        )
    }

    /// Every requested slug is present, zero-filled when it has no votes.
    pub async fn stats_for_slugs(
        &self,
        proposal_slugs: &[String],
        caller: Option<&str>,
        fallback: Fallback,
    ) -> Result<Degradable<BTreeMap<String, VoteStats>>, StoreError> {
        let mut stats = degrade(self.ledger.stats_for_all(caller).await, fallback, "stats")?;

        stats.value.retain(|slug, _| proposal_slugs.contains(slug));
        for slug in proposal_slugs {
            stats.value.entry(slug.clone()).or_default();
        }

        Ok(stats)
    }

    /// Every slug with votes plus every catalogue slug.
    pub async fn stats_for_all(
        &self,
        caller: Option<&str>,
        fallback: Fallback,
    ) -> Result<Degradable<BTreeMap<String, VoteStats>>, StoreError> {
        let mut stats = degrade(self.ledger.stats_for_all(caller).await, fallback, "stats")?;

        for slug in self.catalogue.known() {
            stats.value.entry(slug.to_string()).or_default();
        }

        Ok(stats)
    }

    pub async fn voters_for(
        &self,
        proposal_slug: &str,
        fallback: Fallback,
    ) -> Result<Degradable<Vec<String>>, StoreError> {
        degrade(self.ledger.voters_for(proposal_slug).await, fallback, "voters")
    }
}
