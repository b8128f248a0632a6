//! In-process upvote store for development and tests. Not shared across replicas.
use std::collections::{BTreeMap, btree_map::Entry};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::ledger::{StoreError, UpvoteFact, UpvoteStore};

/// proposal slug -> voter id -> fact
#[derive(Default)]
pub struct MemoryStore {
    facts: RwLock<BTreeMap<String, BTreeMap<String, UpvoteFact>>>,
}

#[async_trait]
impl UpvoteStore for MemoryStore {
    async fn insert_if_absent(&self, fact: &UpvoteFact) -> Result<bool, StoreError> {
        let mut facts = self.facts.write().await;

        match facts
            .entry(fact.proposal_slug.clone())
            .or_default()
            .entry(fact.voter_id.clone())
        {
            Entry::Vacant(entry) => {
                entry.insert(fact.clone());
                Ok(true)
            }
            Entry::Occupied(_) => Ok(false),
        }
    }

    async fn delete_if_present(
        &self,
        voter_id: &str,
        proposal_slug: &str,
    ) -> Result<bool, StoreError> {
        let mut facts = self.facts.write().await;

        let Some(voters) = facts.get_mut(proposal_slug) else {
            return Ok(false);
        };

        let removed = voters.remove(voter_id).is_some();
        if voters.is_empty() {
            facts.remove(proposal_slug);
        }

        Ok(removed)
    }

    async fn count(&self, proposal_slug: &str) -> Result<u64, StoreError> {
        Ok(self
            .facts
            .read()
            .await
            .get(proposal_slug)
            .map_or(0, |voters| voters.len() as u64))
    }

    async fn scan_slug(&self, proposal_slug: &str) -> Result<Vec<UpvoteFact>, StoreError> {
        Ok(self
            .facts
            .read()
            .await
            .get(proposal_slug)
            .map(|voters| voters.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn scan_all(&self) -> Result<Vec<UpvoteFact>, StoreError> {
        Ok(self
            .facts
            .read()
            .await
            .values()
            .flat_map(|voters| voters.values().cloned())
            .collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
