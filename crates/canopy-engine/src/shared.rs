//! State shared by the engine's components.

use std::future::Future;
use std::sync::Arc;

use canopy_store::{ParticipantId, PlacementRecord, SlotStore};
use canopy_structure::{Program, Tier};

use crate::config::EngineConfig;
use crate::error::{Context, Result};
use crate::locks::ScopeLocks;
use crate::retry::{with_retry, RetryPolicy};

/// Store, configuration and lock table, cheaply cloneable.
pub(crate) struct Shared<S> {
    pub store: Arc<S>,
    pub config: Arc<EngineConfig>,
    pub locks: Arc<ScopeLocks>,
    pub retry: RetryPolicy,
}

impl<S> Clone for Shared<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            config: self.config.clone(),
            locks: self.locks.clone(),
            retry: self.retry,
        }
    }
}

impl<S: SlotStore> Shared<S> {
    pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
        let retry = RetryPolicy::from_config(&config);
        Self {
            store,
            config: Arc::new(config),
            locks: Arc::new(ScopeLocks::new()),
            retry,
        }
    }

    /// Run one store call under the retry policy.
    pub async fn call<T, F, Fut>(&self, context: Context, call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = canopy_store::Result<T>>,
    {
        with_retry(&self.retry, context, call).await
    }

    pub async fn holds(
        &self,
        context: Context,
        participant: ParticipantId,
        program: Program,
        tier: Tier,
    ) -> Result<bool> {
        let store = &*self.store;
        self.call(context, || store.holds(participant, program, tier))
            .await
    }

    pub async fn latest_record(
        &self,
        context: Context,
        participant: ParticipantId,
        program: Program,
        tier: Tier,
    ) -> Result<Option<PlacementRecord>> {
        let store = &*self.store;
        self.call(context, || store.latest_record(participant, program, tier))
            .await
    }

    /// The referrer a participant joined the program with.
    pub async fn program_referrer(
        &self,
        context: Context,
        participant: ParticipantId,
        program: Program,
    ) -> Result<Option<ParticipantId>> {
        let store = &*self.store;
        let first = self
            .call(context, || store.records_for(participant, program, Tier::FIRST))
            .await?;
        Ok(first.first().and_then(|r| r.referrer))
    }

    /// Highest tier the participant holds at or below `tier`.
    pub async fn highest_held(
        &self,
        context: Context,
        participant: ParticipantId,
        program: Program,
        tier: Tier,
    ) -> Result<Option<Tier>> {
        let mut current = Some(tier);
        while let Some(t) = current {
            if self.holds(context, participant, program, t).await? {
                return Ok(Some(t));
            }
            current = t.previous();
        }
        Ok(None)
    }

    /// Pause before rescanning after a lost race.
    pub async fn conflict_backoff(&self, attempt: u32) {
        tokio::time::sleep(self.config.backoff(attempt)).await;
    }
}
