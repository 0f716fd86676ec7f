//! The join and upgrade workflow.
//!
//! [`Engine::activate`] places one fee-paying activation and then settles
//! everything it sets off: reserve credits, promotions of the credited
//! owners, matrix recycles and global phase moves. Each of those can create
//! a new record that must be settled in turn, so settlement runs as a work
//! queue rather than recursion; a promotion cascade across any number of
//! ancestors never grows the stack.
//!
//! A record is marked settled in the store only after its whole queue has
//! drained. Every step checks committed state before writing, so an
//! interrupted settlement can simply be run again: [`Engine::resume`]
//! settles everything still unmarked, and re-activating the participant
//! resumes their own.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use canopy_store::{
    InstanceId, ParticipantId, PlacementRecord, RecordId, ReserveAccount, SlotStore, StructureId,
};
use canopy_structure::{Program, Tier};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{Context, Error, Result};
use crate::events::Event;
use crate::global::GlobalPhases;
use crate::ledger::ReserveLedger;
use crate::placement::PlacementEngine;
use crate::recycle::RecycleManager;
use crate::shared::Shared;
use crate::sweepover::SweepoverResolver;
use crate::upgrade::Coordinator;

/// A fee-paying activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationRequest {
    pub participant: ParticipantId,
    #[serde(default)]
    pub referrer: Option<ParticipantId>,
    pub program: Program,
    pub tier: Tier,
}

impl ActivationRequest {
    pub const fn new(
        participant: ParticipantId,
        referrer: Option<ParticipantId>,
        program: Program,
        tier: Tier,
    ) -> Self {
        Self {
            participant,
            referrer,
            program,
            tier,
        }
    }
}

/// The activation's own record and every event it caused, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationOutcome {
    pub record: PlacementRecord,
    pub events: Vec<Event>,
}

enum Task {
    Settle(PlacementRecord),
    Evaluate(ReserveAccount),
    Recycle(InstanceId),
    Advance {
        node: ParticipantId,
        structure: StructureId,
    },
}

pub struct Engine<S> {
    shared: Shared<S>,
    placement: PlacementEngine<S>,
    sweepover: SweepoverResolver<S>,
    ledger: ReserveLedger<S>,
    coordinator: Coordinator<S>,
    recycler: RecycleManager<S>,
    phases: GlobalPhases<S>,
}

impl<S> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            placement: self.placement.clone(),
            sweepover: self.sweepover.clone(),
            ledger: self.ledger.clone(),
            coordinator: self.coordinator.clone(),
            recycler: self.recycler.clone(),
            phases: self.phases.clone(),
        }
    }
}

impl<S: SlotStore> Engine<S> {
    /// Build an engine over `store`. The configuration is validated and its
    /// currency must match the store's.
    pub fn new(store: Arc<S>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        if store.currency() != config.currency {
            return Err(Error::Config(format!(
                "store holds {} but the engine is configured for {}",
                store.currency(),
                config.currency
            )));
        }

        let shared = Shared::new(store, config);
        let sweepover = SweepoverResolver::new(shared.clone());
        let placement = PlacementEngine::new(shared.clone(), sweepover.clone());
        Ok(Self {
            ledger: ReserveLedger::new(shared.clone()),
            coordinator: Coordinator::new(shared.clone(), placement.clone()),
            recycler: RecycleManager::new(shared.clone(), placement.clone()),
            phases: GlobalPhases::new(shared.clone(), placement.clone()),
            placement,
            sweepover,
            shared,
        })
    }

    /// Place a fee-paying activation and settle its consequences.
    ///
    /// If the participant's record exists but its settlement was cut short,
    /// the settlement is resumed and its outcome returned instead of
    /// [`Error::AlreadyPlaced`].
    pub async fn activate(&self, request: ActivationRequest) -> Result<ActivationOutcome> {
        let ActivationRequest {
            participant,
            referrer,
            program,
            tier,
        } = request;
        let context = Context::new(participant, program, tier);
        let mut events = Vec::new();
        let mut recycled = HashSet::new();
        let placed = loop {
            match self.placement.place(participant, referrer, program, tier).await {
                Err(Error::InstanceFull { instance, .. }) if recycled.insert(instance) => {
                    info!("{}: {} is complete, recycling it first", context, instance);
                    let queue = VecDeque::from([Task::Recycle(instance)]);
                    events.extend(self.settle(context, queue).await?);
                }
                placed => break placed,
            }
        };
        let record = match placed {
            Ok(record) => record,
            Err(Error::AlreadyPlaced { context, existing }) => {
                return self.resume_activation(context, existing).await;
            }
            Err(e) => return Err(e),
        };

        let queue = VecDeque::from([Task::Settle(record.clone())]);
        events.extend(self.settle(context, queue).await?);
        info!(
            "{}: activated in {}, {} events",
            context,
            record.structure,
            events.len()
        );
        Ok(ActivationOutcome { record, events })
    }

    /// Promote `owner` as far as their current reserves allow.
    pub async fn upgrade(&self, owner: ParticipantId, program: Program) -> Result<Vec<Event>> {
        let max = self.shared.config.program(program).max_tier();
        let context = Context::new(owner, program, max);
        let Some(held) = self.shared.highest_held(context, owner, program, max).await? else {
            return Ok(Vec::new());
        };
        let account = ReserveAccount::new(owner, program, held.next());
        self.settle(context, VecDeque::from([Task::Evaluate(account)]))
            .await
    }

    /// Settle every record whose settlement was interrupted, oldest first.
    pub async fn resume(&self) -> Result<Vec<Event>> {
        let pending = self.shared.store.unsettled().await.map_err(Error::Unsettled)?;
        let Some(first) = pending.first() else {
            return Ok(Vec::new());
        };
        let context = Context::new(first.participant, first.program, first.tier);
        warn!("{}: resuming {} unsettled records", context, pending.len());
        self.settle(context, pending.into_iter().map(Task::Settle).collect())
            .await
    }

    async fn resume_activation(&self, context: Context, existing: RecordId) -> Result<ActivationOutcome> {
        let store = &*self.shared.store;
        let pending = self.shared.call(context, || store.unsettled()).await?;
        let Some(record) = pending.iter().find(|r| r.id == existing).cloned() else {
            return Err(Error::AlreadyPlaced { context, existing });
        };
        warn!(
            "{}: {:?} was never fully settled, resuming {} records",
            context,
            existing,
            pending.len()
        );
        let events = self
            .settle(context, pending.into_iter().map(Task::Settle).collect())
            .await?;
        Ok(ActivationOutcome { record, events })
    }

    /// Drain `queue` and mark the records it settled. Nothing is marked
    /// unless the whole queue drained.
    async fn settle(&self, context: Context, queue: VecDeque<Task>) -> Result<Vec<Event>> {
        let drained = self.drain(queue).await;
        self.shared.locks.prune().await;
        let (events, settled) = drained?;
        if !settled.is_empty() {
            let store = &*self.shared.store;
            self.shared
                .call(context, || store.mark_settled(settled.clone()))
                .await?;
        }
        Ok(events)
    }

    async fn drain(&self, mut queue: VecDeque<Task>) -> Result<(Vec<Event>, Vec<RecordId>)> {
        let mut events = Vec::new();
        let mut settled = Vec::new();
        let mut unblocked = HashSet::new();
        while let Some(task) = queue.pop_front() {
            let outcome = self.run(&task, &mut queue, &mut events, &mut settled).await;
            match outcome {
                Ok(()) => {}
                // A complete instance that nobody recycled yet; recycle it and retry.
                Err(Error::InstanceFull { context, instance }) if unblocked.insert(instance) => {
                    debug!("{}: {} recycles first", context, instance);
                    queue.push_front(task);
                    queue.push_front(Task::Recycle(instance));
                }
                Err(e) => return Err(e),
            }
        }
        debug!("settled {} events for {} records", events.len(), settled.len());
        Ok((events, settled))
    }

    /// Run one task. Follow-up work is queued only once the task succeeded.
    async fn run(
        &self,
        task: &Task,
        queue: &mut VecDeque<Task>,
        events: &mut Vec<Event>,
        settled: &mut Vec<RecordId>,
    ) -> Result<()> {
        match task {
            Task::Settle(record) => {
                let attribution = self.ledger.attribute(record).await?;
                events.push(Event::placed(record));
                events.extend(attribution.events);
                queue.extend(attribution.credited.into_iter().map(Task::Evaluate));
                match (record.program, record.placement_parent) {
                    (Program::Matrix, Some(_)) => {
                        if let Some(instance) = record.structure.instance() {
                            queue.push_back(Task::Recycle(instance));
                        }
                    }
                    (Program::Global, Some(parent)) => queue.push_back(Task::Advance {
                        node: parent,
                        structure: record.structure,
                    }),
                    _ => {}
                }
                settled.push(record.id);
            }
            Task::Evaluate(account) => {
                if let Some(promotion) = self.coordinator.promote(*account).await? {
                    let carried = promotion.event.carried.is_some();
                    events.push(Event::Promoted(promotion.event));
                    queue.push_back(Task::Settle(promotion.record));
                    if carried {
                        queue.push_back(Task::Evaluate(account.carry_target()));
                    }
                }
            }
            Task::Recycle(instance) => {
                if let Some(recycle) = self.recycler.recycle_if_complete(*instance).await? {
                    events.push(Event::Recycled(recycle.event));
                    if let Some(reentry) = recycle.reentry {
                        queue.push_back(Task::Settle(reentry));
                    }
                }
            }
            Task::Advance { node, structure } => {
                if let Some(advance) = self.phases.advance_if_complete(*node, *structure).await? {
                    events.push(advance.event);
                    queue.push_back(Task::Settle(advance.record));
                }
            }
        }
        Ok(())
    }

    pub fn placement(&self) -> &PlacementEngine<S> {
        &self.placement
    }

    pub fn sweepover(&self) -> &SweepoverResolver<S> {
        &self.sweepover
    }

    pub fn ledger(&self) -> &ReserveLedger<S> {
        &self.ledger
    }

    pub fn coordinator(&self) -> &Coordinator<S> {
        &self.coordinator
    }

    pub fn recycler(&self) -> &RecycleManager<S> {
        &self.recycler
    }

    pub fn phases(&self) -> &GlobalPhases<S> {
        &self.phases
    }

    pub fn store(&self) -> &Arc<S> {
        &self.shared.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{PhaseEvent, PromotionEvent};
    use crate::testing::RiggedStore;
    use canopy_store::{Currency, EntryKind, Funding, MemoryStore, Money};
    use canopy_structure::{Phase, Position, SlotRole};
    use proptest::prelude::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::{HashMap, HashSet};
    use std::time::Duration;

    fn engine() -> Engine<MemoryStore> {
        Engine::new(Arc::new(MemoryStore::new(Currency::USD)), EngineConfig::default()).unwrap()
    }

    fn p(id: u64) -> ParticipantId {
        ParticipantId(id)
    }

    fn usd(amount: Decimal) -> Money {
        Money::new(amount, Currency::USD)
    }

    async fn join<S: SlotStore>(
        engine: &Engine<S>,
        participant: u64,
        referrer: Option<u64>,
        program: Program,
    ) -> ActivationOutcome {
        engine
            .activate(ActivationRequest::new(
                p(participant),
                referrer.map(ParticipantId),
                program,
                Tier(1),
            ))
            .await
            .unwrap()
    }

    fn recycles(events: &[Event]) -> Vec<&crate::events::RecycleEvent> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::Recycled(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    /// Every account's journal nets to its balance.
    async fn assert_conserved(store: &MemoryStore) {
        for (account, snapshot) in store.accounts().await {
            let mut net = Decimal::ZERO;
            for entry in store.journal(account).await {
                match entry.kind {
                    EntryKind::Credit => net += entry.amount.amount,
                    EntryKind::Debit => net -= entry.amount.amount,
                }
            }
            assert_eq!(net, snapshot.balance.amount, "{:?}", account);
            assert!(!snapshot.balance.is_negative());
        }
    }

    #[test]
    fn currency_must_match_the_store() {
        let euro = Currency::new("EUR").unwrap();
        let result = Engine::new(
            Arc::new(MemoryStore::new(Currency::USD)),
            EngineConfig::default().with_currency(euro),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn binary_referrals_spill_and_fund_the_referrer() {
        let engine = engine();
        join(&engine, 1, None, Program::Binary).await;
        join(&engine, 2, Some(1), Program::Binary).await;
        let third = join(&engine, 3, Some(1), Program::Binary).await;

        // The second child brings the root's tier 2 reserve to its cost.
        assert_eq!(third.record.position, Some(Position::BINARY_RIGHT));
        assert!(third.events.iter().any(|e| matches!(
            e,
            Event::Promoted(PromotionEvent {
                owner: ParticipantId(1),
                to_tier: Tier(2),
                funded_by: Funding::Reserve,
                ..
            })
        )));
        assert!(engine.store().holds(p(1), Program::Binary, Tier(2)).await.unwrap());

        let fourth = join(&engine, 4, Some(1), Program::Binary).await;
        assert_eq!(fourth.record.referrer, Some(p(1)));
        assert_eq!(fourth.record.placement_parent, Some(p(2)));
        assert_eq!(fourth.record.position, Some(Position::LEFT));
        assert_eq!(fourth.record.depth, 2);
        assert!(fourth.record.is_spillover);
        assert_eq!(
            engine.ledger().balance(p(2), Program::Binary, Tier(2)).await.unwrap(),
            usd(dec!(10))
        );

        // The spilled child's parent promotes under its own referrer.
        let fifth = join(&engine, 5, Some(1), Program::Binary).await;
        let promoted = fifth
            .events
            .iter()
            .find_map(|e| match e {
                Event::Placed(placed) if placed.participant == p(2) => Some(placed.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(promoted.tier, Tier(2));
        assert_eq!(promoted.placement_parent, Some(p(1)));
        assert_eq!(
            engine.ledger().balance(p(1), Program::Binary, Tier(3)).await.unwrap(),
            usd(dec!(20))
        );
        assert_conserved(engine.store()).await;
    }

    #[tokio::test]
    async fn three_matrix_middles_promote_the_owner() {
        let engine = engine();
        join(&engine, 1, None, Program::Matrix).await;
        for id in 2..=11 {
            join(&engine, id, Some(1), Program::Matrix).await;
        }
        assert_eq!(
            engine.ledger().balance(p(1), Program::Matrix, Tier(2)).await.unwrap(),
            usd(dec!(22))
        );

        let third_middle = join(&engine, 12, Some(1), Program::Matrix).await;
        assert_eq!(third_middle.record.slot_role, SlotRole::Middle);
        assert_eq!(third_middle.record.placement_parent, Some(p(4)));
        assert!(third_middle.events.iter().any(|e| matches!(
            e,
            Event::Promoted(PromotionEvent {
                owner: ParticipantId(1),
                from_tier: Tier(1),
                to_tier: Tier(2),
                funded_by: Funding::Reserve,
                ..
            })
        )));
        assert!(engine.ledger().balance(p(1), Program::Matrix, Tier(2)).await.unwrap().is_zero());
        let record = engine
            .store()
            .latest_record(p(1), Program::Matrix, Tier(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.funded_by, Funding::Reserve);
        assert_conserved(engine.store()).await;
    }

    #[tokio::test]
    async fn fifth_global_joiner_completes_phase_one() {
        let engine = engine();
        for id in 1..=4 {
            let outcome = join(&engine, id, None, Program::Global).await;
            assert!(!outcome.events.iter().any(|e| matches!(e, Event::PhaseAdvanced(_))));
        }
        let fifth = join(&engine, 5, None, Program::Global).await;
        assert_eq!(fifth.record.placement_parent, Some(p(1)));
        assert!(fifth.events.contains(&Event::PhaseAdvanced(PhaseEvent {
            owner: p(1),
            tier: Tier(1),
            from: Phase::One,
            to: Phase::Two,
            cycle: 0,
        })));

        let sixth = join(&engine, 6, None, Program::Global).await;
        assert_eq!(sixth.record.placement_parent, Some(p(2)));
        // Global activations never touch reserves.
        assert!(engine.store().accounts().await.is_empty());
    }

    #[tokio::test]
    async fn matrix_recycles_exactly_at_capacity() {
        let engine = engine();
        join(&engine, 1, None, Program::Matrix).await;
        for id in 2..=39 {
            let outcome = join(&engine, id, Some(1), Program::Matrix).await;
            assert!(recycles(&outcome.events).is_empty(), "recycled at {}", id);
        }
        let last = join(&engine, 40, Some(1), Program::Matrix).await;
        let recycled = recycles(&last.events);
        assert_eq!(recycled.len(), 1);
        assert_eq!(recycled[0].owner, p(1));
        assert_eq!(recycled[0].new_instance_id.number, 2);
        assert_eq!(recycled[0].reentered_under, None);

        let next = join(&engine, 41, Some(1), Program::Matrix).await;
        assert_eq!(next.record.structure_instance_no(), 2);
        assert_eq!(next.record.depth, 1);
        assert_conserved(engine.store()).await;
    }

    #[tokio::test]
    async fn a_second_activation_is_refused() {
        let engine = engine();
        join(&engine, 1, None, Program::Binary).await;
        let first = join(&engine, 2, Some(1), Program::Binary).await;
        let again = engine
            .activate(ActivationRequest::new(p(2), Some(p(1)), Program::Binary, Tier(1)))
            .await;
        assert!(matches!(
            again,
            Err(Error::AlreadyPlaced { existing, .. }) if existing == first.record.id
        ));
        assert_eq!(engine.store().records().await.len(), 2);
    }

    #[tokio::test]
    async fn transient_failures_do_not_leak() {
        let engine = engine();
        join(&engine, 1, None, Program::Binary).await;
        engine.store().fail_next(2);
        let outcome = join(&engine, 2, Some(1), Program::Binary).await;
        assert_eq!(outcome.record.placement_parent, Some(p(1)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_joins_never_share_a_slot() {
        let engine = Engine::new(
            Arc::new(MemoryStore::new(Currency::USD)),
            EngineConfig::default()
                .with_retries(3, 16)
                .with_retry_backoff(Duration::from_millis(1)),
        )
        .unwrap();
        join(&engine, 1, None, Program::Binary).await;

        let mut handles = Vec::new();
        for id in 2..=40u64 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .activate(ActivationRequest::new(p(id), Some(p(1)), Program::Binary, Tier(1)))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let records: Vec<_> = engine
            .store()
            .records()
            .await
            .into_iter()
            .filter(|r| r.structure == StructureId::Binary { tier: Tier(1) })
            .collect();
        assert_eq!(records.len(), 40);
        let slots: HashSet<_> = records
            .iter()
            .filter_map(|r| r.placement_parent.zip(r.position))
            .collect();
        assert_eq!(slots.len(), 39);
        assert_conserved(engine.store()).await;
    }

    /// No transient retries, so one injected outage fails the call.
    fn rigged_engine() -> (Arc<RiggedStore>, Engine<RiggedStore>) {
        let store = Arc::new(RiggedStore::new());
        let engine = Engine::new(
            store.clone(),
            EngineConfig::default()
                .with_retries(0, 4)
                .with_retry_backoff(Duration::from_millis(1)),
        )
        .unwrap();
        (store, engine)
    }

    #[tokio::test]
    async fn an_interrupted_recycle_is_finished_by_the_next_join() {
        let (store, engine) = rigged_engine();
        join(&engine, 1, None, Program::Matrix).await;
        for id in 2..=39 {
            join(&engine, id, Some(1), Program::Matrix).await;
        }

        store.fail_recycles(1);
        let fortieth = ActivationRequest::new(p(40), Some(p(1)), Program::Matrix, Tier(1));
        let failed = engine.activate(fortieth).await;
        assert!(matches!(
            failed,
            Err(Error::Store {
                source: canopy_store::Error::Unavailable(_),
                ..
            })
        ));
        let first = InstanceId::first(p(1), Tier(1));
        assert!(store.holds(p(40), Program::Matrix, Tier(1)).await.unwrap());
        assert!(!store.instance(first).await.unwrap().archived);

        // The full instance is recycled before the next entrant is placed.
        let next = join(&engine, 41, Some(1), Program::Matrix).await;
        assert_eq!(recycles(&next.events).len(), 1);
        assert_eq!(next.record.structure_instance_no(), 2);
        assert_eq!(next.record.depth, 1);
        assert!(store.instance(first).await.unwrap().archived);

        // Retrying the interrupted activation finishes its settlement once.
        let resumed = engine.activate(fortieth).await.unwrap();
        assert_eq!(resumed.record.participant, p(40));
        assert!(matches!(
            resumed.events.first(),
            Some(Event::Placed(placed)) if placed.participant == p(40)
        ));
        assert!(recycles(&resumed.events).is_empty());
        assert!(engine.resume().await.unwrap().is_empty());
        assert!(matches!(
            engine.activate(fortieth).await,
            Err(Error::AlreadyPlaced { .. })
        ));
        assert_conserved(&store.inner).await;
    }

    #[tokio::test]
    async fn an_interrupted_promotion_resumes_without_crediting_twice() {
        let (store, engine) = rigged_engine();
        join(&engine, 1, None, Program::Binary).await;
        join(&engine, 2, Some(1), Program::Binary).await;

        store.fail_promotions(1);
        let third = ActivationRequest::new(p(3), Some(p(1)), Program::Binary, Tier(1));
        assert!(engine.activate(third).await.is_err());
        let account = ReserveAccount::new(p(1), Program::Binary, Tier(2));
        assert_eq!(
            engine.ledger().balance(p(1), Program::Binary, Tier(2)).await.unwrap(),
            usd(dec!(20))
        );
        assert!(!store.holds(p(1), Program::Binary, Tier(2)).await.unwrap());

        let events = engine.resume().await.unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            Event::Promoted(PromotionEvent {
                owner: ParticipantId(1),
                to_tier: Tier(2),
                ..
            })
        )));
        assert!(!events.iter().any(|e| matches!(e, Event::ReserveCredited { .. })));
        assert!(engine.ledger().balance(p(1), Program::Binary, Tier(2)).await.unwrap().is_zero());
        // Two shares in, one promotion debit out.
        assert_eq!(store.inner.journal(account).await.len(), 3);

        assert!(engine.resume().await.unwrap().is_empty());
        assert!(matches!(engine.activate(third).await, Err(Error::AlreadyPlaced { .. })));
        assert_conserved(&store.inner).await;
    }

    #[tokio::test]
    async fn upgrade_without_reserve_changes_nothing() {
        let engine = engine();
        join(&engine, 1, None, Program::Matrix).await;
        assert!(engine.upgrade(p(1), Program::Matrix).await.unwrap().is_empty());
        assert!(engine.upgrade(p(9), Program::Matrix).await.unwrap().is_empty());
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        /// Any referral pattern yields a well-formed binary tree.
        #[test]
        fn binary_tree_stays_well_formed(picks in prop::collection::vec(any::<usize>(), 1..40)) {
            let records = runtime().block_on(async {
                let engine = engine();
                join(&engine, 1, None, Program::Binary).await;
                for (i, pick) in picks.iter().enumerate() {
                    let joined = i as u64 + 1;
                    let referrer = (*pick as u64 % joined) + 1;
                    join(&engine, joined + 1, Some(referrer), Program::Binary).await;
                }
                engine.store().records().await
            });

            let tree: Vec<_> = records
                .iter()
                .filter(|r| r.structure == StructureId::Binary { tier: Tier(1) })
                .collect();
            prop_assert_eq!(tree.len(), picks.len() + 1);

            let by_participant: HashMap<_, _> = tree.iter().map(|r| (r.participant, *r)).collect();
            prop_assert_eq!(by_participant.len(), tree.len());

            let mut slots = HashSet::new();
            let mut per_level: HashMap<u32, u64> = HashMap::new();
            for record in &tree {
                *per_level.entry(record.depth).or_default() += 1;
                let Some(parent) = record.placement_parent else {
                    prop_assert_eq!(record.depth, 0);
                    continue;
                };
                prop_assert!(slots.insert((parent, record.position)));
                prop_assert_eq!(record.depth, by_participant[&parent].depth + 1);

                // The slot lies inside the referrer's subtree.
                let referrer = record.referrer.unwrap();
                let mut cursor = Some(parent);
                let mut found = false;
                while let Some(node) = cursor {
                    if node == referrer {
                        found = true;
                        break;
                    }
                    cursor = by_participant[&node].placement_parent;
                }
                prop_assert!(found);
                prop_assert_eq!(record.is_spillover, parent != referrer);
            }
            for (depth, count) in per_level {
                prop_assert!(count <= 1u64 << depth);
            }
        }
    }
}
