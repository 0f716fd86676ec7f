//! In-memory slot store.
//!
//! [`StoreState`] holds the indexed relations and enforces every uniqueness
//! rule synchronously; [`MemoryStore`] wraps it in an async `RwLock` so that
//! each trait call is a single critical section.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};

use canopy_structure::{Position, Program, Tier};
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::error::{Conflict, Error, Result};
use crate::ids::{InstanceId, ParticipantId, RecordId, RootKey, StructureId};
use crate::money::{Currency, Money};
use crate::record::{PlacementDraft, PlacementRecord, RecordKey};
use crate::reserve::{LedgerEntry, ReserveAccount, ReserveSnapshot, ReserveWrite};
use crate::store::{MatrixInstance, SlotStore};

/// Indexed placement, reserve and instance state.
#[derive(Debug)]
pub struct StoreState {
    currency: Currency,
    next_sequence: u64,
    records: HashMap<RecordId, PlacementRecord>,
    keys: HashMap<RecordKey, RecordId>,
    by_participant: HashMap<(ParticipantId, Program, Tier), Vec<RecordId>>,
    roots: HashMap<RootKey, RecordId>,
    nodes: HashSet<(StructureId, ParticipantId)>,
    children: HashMap<(StructureId, ParticipantId), BTreeMap<Position, RecordId>>,
    reserves: HashMap<ReserveAccount, ReserveSnapshot>,
    journal: Vec<LedgerEntry>,
    instances: HashMap<InstanceId, MatrixInstance>,
    current_instances: HashMap<(ParticipantId, Tier), u32>,
    settled: HashSet<RecordId>,
}

impl StoreState {
    /// Create empty state holding reserves in `currency`.
    pub fn new(currency: Currency) -> Self {
        Self {
            currency,
            next_sequence: 0,
            records: HashMap::new(),
            keys: HashMap::new(),
            by_participant: HashMap::new(),
            roots: HashMap::new(),
            nodes: HashSet::new(),
            children: HashMap::new(),
            reserves: HashMap::new(),
            journal: Vec::new(),
            instances: HashMap::new(),
            current_instances: HashMap::new(),
            settled: HashSet::new(),
        }
    }

    pub fn root(&self, key: &RootKey) -> Option<&PlacementRecord> {
        self.roots.get(key).and_then(|id| self.records.get(id))
    }

    pub fn record(&self, id: RecordId) -> Option<&PlacementRecord> {
        self.records.get(&id)
    }

    /// Children of `parent` in `structure`, ordered by position.
    pub fn children(&self, structure: StructureId, parent: ParticipantId) -> Vec<PlacementRecord> {
        self.children
            .get(&(structure, parent))
            .map(|slots| {
                slots
                    .values()
                    .filter_map(|id| self.records.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn records_for(
        &self,
        participant: ParticipantId,
        program: Program,
        tier: Tier,
    ) -> Vec<PlacementRecord> {
        self.by_participant
            .get(&(participant, program, tier))
            .map(|ids| ids.iter().filter_map(|id| self.records.get(id)).cloned().collect())
            .unwrap_or_default()
    }

    /// All records in creation order.
    pub fn records(&self) -> Vec<PlacementRecord> {
        let mut all: Vec<_> = self.records.values().cloned().collect();
        all.sort_by_key(|r| r.sequence);
        all
    }

    /// Records not yet marked settled, in creation order.
    pub fn unsettled(&self) -> Vec<PlacementRecord> {
        let mut pending: Vec<_> = self
            .records
            .values()
            .filter(|r| !self.settled.contains(&r.id))
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.sequence);
        pending
    }

    pub fn mark_settled(&mut self, ids: &[RecordId]) -> Result<()> {
        if let Some(unknown) = ids.iter().find(|id| !self.records.contains_key(id)) {
            return Err(Error::NotFound(format!("record {:?}", unknown)));
        }
        self.settled.extend(ids.iter().copied());
        trace!("{} records settled", ids.len());
        Ok(())
    }

    pub fn reserve(&self, account: &ReserveAccount) -> ReserveSnapshot {
        self.reserves.get(account).copied().unwrap_or(ReserveSnapshot {
            balance: Money::zero(self.currency),
            version: 0,
        })
    }

    /// Every account that was ever written.
    pub fn accounts(&self) -> Vec<(ReserveAccount, ReserveSnapshot)> {
        let mut all: Vec<_> = self.reserves.iter().map(|(a, s)| (*a, *s)).collect();
        all.sort_by_key(|(a, _)| *a);
        all
    }

    /// Journal entries for one account, oldest first.
    pub fn journal(&self, account: &ReserveAccount) -> Vec<LedgerEntry> {
        self.journal
            .iter()
            .filter(|e| e.account == *account)
            .cloned()
            .collect()
    }

    pub fn current_instance(&self, owner: ParticipantId, tier: Tier) -> InstanceId {
        let number = self
            .current_instances
            .get(&(owner, tier))
            .copied()
            .unwrap_or(1);
        InstanceId {
            owner,
            tier,
            number,
        }
    }

    pub fn instance(&self, id: InstanceId) -> MatrixInstance {
        self.instances
            .get(&id)
            .copied()
            .unwrap_or(MatrixInstance::open(id))
    }

    fn is_node(&self, structure: StructureId, participant: ParticipantId) -> bool {
        if let Some(instance) = structure.instance() {
            if instance.owner == participant {
                return true;
            }
        }
        self.nodes.contains(&(structure, participant))
    }

    /// Check a draft against every uniqueness rule without writing.
    pub fn validate_insert(&self, draft: &PlacementDraft) -> Result<()> {
        if self.keys.contains_key(&draft.key()) {
            return Err(Conflict::RecordExists(draft.participant).into());
        }

        let structure = draft.structure;
        if let Some(instance) = structure.instance() {
            let current = self.current_instance(instance.owner, instance.tier);
            let state = self.instance(instance);
            let full = structure
                .shape()
                .capacity()
                .is_some_and(|cap| state.population >= cap);
            if current != instance || state.archived || (!draft.is_root() && full) {
                return Err(Conflict::InstanceClosed(instance).into());
            }
        }

        let Some(parent) = draft.placement_parent else {
            if self.roots.contains_key(&structure.root_key()) {
                return Err(Conflict::RootClaimed(structure).into());
            }
            return Ok(());
        };

        let position = draft
            .position
            .ok_or_else(|| Error::Invariant(format!("{} placed under {} without a position", draft.participant, parent)))?;
        let shape = structure.shape();
        if position.value() >= shape.branching() {
            return Err(Error::Invariant(format!(
                "position {} out of range for branching {}",
                position.value(),
                shape.branching()
            )));
        }
        if let Some(max) = shape.max_depth() {
            if draft.depth == 0 || draft.depth > max {
                return Err(Error::Invariant(format!(
                    "depth {} outside 1..={} in {}",
                    draft.depth, max, structure
                )));
            }
        }
        if !self.is_node(structure, parent) {
            return Err(Error::NotFound(format!("{} is not a node of {}", parent, structure)));
        }
        let taken = self
            .children
            .get(&(structure, parent))
            .is_some_and(|slots| slots.contains_key(&position));
        if taken {
            return Err(Conflict::SlotTaken {
                structure,
                parent,
                position,
            }
            .into());
        }
        Ok(())
    }

    fn apply_insert(&mut self, draft: PlacementDraft) -> PlacementRecord {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let id = RecordId(sequence);
        let record = PlacementRecord::from_draft(id, sequence, draft);
        let structure = record.structure;

        self.keys.insert(record.key(), id);
        self.by_participant
            .entry((record.participant, record.program, record.tier))
            .or_default()
            .push(id);
        self.nodes.insert((structure, record.participant));

        match (record.placement_parent, record.position) {
            (Some(parent), Some(position)) => {
                self.children
                    .entry((structure, parent))
                    .or_default()
                    .insert(position, id);
                if let Some(instance) = structure.instance() {
                    self.instances
                        .entry(instance)
                        .or_insert_with(|| MatrixInstance::open(instance))
                        .population += 1;
                }
            }
            _ => {
                self.roots.insert(structure.root_key(), id);
            }
        }

        debug!(
            "Stored {} in {} under {:?} at depth {}",
            record.participant, structure, record.placement_parent, record.depth
        );
        self.records.insert(id, record.clone());
        record
    }

    /// Insert a non-root placement.
    pub fn insert_placement(&mut self, draft: PlacementDraft) -> Result<PlacementRecord> {
        if draft.is_root() {
            return Err(Error::Invariant(format!(
                "{} has no placement parent; roots must be claimed",
                draft.participant
            )));
        }
        self.validate_insert(&draft)?;
        Ok(self.apply_insert(draft))
    }

    /// Claim a structure's root.
    pub fn claim_root(&mut self, draft: PlacementDraft) -> Result<PlacementRecord> {
        if !draft.is_root() {
            return Err(Error::Invariant(format!(
                "{} claims a root but names parent {:?}",
                draft.participant, draft.placement_parent
            )));
        }
        self.validate_insert(&draft)?;
        Ok(self.apply_insert(draft))
    }

    fn validate_write(&self, write: &ReserveWrite) -> Result<()> {
        if write.entry.account != write.account {
            return Err(Error::Invariant(format!(
                "journal entry for {:?} attached to write of {:?}",
                write.entry.account, write.account
            )));
        }
        if write.balance.currency != self.currency {
            return Err(Error::CurrencyMismatch {
                expected: self.currency,
                actual: write.balance.currency,
            });
        }
        if write.balance.is_negative() {
            return Err(Error::Invariant(format!(
                "negative balance {} for {:?}",
                write.balance, write.account
            )));
        }
        let actual = self.reserve(&write.account).version;
        if actual != write.expected_version {
            return Err(Conflict::VersionMismatch {
                expected: write.expected_version,
                actual,
            }
            .into());
        }
        Ok(())
    }

    fn apply_write(&mut self, write: ReserveWrite) -> u64 {
        let version = write.expected_version + 1;
        trace!("Reserve {:?} -> {} (v{})", write.account, write.balance, version);
        self.reserves.insert(
            write.account,
            ReserveSnapshot {
                balance: write.balance,
                version,
            },
        );
        self.journal.push(write.entry);
        version
    }

    /// Compare-and-swap one reserve balance.
    pub fn write_reserve(&mut self, write: ReserveWrite) -> Result<u64> {
        self.validate_write(&write)?;
        Ok(self.apply_write(write))
    }

    /// Apply writes and a placement atomically.
    pub fn commit_promotion(
        &mut self,
        writes: Vec<ReserveWrite>,
        draft: PlacementDraft,
    ) -> Result<PlacementRecord> {
        let mut seen = HashSet::new();
        for write in &writes {
            if !seen.insert(write.account) {
                return Err(Error::Invariant(format!(
                    "account {:?} written twice in one commit",
                    write.account
                )));
            }
            self.validate_write(write)?;
        }
        self.validate_insert(&draft)?;

        for write in writes {
            self.apply_write(write);
        }
        Ok(self.apply_insert(draft))
    }

    fn validate_recycle(&self, id: InstanceId) -> Result<MatrixInstance> {
        let current = self.current_instance(id.owner, id.tier);
        let state = self.instance(id);
        if current != id || state.archived {
            return Err(Conflict::InstanceClosed(id).into());
        }
        Ok(state)
    }

    /// Archive the current instance and open its successor.
    fn archive_and_reopen(&mut self, id: InstanceId) -> Result<InstanceId> {
        let state = self.validate_recycle(id)?;
        self.instances.insert(
            id,
            MatrixInstance {
                archived: true,
                ..state
            },
        );
        let next = id.successor();
        self.instances.insert(next, MatrixInstance::open(next));
        self.current_instances.insert((id.owner, id.tier), next.number);
        debug!("Archived {} at population {}, opened {}", id, state.population, next);
        Ok(next)
    }

    /// Archive a completed instance and insert the owner's re-entry atomically.
    pub fn commit_recycle(
        &mut self,
        id: InstanceId,
        reentry: Option<PlacementDraft>,
    ) -> Result<(InstanceId, Option<PlacementRecord>)> {
        let state = self.validate_recycle(id)?;
        let complete = StructureId::Matrix { instance: id }
            .shape()
            .capacity()
            .is_some_and(|cap| state.population >= cap);
        if !complete {
            return Err(Error::Invariant(format!(
                "{} recycled at population {}",
                id, state.population
            )));
        }
        if let Some(draft) = &reentry {
            if draft.structure.instance() == Some(id) {
                return Err(Error::Invariant(format!(
                    "{} re-entering its own completed instance",
                    draft.participant
                )));
            }
            if draft.is_root() {
                return Err(Error::Invariant(format!(
                    "{} re-entry must name a placement parent",
                    draft.participant
                )));
            }
            self.validate_insert(draft)?;
        }

        let next = self.archive_and_reopen(id)?;
        let record = reentry.map(|draft| self.apply_insert(draft));
        Ok((next, record))
    }
}

/// Async in-memory [`SlotStore`].
#[derive(Debug)]
pub struct MemoryStore {
    currency: Currency,
    state: RwLock<StoreState>,
    /// Calls left that fail with `Unavailable`, for exercising retries.
    pending_failures: AtomicU32,
}

impl MemoryStore {
    pub fn new(currency: Currency) -> Self {
        Self {
            currency,
            state: RwLock::new(StoreState::new(currency)),
            pending_failures: AtomicU32::new(0),
        }
    }

    /// Make the next `count` calls fail with a transient error.
    pub fn fail_next(&self, count: u32) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        let failed = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(Error::Unavailable("injected failure".into()));
        }
        Ok(())
    }

    /// All records in creation order.
    pub async fn records(&self) -> Vec<PlacementRecord> {
        self.state.read().await.records()
    }

    pub async fn accounts(&self) -> Vec<(ReserveAccount, ReserveSnapshot)> {
        self.state.read().await.accounts()
    }

    pub async fn journal(&self, account: ReserveAccount) -> Vec<LedgerEntry> {
        self.state.read().await.journal(&account)
    }
}

impl SlotStore for MemoryStore {
    fn currency(&self) -> Currency {
        self.currency
    }

    async fn root(&self, key: RootKey) -> Result<Option<PlacementRecord>> {
        self.check_available()?;
        Ok(self.state.read().await.root(&key).cloned())
    }

    async fn claim_root(&self, draft: PlacementDraft) -> Result<PlacementRecord> {
        self.check_available()?;
        self.state.write().await.claim_root(draft)
    }

    async fn children(
        &self,
        structure: StructureId,
        parent: ParticipantId,
    ) -> Result<Vec<PlacementRecord>> {
        self.check_available()?;
        Ok(self.state.read().await.children(structure, parent))
    }

    async fn insert_placement(&self, draft: PlacementDraft) -> Result<PlacementRecord> {
        self.check_available()?;
        self.state.write().await.insert_placement(draft)
    }

    async fn record(&self, id: RecordId) -> Result<Option<PlacementRecord>> {
        self.check_available()?;
        Ok(self.state.read().await.record(id).cloned())
    }

    async fn records_for(
        &self,
        participant: ParticipantId,
        program: Program,
        tier: Tier,
    ) -> Result<Vec<PlacementRecord>> {
        self.check_available()?;
        Ok(self.state.read().await.records_for(participant, program, tier))
    }

    async fn read_reserve(&self, account: ReserveAccount) -> Result<ReserveSnapshot> {
        self.check_available()?;
        Ok(self.state.read().await.reserve(&account))
    }

    async fn write_reserve(&self, write: ReserveWrite) -> Result<u64> {
        self.check_available()?;
        self.state.write().await.write_reserve(write)
    }

    async fn journal_entries(&self, account: ReserveAccount) -> Result<Vec<LedgerEntry>> {
        self.check_available()?;
        Ok(self.state.read().await.journal(&account))
    }

    async fn current_instance(&self, owner: ParticipantId, tier: Tier) -> Result<InstanceId> {
        self.check_available()?;
        Ok(self.state.read().await.current_instance(owner, tier))
    }

    async fn instance(&self, id: InstanceId) -> Result<MatrixInstance> {
        self.check_available()?;
        Ok(self.state.read().await.instance(id))
    }

    async fn commit_recycle(
        &self,
        id: InstanceId,
        reentry: Option<PlacementDraft>,
    ) -> Result<(InstanceId, Option<PlacementRecord>)> {
        self.check_available()?;
        self.state.write().await.commit_recycle(id, reentry)
    }

    async fn commit_promotion(
        &self,
        writes: Vec<ReserveWrite>,
        draft: PlacementDraft,
    ) -> Result<PlacementRecord> {
        self.check_available()?;
        self.state.write().await.commit_promotion(writes, draft)
    }

    async fn unsettled(&self) -> Result<Vec<PlacementRecord>> {
        self.check_available()?;
        Ok(self.state.read().await.unsettled())
    }

    async fn mark_settled(&self, ids: Vec<RecordId>) -> Result<()> {
        self.check_available()?;
        self.state.write().await.mark_settled(&ids)
    }
}
