//! A store wrapper for tests that need faults or data the memory store
//! refuses to hold.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use canopy_store::{
    Conflict, Currency, InstanceId, LedgerEntry, MatrixInstance, MemoryStore, ParticipantId,
    PlacementDraft, PlacementRecord, RecordId, ReserveAccount, ReserveSnapshot, ReserveWrite,
    RootKey, SlotStore, StructureId,
};
use canopy_structure::{Program, Tier};

pub(crate) struct RiggedStore {
    pub inner: MemoryStore,
    failing_recycles: AtomicU32,
    failing_promotions: AtomicU32,
    slots_taken: AtomicBool,
    /// Replacement placement parents, applied to every record read back.
    parents: Mutex<HashMap<ParticipantId, ParticipantId>>,
    /// Replacement child lists.
    children: Mutex<HashMap<ParticipantId, Vec<PlacementRecord>>>,
}

impl RiggedStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(Currency::USD),
            failing_recycles: AtomicU32::new(0),
            failing_promotions: AtomicU32::new(0),
            slots_taken: AtomicBool::new(false),
            parents: Mutex::new(HashMap::new()),
            children: Mutex::new(HashMap::new()),
        }
    }

    /// The next `count` recycle commits fail as unavailable.
    pub fn fail_recycles(&self, count: u32) {
        self.failing_recycles.store(count, Ordering::SeqCst);
    }

    /// The next `count` promotion commits fail as unavailable.
    pub fn fail_promotions(&self, count: u32) {
        self.failing_promotions.store(count, Ordering::SeqCst);
    }

    /// Every insert and root claim from now on loses its race.
    pub fn take_every_slot(&self) {
        self.slots_taken.store(true, Ordering::SeqCst);
    }

    pub fn reparent(&self, participant: ParticipantId, parent: ParticipantId) {
        self.parents.lock().unwrap().insert(participant, parent);
    }

    pub fn replace_children(&self, parent: ParticipantId, children: Vec<PlacementRecord>) {
        self.children.lock().unwrap().insert(parent, children);
    }

    fn rigged(&self, mut record: PlacementRecord) -> PlacementRecord {
        if let Some(parent) = self.parents.lock().unwrap().get(&record.participant) {
            record.placement_parent = Some(*parent);
        }
        record
    }

    fn outage(counter: &AtomicU32) -> canopy_store::Result<()> {
        let failed = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(canopy_store::Error::Unavailable("outage".into()));
        }
        Ok(())
    }

    fn race(&self, draft: &PlacementDraft) -> canopy_store::Result<()> {
        if !self.slots_taken.load(Ordering::SeqCst) {
            return Ok(());
        }
        Err(Conflict::SlotTaken {
            structure: draft.structure,
            parent: draft.placement_parent.unwrap_or(draft.participant),
            position: draft.position.unwrap_or_default(),
        }
        .into())
    }
}

impl SlotStore for RiggedStore {
    fn currency(&self) -> Currency {
        self.inner.currency()
    }

    async fn root(&self, key: RootKey) -> canopy_store::Result<Option<PlacementRecord>> {
        Ok(self.inner.root(key).await?.map(|r| self.rigged(r)))
    }

    async fn claim_root(&self, draft: PlacementDraft) -> canopy_store::Result<PlacementRecord> {
        self.race(&draft)?;
        self.inner.claim_root(draft).await
    }

    async fn children(
        &self,
        structure: StructureId,
        parent: ParticipantId,
    ) -> canopy_store::Result<Vec<PlacementRecord>> {
        if let Some(children) = self.children.lock().unwrap().get(&parent) {
            return Ok(children.clone());
        }
        let children = self.inner.children(structure, parent).await?;
        Ok(children.into_iter().map(|r| self.rigged(r)).collect())
    }

    async fn insert_placement(&self, draft: PlacementDraft) -> canopy_store::Result<PlacementRecord> {
        self.race(&draft)?;
        self.inner.insert_placement(draft).await
    }

    async fn record(&self, id: RecordId) -> canopy_store::Result<Option<PlacementRecord>> {
        Ok(self.inner.record(id).await?.map(|r| self.rigged(r)))
    }

    async fn records_for(
        &self,
        participant: ParticipantId,
        program: Program,
        tier: Tier,
    ) -> canopy_store::Result<Vec<PlacementRecord>> {
        let records = self.inner.records_for(participant, program, tier).await?;
        Ok(records.into_iter().map(|r| self.rigged(r)).collect())
    }

    async fn read_reserve(&self, account: ReserveAccount) -> canopy_store::Result<ReserveSnapshot> {
        self.inner.read_reserve(account).await
    }

    async fn write_reserve(&self, write: ReserveWrite) -> canopy_store::Result<u64> {
        self.inner.write_reserve(write).await
    }

    async fn journal_entries(&self, account: ReserveAccount) -> canopy_store::Result<Vec<LedgerEntry>> {
        self.inner.journal_entries(account).await
    }

    async fn current_instance(&self, owner: ParticipantId, tier: Tier) -> canopy_store::Result<InstanceId> {
        self.inner.current_instance(owner, tier).await
    }

    async fn instance(&self, id: InstanceId) -> canopy_store::Result<MatrixInstance> {
        self.inner.instance(id).await
    }

    async fn commit_recycle(
        &self,
        id: InstanceId,
        reentry: Option<PlacementDraft>,
    ) -> canopy_store::Result<(InstanceId, Option<PlacementRecord>)> {
        Self::outage(&self.failing_recycles)?;
        self.inner.commit_recycle(id, reentry).await
    }

    async fn commit_promotion(
        &self,
        writes: Vec<ReserveWrite>,
        draft: PlacementDraft,
    ) -> canopy_store::Result<PlacementRecord> {
        Self::outage(&self.failing_promotions)?;
        self.race(&draft)?;
        self.inner.commit_promotion(writes, draft).await
    }

    async fn unsettled(&self) -> canopy_store::Result<Vec<PlacementRecord>> {
        self.inner.unsettled().await
    }

    async fn mark_settled(&self, ids: Vec<RecordId>) -> canopy_store::Result<()> {
        self.inner.mark_settled(ids).await
    }
}
