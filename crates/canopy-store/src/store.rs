//! The slot store contract.
//!
//! The store is the persistent indexed relation behind every placement. It
//! does not decide where anyone goes; it only refuses writes that would
//! break uniqueness, so that concurrent placers can detect that they lost a
//! race and rescan.

use std::future::Future;

use canopy_structure::{Position, Program, Tier};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ids::{InstanceId, ParticipantId, RecordId, RootKey, StructureId};
use crate::money::Currency;
use crate::record::{PlacementDraft, PlacementRecord};
use crate::reserve::{LedgerEntry, ReserveAccount, ReserveSnapshot, ReserveWrite};

/// Occupancy of one matrix instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixInstance {
    pub id: InstanceId,
    /// Occupied slots below the owner.
    pub population: u64,
    /// Archived instances are immutable.
    pub archived: bool,
}

impl MatrixInstance {
    pub const fn open(id: InstanceId) -> Self {
        Self {
            id,
            population: 0,
            archived: false,
        }
    }
}

/// Persistent storage of placements, reserves and matrix instances.
///
/// Every write is all-or-nothing. Writes that lose an optimistic
/// concurrency race fail with [`Error::Conflict`](crate::Error::Conflict).
pub trait SlotStore: Send + Sync + 'static {
    /// Currency every reserve balance is held in.
    fn currency(&self) -> Currency;

    /// The claimed root of a structure family, if any.
    fn root(&self, key: RootKey) -> impl Future<Output = Result<Option<PlacementRecord>>> + Send;

    /// Atomically claim a structure's root. Fails if already claimed.
    fn claim_root(
        &self,
        draft: PlacementDraft,
    ) -> impl Future<Output = Result<PlacementRecord>> + Send;

    /// Children of `parent` inside `structure`, ordered by position.
    fn children(
        &self,
        structure: StructureId,
        parent: ParticipantId,
    ) -> impl Future<Output = Result<Vec<PlacementRecord>>> + Send;

    /// Open positions under `node`, in the order they are tried.
    fn find_open_children(
        &self,
        structure: StructureId,
        node: ParticipantId,
    ) -> impl Future<Output = Result<Vec<Position>>> + Send {
        async move {
            let occupied: Vec<Position> = self
                .children(structure, node)
                .await?
                .iter()
                .filter_map(|r| r.position)
                .collect();
            Ok(structure.shape().open_positions(&occupied))
        }
    }

    /// Insert a non-root placement. Fails with a conflict if the slot or the
    /// record key is already taken.
    fn insert_placement(
        &self,
        draft: PlacementDraft,
    ) -> impl Future<Output = Result<PlacementRecord>> + Send;

    fn record(&self, id: RecordId) -> impl Future<Output = Result<Option<PlacementRecord>>> + Send;

    /// All records of a participant at a program tier, in creation order.
    fn records_for(
        &self,
        participant: ParticipantId,
        program: Program,
        tier: Tier,
    ) -> impl Future<Output = Result<Vec<PlacementRecord>>> + Send;

    /// Most recent record of a participant at a program tier.
    fn latest_record(
        &self,
        participant: ParticipantId,
        program: Program,
        tier: Tier,
    ) -> impl Future<Output = Result<Option<PlacementRecord>>> + Send {
        async move {
            Ok(self
                .records_for(participant, program, tier)
                .await?
                .into_iter()
                .next_back())
        }
    }

    /// Whether the participant has activated the tier.
    fn holds(
        &self,
        participant: ParticipantId,
        program: Program,
        tier: Tier,
    ) -> impl Future<Output = Result<bool>> + Send {
        async move {
            Ok(!self
                .records_for(participant, program, tier)
                .await?
                .is_empty())
        }
    }

    fn read_reserve(
        &self,
        account: ReserveAccount,
    ) -> impl Future<Output = Result<ReserveSnapshot>> + Send;

    /// Compare-and-swap a reserve balance; returns the new version.
    fn write_reserve(&self, write: ReserveWrite) -> impl Future<Output = Result<u64>> + Send;

    /// Journal entries of one account, oldest first.
    fn journal_entries(
        &self,
        account: ReserveAccount,
    ) -> impl Future<Output = Result<Vec<LedgerEntry>>> + Send;

    /// The instance currently open for `owner` at `tier`.
    fn current_instance(
        &self,
        owner: ParticipantId,
        tier: Tier,
    ) -> impl Future<Output = Result<InstanceId>> + Send;

    fn instance(&self, id: InstanceId) -> impl Future<Output = Result<MatrixInstance>> + Send;

    /// Archive a completed instance, open its successor and insert the
    /// owner's re-entry (if any) as one atomic unit.
    fn commit_recycle(
        &self,
        id: InstanceId,
        reentry: Option<PlacementDraft>,
    ) -> impl Future<Output = Result<(InstanceId, Option<PlacementRecord>)>> + Send;

    /// Apply reserve writes and insert (or root-claim) a placement as one
    /// atomic unit. Nothing is written if any part conflicts.
    fn commit_promotion(
        &self,
        writes: Vec<ReserveWrite>,
        draft: PlacementDraft,
    ) -> impl Future<Output = Result<PlacementRecord>> + Send;

    /// Records whose consequences have not been settled, in creation order.
    fn unsettled(&self) -> impl Future<Output = Result<Vec<PlacementRecord>>> + Send;

    /// Mark records as settled. Unknown ids are refused and nothing is
    /// marked.
    fn mark_settled(&self, ids: Vec<RecordId>) -> impl Future<Output = Result<()>> + Send;
}
