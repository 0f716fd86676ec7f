//! Placement engine.
//!
//! Finds the slot an entrant occupies and commits the record:
//!
//! - **Binary**: breadth first from the referrer in the tier's shared tree,
//!   left before right.
//! - **Matrix**: breadth first inside the anchor's current instance, three
//!   levels deep, left-center-right.
//! - **Global**: breadth first from the root of the tier and phase tree, in
//!   arrival order; the first entrant claims the root.
//!
//! The scan and the insert run under the anchor's scope lock. The store
//! still refuses a slot that a racing placer took first; the engine then
//! rescans, a bounded number of times.

use std::collections::{HashSet, VecDeque};

use canopy_store::{
    Conflict, Funding, ParticipantId, PlacementDraft, PlacementRecord, RootKey, SlotStore,
    StructureId,
};
use canopy_structure::{Phase, Position, Program, SlotIndex, SlotRole, Tier};
use tracing::debug;

use crate::error::{Context, Error, Result, StoreResultExt};
use crate::locks::ScopeKey;
use crate::shared::Shared;
use crate::sweepover::{Recipient, SweepoverResolver};

/// Where a scan starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Anchor {
    /// Claim the structure's root.
    Root,
    /// Binary subtree rooted at a participant.
    Subtree(ParticipantId),
    /// A participant's current matrix instance.
    Instance(ParticipantId),
    /// The global tree of the request's tier and phase.
    Serial,
}

impl Anchor {
    fn on(program: Program, participant: ParticipantId) -> Self {
        match program {
            Program::Binary => Self::Subtree(participant),
            Program::Matrix => Self::Instance(participant),
            Program::Global => Self::Serial,
        }
    }
}

/// How a request's anchor is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AnchorMode {
    /// On the referrer; claim the root when there is none.
    Referrer,
    /// On `preferred` if it holds the tier, otherwise on the nearest
    /// eligible ancestor, otherwise on the fallback.
    Sweepover { preferred: Option<ParticipantId> },
    /// Already decided by the caller.
    Fixed(Anchor),
}

/// Everything needed to place one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PlacementRequest {
    pub participant: ParticipantId,
    pub program: Program,
    pub tier: Tier,
    pub phase: Phase,
    pub cycle: u32,
    pub referrer: Option<ParticipantId>,
    pub funded_by: Funding,
    pub mode: AnchorMode,
}

impl PlacementRequest {
    /// A fee-paying activation.
    pub fn fee(
        participant: ParticipantId,
        referrer: Option<ParticipantId>,
        program: Program,
        tier: Tier,
    ) -> Self {
        let mode = match program {
            Program::Global => AnchorMode::Fixed(Anchor::Serial),
            _ => AnchorMode::Referrer,
        };
        Self {
            participant,
            program,
            tier,
            phase: Phase::One,
            cycle: 0,
            referrer,
            funded_by: Funding::Fee,
            mode,
        }
    }

    /// An activation created by the engine itself.
    pub fn synthetic(
        participant: ParticipantId,
        referrer: Option<ParticipantId>,
        program: Program,
        tier: Tier,
        funded_by: Funding,
    ) -> Self {
        let mode = match program {
            Program::Global => AnchorMode::Fixed(Anchor::Serial),
            _ => AnchorMode::Sweepover {
                preferred: referrer,
            },
        };
        Self {
            participant,
            program,
            tier,
            phase: Phase::One,
            cycle: 0,
            referrer,
            funded_by,
            mode,
        }
    }

    #[must_use]
    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }

    #[must_use]
    pub fn with_cycle(mut self, cycle: u32) -> Self {
        self.cycle = cycle;
        self
    }

    #[must_use]
    pub fn with_mode(mut self, mode: AnchorMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn context(&self) -> Context {
        Context::new(self.participant, self.program, self.tier)
    }

    fn root_key(&self) -> RootKey {
        RootKey {
            program: self.program,
            tier: self.tier,
            phase: self.phase,
        }
    }

    fn scope(&self, anchor: Anchor) -> ScopeKey {
        match anchor {
            Anchor::Root | Anchor::Serial => ScopeKey::Root(self.root_key()),
            Anchor::Subtree(owner) | Anchor::Instance(owner) => {
                ScopeKey::owner(self.program, owner)
            }
        }
    }
}

/// First free slot found by a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OpenSlot {
    parent: ParticipantId,
    position: Position,
    depth: u32,
    /// Level-order index below the scan's anchor.
    slot: SlotIndex,
}

pub struct PlacementEngine<S> {
    shared: Shared<S>,
    sweepover: SweepoverResolver<S>,
}

impl<S> Clone for PlacementEngine<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            sweepover: self.sweepover.clone(),
        }
    }
}

impl<S: SlotStore> PlacementEngine<S> {
    pub(crate) fn new(shared: Shared<S>, sweepover: SweepoverResolver<S>) -> Self {
        Self { shared, sweepover }
    }

    /// Place a fee-paying activation.
    ///
    /// A missing referrer at a tier above the first defaults to the referrer
    /// the participant joined the program with.
    pub async fn place(
        &self,
        participant: ParticipantId,
        referrer: Option<ParticipantId>,
        program: Program,
        tier: Tier,
    ) -> Result<PlacementRecord> {
        let context = Context::new(participant, program, tier);
        let referrer = match referrer {
            Some(r) => Some(r),
            None if tier > Tier::FIRST => {
                self.shared
                    .program_referrer(context, participant, program)
                    .await?
            }
            None => None,
        };
        self.check_activation(context, referrer).await?;
        self.commit(PlacementRequest::fee(participant, referrer, program, tier))
            .await
    }

    async fn check_activation(&self, context: Context, referrer: Option<ParticipantId>) -> Result<()> {
        let Context {
            participant,
            program,
            tier,
        } = context;
        if !self.shared.config.has_tier(program, tier) {
            return Err(Error::UnknownTier { context });
        }

        let store = &*self.shared.store;
        let existing = self
            .shared
            .call(context, || store.records_for(participant, program, tier))
            .await?;
        if let Some(record) = existing.first() {
            return Err(Error::AlreadyPlaced {
                context,
                existing: record.id,
            });
        }

        if let Some(previous) = tier.previous() {
            if !self.shared.holds(context, participant, program, previous).await? {
                return Err(Error::PreviousTierMissing { context });
            }
        }

        if !program.requires_referrer() {
            return Ok(());
        }
        match referrer {
            None => {
                let key = RootKey {
                    program,
                    tier,
                    phase: Phase::One,
                };
                if self.shared.call(context, || store.root(key)).await?.is_some() {
                    return Err(Error::RootAlreadyClaimed { context });
                }
            }
            Some(referrer) if referrer == participant => {
                return Err(Error::SelfReferral { context });
            }
            Some(referrer) => {
                if !self.shared.holds(context, referrer, program, tier).await? {
                    let joined = self
                        .shared
                        .holds(context, referrer, program, Tier::FIRST)
                        .await?;
                    return Err(if joined {
                        Error::ReferrerNotEligible { context, referrer }
                    } else {
                        Error::NoReferrer { context, referrer }
                    });
                }
            }
        }
        Ok(())
    }

    /// Resolve, scan and insert, rescanning after lost races.
    pub(crate) async fn commit(&self, request: PlacementRequest) -> Result<PlacementRecord> {
        let context = request.context();
        let store = &*self.shared.store;
        let mut attempt = 0;
        loop {
            let anchor = self.resolve_anchor(&request).await?;
            let outcome = {
                let _scope = self.shared.locks.acquire(request.scope(anchor)).await;
                match self.plan(&request, anchor).await {
                    Ok(draft) if draft.is_root() => {
                        self.shared
                            .call(context, || store.claim_root(draft.clone()))
                            .await
                    }
                    Ok(draft) => {
                        self.shared
                            .call(context, || store.insert_placement(draft.clone()))
                            .await
                    }
                    Err(e) => Err(e),
                }
            };

            match outcome {
                Ok(record) => {
                    debug!(
                        "{}: placed in {} under {:?} at {:?}, depth {}, spillover {}",
                        context,
                        record.structure,
                        record.placement_parent,
                        record.position,
                        record.depth,
                        record.is_spillover
                    );
                    return Ok(record);
                }
                Err(Error::Store {
                    source: canopy_store::Error::Conflict(Conflict::RecordExists(_)),
                    ..
                }) => {
                    let existing = self
                        .shared
                        .latest_record(context, request.participant, request.program, request.tier)
                        .await?;
                    return match existing {
                        Some(record) => Err(Error::AlreadyPlaced {
                            context,
                            existing: record.id,
                        }),
                        None => Err(Error::PlacementFailed {
                            context,
                            attempts: attempt + 1,
                        }),
                    };
                }
                Err(e) if e.is_conflict() => {
                    if anchor == Anchor::Root && request.mode == AnchorMode::Referrer {
                        return Err(Error::RootAlreadyClaimed { context });
                    }
                    attempt += 1;
                    if attempt > self.shared.config.max_conflict_retries {
                        return Err(Error::PlacementFailed {
                            context,
                            attempts: attempt,
                        });
                    }
                    debug!("{}: lost a placement race ({}), rescanning", context, e);
                    self.shared.conflict_backoff(attempt - 1).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub(crate) async fn resolve_anchor(&self, request: &PlacementRequest) -> Result<Anchor> {
        match request.mode {
            AnchorMode::Fixed(anchor) => Ok(anchor),
            AnchorMode::Referrer => Ok(match request.referrer {
                Some(referrer) => Anchor::on(request.program, referrer),
                None => Anchor::Root,
            }),
            AnchorMode::Sweepover { preferred } => self.sweep_anchor(request, preferred).await,
        }
    }

    async fn sweep_anchor(
        &self,
        request: &PlacementRequest,
        preferred: Option<ParticipantId>,
    ) -> Result<Anchor> {
        let context = request.context();
        let PlacementRequest {
            participant,
            program,
            tier,
            ..
        } = *request;

        if let Some(preferred) = preferred.filter(|p| *p != participant) {
            if self.shared.holds(context, preferred, program, tier).await? {
                return Ok(Anchor::on(program, preferred));
            }
        }

        let account = match self.sweepover.resolve(participant, program, tier).await? {
            Recipient::Ancestor(ancestor) => return Ok(Anchor::on(program, ancestor)),
            Recipient::Fallback { account } => account,
        };
        if let Some(account) = account.filter(|a| *a != participant) {
            if self.shared.holds(context, account, program, tier).await? {
                return Ok(Anchor::on(program, account));
            }
        }

        let store = &*self.shared.store;
        let key = request.root_key();
        match self.shared.call(context, || store.root(key)).await? {
            Some(root) if root.participant != participant => Ok(Anchor::on(program, root.participant)),
            _ => Ok(Anchor::Root),
        }
    }

    /// Scan for a slot and build the draft; nothing is written.
    pub(crate) async fn plan(&self, request: &PlacementRequest, anchor: Anchor) -> Result<PlacementDraft> {
        let context = request.context();
        let store = &*self.shared.store;
        let PlacementRequest {
            participant,
            program,
            tier,
            phase,
            ..
        } = *request;

        match anchor {
            Anchor::Root => {
                let structure = match program {
                    Program::Binary => StructureId::Binary { tier },
                    Program::Matrix => {
                        let instance = self
                            .shared
                            .call(context, || store.current_instance(participant, tier))
                            .await?;
                        StructureId::Matrix { instance }
                    }
                    Program::Global => StructureId::Global { tier, phase },
                };
                Ok(draft(request, structure, None))
            }
            Anchor::Subtree(node) => {
                let structure = StructureId::Binary { tier };
                let depth = self
                    .shared
                    .latest_record(context, node, program, tier)
                    .await?
                    .map(|r| r.depth)
                    .ok_or_else(|| canopy_store::Error::NotFound(format!("{} is not in {}", node, structure)))
                    .in_context(context)?;
                let slot = self.open_slot(context, structure, node, depth).await?;
                Ok(draft(request, structure, Some(slot)))
            }
            Anchor::Instance(owner) => {
                let instance = self
                    .shared
                    .call(context, || store.current_instance(owner, tier))
                    .await?;
                let structure = StructureId::Matrix { instance };
                let slot = self.open_slot(context, structure, owner, 0).await?;
                Ok(draft(request, structure, Some(slot)))
            }
            Anchor::Serial => {
                let structure = StructureId::Global { tier, phase };
                let key = structure.root_key();
                match self.shared.call(context, || store.root(key)).await? {
                    None => Ok(draft(request, structure, None)),
                    Some(root) => {
                        let slot = self.open_slot(context, structure, root.participant, 0).await?;
                        Ok(draft(request, structure, Some(slot)))
                    }
                }
            }
        }
    }

    /// Level-order scan from `start`; the first node with a free position wins.
    ///
    /// Slots are indexed in level order below `start`, so the level of an
    /// index is its depth below the anchor.
    async fn open_slot(
        &self,
        context: Context,
        structure: StructureId,
        start: ParticipantId,
        start_depth: u32,
    ) -> Result<OpenSlot> {
        let store = &*self.shared.store;
        let shape = structure.shape();
        let branching = u64::from(shape.branching());
        let mut queue = VecDeque::from([(start, SlotIndex::ROOT)]);
        let mut visited = HashSet::new();

        while let Some((node, index)) = queue.pop_front() {
            if !visited.insert(node) {
                return Err(Error::CycleDetected { context, at: node });
            }
            let open = self
                .shared
                .call(context, || store.find_open_children(structure, node))
                .await?;
            if let Some(position) = open.first().copied() {
                let slot = index.child(branching, position);
                return Ok(OpenSlot {
                    parent: node,
                    position,
                    depth: start_depth + slot.level(branching),
                    slot,
                });
            }

            let depth = start_depth + index.level(branching);
            if shape.accepts_children_at(depth + 1) {
                let children = self
                    .shared
                    .call(context, || store.children(structure, node))
                    .await?;
                queue.extend(children.iter().filter_map(|c| {
                    c.position
                        .map(|position| (c.participant, index.child(branching, position)))
                }));
            }
        }

        // Only bounded shapes run out of slots.
        match structure.instance() {
            Some(instance) => Err(Error::InstanceFull { context, instance }),
            None => Err(Error::Store {
                context,
                source: canopy_store::Error::Invariant(format!("{} has no open slot", structure)),
            }),
        }
    }
}

fn draft(request: &PlacementRequest, structure: StructureId, slot: Option<OpenSlot>) -> PlacementDraft {
    let (parent, position, depth) = match slot {
        Some(slot) => (Some(slot.parent), Some(slot.position), slot.depth),
        None => (None, None, 0),
    };
    let is_spillover = match (request.program, parent, request.referrer) {
        (Program::Global, _, _) => false,
        (_, Some(parent), Some(referrer)) => parent != referrer,
        _ => false,
    };
    let slot_role = match (request.program, slot) {
        (Program::Matrix, Some(slot)) => SlotRole::at_matrix_slot(slot.slot),
        _ => SlotRole::Plain,
    };
    PlacementDraft {
        participant: request.participant,
        structure,
        cycle: request.cycle,
        referrer: request.referrer,
        placement_parent: parent,
        position,
        depth,
        is_spillover,
        slot_role,
        funded_by: request.funded_by,
    }
}
