//! Reserve accounts and the ledger journal.

use canopy_structure::{Program, Tier};
use serde::{Deserialize, Serialize};

use crate::ids::{ParticipantId, RecordId};
use crate::money::Money;

/// A reserve balance earmarked for `owner`'s activation of `tier`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReserveAccount {
    pub owner: ParticipantId,
    pub program: Program,
    pub tier: Tier,
}

impl ReserveAccount {
    pub const fn new(owner: ParticipantId, program: Program, tier: Tier) -> Self {
        Self {
            owner,
            program,
            tier,
        }
    }

    /// The account surplus is carried into after this one is consumed.
    pub const fn carry_target(&self) -> Self {
        Self {
            owner: self.owner,
            program: self.program,
            tier: self.tier.next(),
        }
    }
}

/// Balance plus the version used for compare-and-swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveSnapshot {
    pub balance: Money,
    /// 0 for an account that was never written.
    pub version: u64,
}

/// Direction of a journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Credit,
    Debit,
}

/// Why a reserve moved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum EntryReason {
    /// Share of a descendant's activation fee. `record` is the activation
    /// that paid it; an account holds at most one share per record.
    ActivationShare {
        from: ParticipantId,
        tier: Tier,
        record: RecordId,
    },
    /// Consumed to fund a promotion.
    Promotion { to_tier: Tier },
    /// Surplus carried from the previous tier's account.
    Carry { from_tier: Tier },
    /// Caller-initiated adjustment.
    Manual,
}

/// One journal line; the journal is append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub account: ReserveAccount,
    pub kind: EntryKind,
    pub amount: Money,
    pub reason: EntryReason,
}

/// A compare-and-swap reserve write with its journal entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveWrite {
    pub account: ReserveAccount,
    pub expected_version: u64,
    pub balance: Money,
    pub entry: LedgerEntry,
}
