//! Scenario files and their replay.
//!
//! A scenario is a JSON document listing activations in arrival order:
//!
//! ```json
//! { "activations": [ { "participant": 1, "program": "binary", "tier": 1 } ] }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use canopy_engine::{ActivationRequest, Engine, Event};
use canopy_store::{EntryKind, MemoryStore};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid scenario: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Engine(#[from] canopy_engine::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    pub activations: Vec<ActivationRequest>,
}

impl Scenario {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SimError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, SimError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// One line of replay output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Line<'a> {
    Event(&'a Event),
    Rejected(Rejection),
}

/// An activation the engine refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub request: ActivationRequest,
    pub error: String,
}

/// End-of-run totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub activations: usize,
    pub rejected: usize,
    pub events: usize,
    /// Records per "program tier", e.g. "matrix T2".
    pub records: BTreeMap<String, usize>,
    pub reserve_total: Decimal,
    /// Whether every account's journal nets to its balance.
    pub conserved: bool,
}

/// Run every activation in order, handing each output line to `emit`.
///
/// Refused activations are reported and skipped; store and configuration
/// failures end the replay.
pub async fn replay(
    engine: &Engine<MemoryStore>,
    scenario: &Scenario,
    mut emit: impl FnMut(Line<'_>),
) -> Result<Summary, SimError> {
    let mut summary = Summary::default();
    for request in &scenario.activations {
        match engine.activate(*request).await {
            Ok(outcome) => {
                summary.activations += 1;
                summary.events += outcome.events.len();
                for event in &outcome.events {
                    emit(Line::Event(event));
                }
            }
            Err(e @ (canopy_engine::Error::Store { .. } | canopy_engine::Error::Config(_))) => {
                return Err(e.into());
            }
            Err(e) => {
                warn!("activation refused: {}", e);
                summary.rejected += 1;
                emit(Line::Rejected(Rejection {
                    kind: "rejected",
                    request: *request,
                    error: e.to_string(),
                }));
            }
        }
    }

    let store = engine.store();
    for record in store.records().await {
        *summary
            .records
            .entry(format!("{} {}", record.program, record.tier))
            .or_default() += 1;
    }

    summary.conserved = true;
    for (account, snapshot) in store.accounts().await {
        summary.reserve_total += snapshot.balance.amount;
        let net = store
            .journal(account)
            .await
            .iter()
            .fold(Decimal::ZERO, |net, entry| match entry.kind {
                EntryKind::Credit => net + entry.amount.amount,
                EntryKind::Debit => net - entry.amount.amount,
            });
        if net != snapshot.balance.amount {
            warn!("{:?}: journal nets to {} but balance is {}", account, net, snapshot.balance);
            summary.conserved = false;
        }
    }
    Ok(summary)
}
