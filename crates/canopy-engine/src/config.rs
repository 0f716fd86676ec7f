//! Engine configuration.
//!
//! Defaults are built in; a TOML document named by `CANOPY_CONFIG` replaces
//! them and individual environment variables override single fields.

use std::path::Path;
use std::time::Duration;

use canopy_store::{Currency, Money, ParticipantId};
use canopy_structure::{Program, Tier};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Per-tier costs and reserve fractions of one program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramConfig {
    /// Activation cost of tier `i + 1`.
    pub tier_costs: Vec<Decimal>,
    /// Share of a tier's fee that flows into a reserve; empty means none.
    #[serde(default)]
    pub reserve_fractions: Vec<Decimal>,
}

impl ProgramConfig {
    /// Costs `base · factor^(T-1)` for `tiers` tiers, one fraction for all.
    pub fn geometric(base: Decimal, factor: Decimal, tiers: u8, fraction: Decimal) -> Self {
        let mut tier_costs = Vec::with_capacity(tiers as usize);
        let mut cost = base;
        for _ in 0..tiers {
            tier_costs.push(cost);
            cost = cost.checked_mul(factor).unwrap_or(Decimal::MAX);
        }
        let reserve_fractions = if fraction.is_zero() {
            Vec::new()
        } else {
            vec![fraction; tiers as usize]
        };
        Self {
            tier_costs,
            reserve_fractions,
        }
    }

    pub fn has_tier(&self, tier: Tier) -> bool {
        tier.value() >= 1 && tier.index() < self.tier_costs.len()
    }

    pub fn max_tier(&self) -> Tier {
        Tier::new(self.tier_costs.len() as u8)
    }

    pub fn cost(&self, tier: Tier) -> Option<Decimal> {
        if !self.has_tier(tier) {
            return None;
        }
        self.tier_costs.get(tier.index()).copied()
    }

    /// Reserve fraction of `tier`'s fee; zero when unset.
    pub fn fraction(&self, tier: Tier) -> Decimal {
        if !self.has_tier(tier) {
            return Decimal::ZERO;
        }
        self.reserve_fractions
            .get(tier.index())
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    fn validate(&self, program: Program) -> Result<()> {
        if self.tier_costs.is_empty() {
            return Err(Error::Config(format!("{} has no tiers", program)));
        }
        if self.tier_costs.len() > u8::MAX as usize {
            return Err(Error::Config(format!(
                "{} has {} tiers, at most {} are supported",
                program,
                self.tier_costs.len(),
                u8::MAX
            )));
        }
        let mut previous = Decimal::ZERO;
        for (i, cost) in self.tier_costs.iter().enumerate() {
            if *cost <= previous {
                return Err(Error::Config(format!(
                    "{} tier {} costs {}, costs must be positive and strictly increasing",
                    program,
                    i + 1,
                    cost
                )));
            }
            previous = *cost;
        }
        if !self.reserve_fractions.is_empty() && self.reserve_fractions.len() != self.tier_costs.len() {
            return Err(Error::Config(format!(
                "{} has {} reserve fractions for {} tiers",
                program,
                self.reserve_fractions.len(),
                self.tier_costs.len()
            )));
        }
        if let Some(bad) = self
            .reserve_fractions
            .iter()
            .find(|f| **f < Decimal::ZERO || **f > Decimal::ONE)
        {
            return Err(Error::Config(format!(
                "{} reserve fraction {} outside [0, 1]",
                program, bad
            )));
        }
        Ok(())
    }
}

/// Configuration for an [`Engine`](crate::Engine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Currency every cost and reserve is held in.
    pub currency: Currency,

    pub binary: ProgramConfig,
    pub matrix: ProgramConfig,
    pub global: ProgramConfig,

    /// How far up the parent chain the sweepover resolver walks.
    pub sweepover_max_depth: u32,

    /// Where entrants land when no ancestor holds the tier.
    /// The structure's root is used when this is unset or not eligible.
    pub fallback_account: Option<ParticipantId>,

    /// Per-call store timeout in milliseconds.
    pub store_timeout_ms: u64,

    /// Retries of a store call that timed out or was unavailable.
    pub max_transient_retries: u32,

    /// Rescans after losing a placement or reserve race.
    pub max_conflict_retries: u32,

    /// Base backoff between retries in milliseconds; doubles per attempt.
    pub retry_backoff_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            currency: Currency::USD,
            binary: ProgramConfig::geometric(Decimal::from(10), Decimal::from(2), 12, Decimal::ONE),
            matrix: ProgramConfig::geometric(Decimal::from(11), Decimal::from(3), 12, Decimal::ONE),
            global: ProgramConfig::geometric(Decimal::from(5), Decimal::from(2), 10, Decimal::ZERO),
            sweepover_max_depth: 60,
            fallback_account: None,
            store_timeout_ms: 2_000,
            max_transient_retries: 3,
            max_conflict_retries: 8,
            retry_backoff_ms: 10,
        }
    }
}

impl EngineConfig {
    /// Create config from environment variables with built-in defaults.
    ///
    /// - `CANOPY_CONFIG`: path to a TOML document
    /// - `CANOPY_CURRENCY`: currency code
    /// - `CANOPY_STORE_TIMEOUT_MS`: per-call store timeout
    /// - `CANOPY_SWEEPOVER_DEPTH`: sweepover depth cap
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("CANOPY_CONFIG") {
            Ok(path) => Self::load(path)?,
            Err(_) => Self::default(),
        };

        if let Ok(code) = std::env::var("CANOPY_CURRENCY") {
            config.currency = code
                .parse()
                .map_err(|e| Error::Config(format!("Invalid CANOPY_CURRENCY: {}", e)))?;
        }
        if let Ok(ms) = std::env::var("CANOPY_STORE_TIMEOUT_MS") {
            config.store_timeout_ms = ms
                .parse()
                .map_err(|e| Error::Config(format!("Invalid CANOPY_STORE_TIMEOUT_MS: {}", e)))?;
        }
        if let Ok(depth) = std::env::var("CANOPY_SWEEPOVER_DEPTH") {
            config.sweepover_max_depth = depth
                .parse()
                .map_err(|e| Error::Config(format!("Invalid CANOPY_SWEEPOVER_DEPTH: {}", e)))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Read and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }

    /// Parse and validate a TOML document. Missing fields keep their defaults.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for program in Program::ALL {
            self.program(program).validate(program)?;
        }
        if self.sweepover_max_depth == 0 {
            return Err(Error::Config("sweepover_max_depth must be at least 1".into()));
        }
        if self.store_timeout_ms == 0 {
            return Err(Error::Config("store_timeout_ms must be at least 1".into()));
        }
        Ok(())
    }

    pub fn program(&self, program: Program) -> &ProgramConfig {
        match program {
            Program::Binary => &self.binary,
            Program::Matrix => &self.matrix,
            Program::Global => &self.global,
        }
    }

    pub fn has_tier(&self, program: Program, tier: Tier) -> bool {
        self.program(program).has_tier(tier)
    }

    /// Activation cost of a program tier.
    pub fn cost(&self, program: Program, tier: Tier) -> Option<Money> {
        self.program(program)
            .cost(tier)
            .map(|amount| Money::new(amount, self.currency))
    }

    pub fn fraction(&self, program: Program, tier: Tier) -> Decimal {
        self.program(program).fraction(tier)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Backoff before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(16)).unwrap_or(u64::MAX);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }

    #[must_use]
    pub fn with_currency(mut self, currency: Currency) -> Self {
        self.currency = currency;
        self
    }

    #[must_use]
    pub fn with_program(mut self, program: Program, config: ProgramConfig) -> Self {
        match program {
            Program::Binary => self.binary = config,
            Program::Matrix => self.matrix = config,
            Program::Global => self.global = config,
        }
        self
    }

    #[must_use]
    pub fn with_sweepover_max_depth(mut self, depth: u32) -> Self {
        self.sweepover_max_depth = depth;
        self
    }

    #[must_use]
    pub fn with_fallback_account(mut self, account: ParticipantId) -> Self {
        self.fallback_account = Some(account);
        self
    }

    #[must_use]
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout_ms = timeout.as_millis().max(1) as u64;
        self
    }

    #[must_use]
    pub fn with_retries(mut self, transient: u32, conflict: u32) -> Self {
        self.max_transient_retries = transient;
        self.max_conflict_retries = conflict;
        self
    }

    #[must_use]
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff_ms = backoff.as_millis() as u64;
        self
    }
}
