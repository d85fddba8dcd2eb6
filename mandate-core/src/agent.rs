//! Agents and their ledgers.
//!
//! An agent is a sub-account acting under a sub-delegation of the user's
//! root delegation. Its [`AgentState`] carries the local trade and budget
//! ledgers the orchestrator checks before every redemption. These ledgers
//! are advisory; the on-chain enforcers are authoritative.

use std::collections::BTreeMap;
use std::fmt;

use alloy_primitives::{Address, Selector, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::caveats::{GroupSelector, PermissionScope, ScopeGroup};
use crate::error::{Error, ErrorKind, Result};

/// Position-manager entry points a liquidity provider may call:
/// `mint`, `increaseLiquidity`, `decreaseLiquidity` and `collect`.
pub const LIQUIDITY_SELECTORS: [Selector; 4] = [
    Selector::new([0x88, 0x31, 0x64, 0x56]),
    Selector::new([0x21, 0x9f, 0x5d, 0x17]),
    Selector::new([0x0c, 0x49, 0xcc, 0xbe]),
    Selector::new([0xfc, 0x6f, 0x78, 0x65]),
];

/// Prefix of every agent id.
pub const AGENT_ID_PREFIX: &str = "agt_";

/// Lifecycle of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Revoked,
}

impl AgentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AgentStatus::Completed | AgentStatus::Failed | AgentStatus::Revoked
        )
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentStatus::Pending => "pending",
            AgentStatus::Running => "running",
            AgentStatus::Completed => "completed",
            AgentStatus::Failed => "failed",
            AgentStatus::Revoked => "revoked",
        };
        f.pad(s)
    }
}

/// What kind of work an agent does. Decides the scope of its
/// sub-delegation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AgentArchetype {
    /// Swaps on any configured venue.
    Trader,
    /// Periodic buys through aggregator venues.
    Accumulator,
    /// Adds and removes liquidity on position managers.
    LiquidityProvider,
}

impl AgentArchetype {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentArchetype::Trader => "trader",
            AgentArchetype::Accumulator => "accumulator",
            AgentArchetype::LiquidityProvider => "liquidityProvider",
        }
    }

    /// Sub-delegation scope: a trade group over the archetype's venues and
    /// an approve group over the budgeted tokens.
    ///
    /// Liquidity providers are pinned to [`LIQUIDITY_SELECTORS`]. Traders and
    /// accumulators keep every method on their venues open, since aggregator
    /// routes arrive with quote-specific selectors.
    pub fn scope(self, venues: &[Address], tokens: &[Address]) -> Result<PermissionScope> {
        if venues.is_empty() {
            return Err(Error::ConfigurationError(format!(
                "no venues configured for archetype '{}'",
                self.as_str()
            )));
        }
        let trade = match self {
            AgentArchetype::LiquidityProvider => {
                ScopeGroup::new(GroupSelector::Trade, venues.to_vec()).methods(LIQUIDITY_SELECTORS)
            }
            AgentArchetype::Trader | AgentArchetype::Accumulator => {
                ScopeGroup::new(GroupSelector::Trade, venues.to_vec())
            }
        };
        let erc20: Vec<Address> = tokens
            .iter()
            .copied()
            .filter(|t| *t != crate::NATIVE_TOKEN)
            .collect();
        let scope = PermissionScope::single(trade);
        Ok(if erc20.is_empty() {
            scope
        } else {
            scope.with_group(ScopeGroup::erc20_approvals(erc20))
        })
    }
}

impl fmt::Display for AgentArchetype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// One confirmed trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRecord {
    #[serde(default)]
    pub tx_hash: Option<B256>,
    pub target: Address,
    pub token: Address,
    pub amount: U256,
    #[serde(default)]
    pub quote_id: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub executed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeLedger {
    pub executed: u64,
    pub max_allowed: u64,
    #[serde(default)]
    pub history: Vec<TradeRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetLedger {
    pub allocated_per_token: BTreeMap<Address, U256>,
    #[serde(default)]
    pub spent_per_token: BTreeMap<Address, U256>,
}

impl BudgetLedger {
    pub fn remaining(&self, token: Address) -> U256 {
        let allocated = self.allocated_per_token.get(&token).copied().unwrap_or_default();
        let spent = self.spent_per_token.get(&token).copied().unwrap_or_default();
        allocated.saturating_sub(spent)
    }
}

/// A failed attempt, kept for the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentErrorRecord {
    pub name: String,
    pub message: String,
    pub stage: String,
    /// `false` when only this attempt failed and the agent keeps running.
    pub fatal_for_agent: bool,
    #[serde(default)]
    pub tx_hash: Option<B256>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub at: DateTime<Utc>,
}

/// Persisted state of one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentState {
    pub agent_id: String,
    pub wallet_id: String,
    pub wallet_address: Address,
    pub archetype: AgentArchetype,
    pub status: AgentStatus,
    pub trades: TradeLedger,
    pub budget: BudgetLedger,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
    /// Hash of the agent's sub-delegation.
    pub delegation_hash: B256,
    #[serde(default)]
    pub errors: Vec<AgentErrorRecord>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl AgentState {
    /// New agent id (`agt_` + UUIDv7).
    pub fn new_id() -> String {
        format!("{}{}", AGENT_ID_PREFIX, Uuid::now_v7().simple())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_exhausted(&self) -> bool {
        self.trades.executed >= self.trades.max_allowed
    }

    /// Local pre-flight check. Never touches the network.
    pub fn check_can_trade(&self, now: DateTime<Utc>, token: Address, amount: U256) -> Result<()> {
        if self.status != AgentStatus::Running {
            return Err(Error::AgentNotRunning {
                status: self.status.to_string(),
            });
        }
        if self.is_expired(now) {
            return Err(Error::DelegationExpired(self.expires_at));
        }
        if self.is_exhausted() {
            return Err(Error::MaxTradesReached {
                executed: self.trades.executed,
                max_allowed: self.trades.max_allowed,
            });
        }
        if !amount.is_zero() {
            let remaining = self.budget.remaining(token);
            if amount > remaining {
                return Err(Error::InsufficientBudget {
                    token,
                    requested: amount,
                    remaining,
                });
            }
        }
        Ok(())
    }

    /// Move a running agent to `completed` if it has expired or used all
    /// trades. Returns whether the status changed.
    pub fn complete_if_finished(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == AgentStatus::Running && (self.is_expired(now) || self.is_exhausted()) {
            self.status = AgentStatus::Completed;
            return true;
        }
        false
    }

    /// Apply a confirmed trade to the ledgers.
    pub fn record_trade(&mut self, record: TradeRecord) {
        self.trades.executed += 1;
        if !record.amount.is_zero() {
            let spent = self.budget.spent_per_token.entry(record.token).or_default();
            *spent = spent.saturating_add(record.amount);
        }
        self.trades.history.push(record);
        if self.is_exhausted() && self.status == AgentStatus::Running {
            self.status = AgentStatus::Completed;
        }
    }

    /// Append to the error log. Fatal errors move the agent to `failed`.
    pub fn record_error(
        &mut self,
        error: &Error,
        stage: &str,
        tx_hash: Option<B256>,
        at: DateTime<Utc>,
    ) -> &AgentErrorRecord {
        let fatal_for_agent = is_fatal_for_agent(error);
        if fatal_for_agent && !self.status.is_terminal() {
            self.status = AgentStatus::Failed;
        }
        self.errors.push(AgentErrorRecord {
            name: error.name().to_string(),
            message: error.to_string(),
            stage: stage.to_string(),
            fatal_for_agent,
            tx_hash,
            at,
        });
        &self.errors[self.errors.len() - 1]
    }

    pub fn revoke(&mut self) {
        self.status = AgentStatus::Revoked;
    }
}

/// Only broken configuration ends an agent. Reverts, network trouble and
/// per-attempt validation failures leave it running.
fn is_fatal_for_agent(error: &Error) -> bool {
    error.kind() == ErrorKind::Configuration
}
