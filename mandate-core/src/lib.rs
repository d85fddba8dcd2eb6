//! # Mandate Core
//!
//! Scoped, caveat-bounded EVM delegations for trading agents.
//!
//! A user signs an EIP-712 delegation that lets an agent account act on their
//! behalf, bounded by on-chain caveat enforcers: an expiry window, a call
//! limit, a per-call value cap, allowed targets and methods, byte-exact
//! calldata pins, and an optional revocation nonce. Agents re-delegate a
//! narrower slice to sub-agents and redeem the resulting chain through the
//! delegation manager, usually inside an ERC-4337 user operation.
//!
//! ## Key Concepts
//!
//! - **Delegation**: `(delegate, delegator, authority, caveats, salt)` plus a
//!   signature. `authority` is the parent's hash, or all-ones for a root.
//! - **Caveat**: an enforcer address and the terms it checks.
//! - **Selection**: the unsigned choice between pre-authorized caveat groups
//!   ("trade" or "approve"), attached only at redemption.
//! - **Agent**: a sub-account with local trade and budget ledgers.
//!
//! ## Example
//!
//! ```rust,ignore
//! use mandate::{CaveatBuilder, DelegationFactory, PermissionScope, PersistentRequest};
//!
//! let caveats = CaveatBuilder::new(config.enforcers);
//! let factory = DelegationFactory::new(config.domain(), caveats, config.policy);
//! let draft = factory
//!     .root(&tracker, user, agent, PersistentRequest {
//!         expiry_days: 7,
//!         value_cap_per_call: one_ether,
//!         call_limit: 100,
//!         scope,
//!         revocable: true,
//!     }, Utc::now())
//!     .await?;
//! let stored = mandate::signer::sign_draft(&broker, factory.domain(), draft).await?;
//! store.save_delegation(&stored)?;
//! ```

pub mod abi;
pub mod agent;
pub mod bundler;
pub mod cache;
pub mod caveats;
pub mod config;
pub mod delegation;
pub mod domain;
pub mod error;
pub mod execution;
pub mod executor;
pub mod funding;
pub mod manager;
pub mod poll;
pub mod retry;
pub mod revocation;
pub mod rpc;
pub mod signer;
pub mod store;
pub mod userop;

use alloy_primitives::Address;

pub use agent::{AgentArchetype, AgentState, AgentStatus};
pub use cache::{Quote, QuoteCache};
pub use caveats::{
    Caveat, CaveatBuilder, EnforcerAddresses, GroupSelector, PermissionScope, ScopeGroup,
    TemporalProfile,
};
pub use config::{ConfigError, EngineConfig};
pub use delegation::{
    Delegation, DelegationChain, DelegationDomain, DelegationFactory, DelegationKind,
    DelegationPolicy, PersistentRequest, SelectionContext, SignedDelegation,
};
pub use domain::ROOT_AUTHORITY;
pub use error::{Error, ErrorKind, Result};
pub use execution::{Execution, ExecutionMode};
pub use executor::{AutonomousExecutor, ExecutionReport, RedemptionOutcome, TradeIntent};
pub use funding::{Funding, UserOperationBuilder};
pub use manager::{AgentManager, SpawnRequest};
pub use poll::{PollOutcome, Poller};
pub use retry::{RetryExecutor, RetryPolicy};
pub use revocation::NonceRevocationTracker;
pub use signer::{SignatureBroker, SignatureError};
pub use store::{DelegationStore, StoredDelegation};
pub use userop::{GasFields, GasFloors, UserOperation};

/// Sentinel address for the chain's native asset in budget ledgers and
/// quotes.
pub const NATIVE_TOKEN: Address = Address::new([0xee; 20]);
