//! Spawning, revoking and listing agents.

use std::collections::BTreeMap;
use std::sync::Arc;

use alloy_primitives::{Address, U256};
use chrono::Utc;
use tracing::info;

use crate::agent::{AgentArchetype, AgentState, AgentStatus, BudgetLedger, TradeLedger};
use crate::delegation::{DelegationFactory, PersistentRequest};
use crate::error::{Error, Result};
use crate::execution::Execution;
use crate::revocation::NonceRevocationTracker;
use crate::signer::{self, SignatureBroker};
use crate::store::DelegationStore;

/// Parameters for a new sub-agent.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub wallet_id: String,
    /// The sub-agent's smart account. Becomes the sub-delegation's delegate.
    pub wallet_address: Address,
    /// The user account that signed the root delegation.
    pub user: Address,
    /// The primary agent account the root delegation was granted to.
    pub primary: Address,
    pub archetype: AgentArchetype,
    /// Per-token spend allowance of the local budget ledger.
    pub budget: BTreeMap<Address, U256>,
    pub max_trades: u64,
    /// On-chain call limit. Approvals count against it too.
    pub call_limit: u64,
    pub expiry_days: u32,
    pub value_cap_per_call: U256,
    pub revocable: bool,
}

/// Agent lifecycle over a [`DelegationStore`].
pub struct AgentManager {
    factory: DelegationFactory,
    tracker: NonceRevocationTracker,
    store: Arc<DelegationStore>,
    broker: Arc<dyn SignatureBroker>,
    venues: BTreeMap<AgentArchetype, Vec<Address>>,
}

impl AgentManager {
    pub fn new(
        factory: DelegationFactory,
        tracker: NonceRevocationTracker,
        store: Arc<DelegationStore>,
        broker: Arc<dyn SignatureBroker>,
        venues: BTreeMap<AgentArchetype, Vec<Address>>,
    ) -> Self {
        Self {
            factory,
            tracker,
            store,
            broker,
            venues,
        }
    }

    /// Sign a sub-delegation under the stored root and create the agent.
    pub async fn spawn(&self, request: SpawnRequest) -> Result<AgentState> {
        let now = Utc::now();
        let root = self
            .store
            .root_delegation(request.user, request.primary, now)?
            .ok_or_else(|| {
                Error::DelegationNotFound(format!(
                    "no active root delegation from {} to {}",
                    request.user, request.primary
                ))
            })?;

        let venues = self
            .venues
            .get(&request.archetype)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let tokens: Vec<Address> = request.budget.keys().copied().collect();
        let scope = request.archetype.scope(venues, &tokens)?;

        let draft = self
            .factory
            .sub_delegation(
                &self.tracker,
                &root.signed_delegation,
                request.wallet_address,
                PersistentRequest {
                    expiry_days: request.expiry_days,
                    value_cap_per_call: request.value_cap_per_call,
                    call_limit: request.call_limit,
                    scope,
                    revocable: request.revocable,
                },
                now,
            )
            .await?;
        let stored = signer::sign_draft(&*self.broker, self.factory.domain(), draft).await?;
        self.store.save_delegation(&stored)?;

        let agent = AgentState {
            agent_id: AgentState::new_id(),
            wallet_id: request.wallet_id,
            wallet_address: request.wallet_address,
            archetype: request.archetype,
            status: AgentStatus::Running,
            trades: TradeLedger {
                executed: 0,
                max_allowed: request.max_trades,
                history: Vec::new(),
            },
            budget: BudgetLedger {
                allocated_per_token: request.budget,
                spent_per_token: BTreeMap::new(),
            },
            expires_at: stored.expires_at,
            delegation_hash: stored.delegation_hash,
            errors: Vec::new(),
            created_at: stored.created_at,
        };
        self.store.save_agent(&agent)?;
        info!(
            agent_id = %agent.agent_id,
            archetype = %agent.archetype,
            delegation = %agent.delegation_hash,
            max_trades = agent.trades.max_allowed,
            "agent spawned"
        );
        Ok(agent)
    }

    /// Mark the agent revoked and forget its sub-delegation locally.
    ///
    /// The sub-delegation stays redeemable on chain until it expires or
    /// the delegator's nonce is bumped (see [`Self::revocation_execution`]).
    pub fn revoke(&self, agent_id: &str) -> Result<AgentState> {
        self.store.revoke_agent(agent_id)
    }

    pub fn list(&self) -> Result<Vec<AgentState>> {
        self.store.list_agents()
    }

    pub fn get(&self, agent_id: &str) -> Result<AgentState> {
        self.store
            .get_agent(agent_id)?
            .ok_or_else(|| Error::AgentNotFound(agent_id.to_string()))
    }

    /// The call that invalidates every nonce-bound delegation of the
    /// delegator at once.
    pub fn revocation_execution(&self) -> Execution {
        self.tracker.increment_nonce_execution()
    }
}
