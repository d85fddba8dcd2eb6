//! Autonomous trade execution under an agent's sub-delegation.
//!
//! One attempt runs through
//! `Validate → LoadDelegationChain → SelectCaveatGroup → BuildExecutions →
//! Redeem → InterpretReceipt → UpdateLedger`. Validation is local and never
//! touches the network. Failures before submission are retried under the
//! [`RetryPolicy`](crate::retry::RetryPolicy); nothing is resent after
//! submission. When the outcome of a submitted redemption cannot be read,
//! the sub-delegation's on-chain call count decides whether it landed.
//!
//! The ledgers are not locked. Callers run at most one attempt per agent at
//! a time.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::agent::{AgentState, TradeRecord};
use crate::cache::QuoteCache;
use crate::delegation::{DelegationChain, SelectionContext};
use crate::error::{Error, Result};
use crate::execution::{self, Execution};
use crate::funding::{Funding, InclusionOutcome, OperationRequest, UserOperationBuilder};
use crate::retry::RetryExecutor;
use crate::revocation::CallCountReader;
use crate::rpc::{self, ChainReader};
use crate::signer::SignatureBroker;
use crate::store::DelegationStore;
use crate::userop::UserOperation;

// ============================================================================
// Intents
// ============================================================================

/// How much to approve when an allowance is short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalAmount {
    /// Exactly the trade amount.
    #[default]
    Exact,
    /// `type(uint256).max`
    Unlimited,
}

/// A trade with its calldata already built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeCall {
    pub execution: Execution,
    pub token_in: Address,
    pub amount_in: U256,
    /// Contract that pulls `token_in`. Must be whitelisted.
    pub spender: Option<Address>,
    pub approval: ApprovalAmount,
}

/// What the agent wants to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TradeIntent {
    /// A cached quote, by id.
    Quote {
        quote_id: String,
        approval: ApprovalAmount,
    },
    Direct(TradeCall),
}

impl TradeIntent {
    pub fn quote(quote_id: impl Into<String>) -> Self {
        Self::Quote {
            quote_id: quote_id.into(),
            approval: ApprovalAmount::Exact,
        }
    }
}

struct ResolvedTrade {
    call: TradeCall,
    quote_id: Option<String>,
}

// ============================================================================
// Reports
// ============================================================================

/// Stage an attempt reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedemptionStage {
    Validate,
    LoadDelegationChain,
    SelectCaveatGroup,
    BuildExecutions,
    Redeem,
    InterpretReceipt,
    UpdateLedger,
}

impl RedemptionStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::LoadDelegationChain => "load_delegation_chain",
            Self::SelectCaveatGroup => "select_caveat_group",
            Self::BuildExecutions => "build_executions",
            Self::Redeem => "redeem",
            Self::InterpretReceipt => "interpret_receipt",
            Self::UpdateLedger => "update_ledger",
        }
    }
}

impl fmt::Display for RedemptionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How success was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Receipt,
    /// The receipt was unreadable but the call count advanced.
    CallCount,
}

#[derive(Debug, Clone)]
pub enum RedemptionOutcome {
    Executed {
        tx_hash: Option<B256>,
        confirmation: Confirmation,
    },
    /// Refused before any network call.
    Rejected { error: Error },
    /// Included and reverted. Fatal for the attempt, not the agent.
    Reverted { tx_hash: Option<B256>, reason: String },
    /// Submitted, but neither receipt nor call count shows it landed.
    Indeterminate { reason: String },
    Failed { error: Error },
}

impl RedemptionOutcome {
    pub fn is_executed(&self) -> bool {
        matches!(self, Self::Executed { .. })
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Executed { .. } => "executed",
            Self::Rejected { .. } => "rejected",
            Self::Reverted { .. } => "reverted",
            Self::Indeterminate { .. } => "indeterminate",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Result of one execution attempt.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub agent_id: String,
    pub stage: RedemptionStage,
    pub outcome: RedemptionOutcome,
    /// The approval leg, when one was needed.
    pub approval: Option<RedemptionOutcome>,
}

// ============================================================================
// Submission seam
// ============================================================================

/// A redemption ready to send.
#[derive(Debug, Clone)]
pub struct PreparedRedemption {
    pub account: Address,
    pub redeem_call: Bytes,
    pub user_operation: Option<UserOperation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmissionHandle {
    pub id: B256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedemptionReceipt {
    pub success: bool,
    pub tx_hash: Option<B256>,
    pub revert_reason: Option<String>,
}

/// Delivers a `redeemDelegations` call from the delegate account.
#[async_trait]
pub trait RedemptionSubmitter: Send + Sync {
    /// Everything up to submission. Safe to retry.
    async fn prepare(&self, account: Address, redeem_call: Bytes) -> Result<PreparedRedemption>;

    /// Submit. Never retried.
    async fn send(&self, prepared: &PreparedRedemption) -> Result<SubmissionHandle>;

    /// `None` if the outcome could not be observed in time.
    async fn wait(&self, handle: &SubmissionHandle) -> Result<Option<RedemptionReceipt>>;
}

/// Sends redemptions as user operations of the delegate account, which
/// calls `DelegationManager.redeemDelegations` through `execute`.
#[derive(Clone)]
pub struct BundlerRedemptionSubmitter {
    builder: UserOperationBuilder,
    broker: Arc<dyn SignatureBroker>,
    delegation_manager: Address,
    funding: Funding,
}

impl BundlerRedemptionSubmitter {
    pub fn new(
        builder: UserOperationBuilder,
        broker: Arc<dyn SignatureBroker>,
        delegation_manager: Address,
        funding: Funding,
    ) -> Self {
        Self {
            builder,
            broker,
            delegation_manager,
            funding,
        }
    }
}

#[async_trait]
impl RedemptionSubmitter for BundlerRedemptionSubmitter {
    async fn prepare(&self, account: Address, redeem_call: Bytes) -> Result<PreparedRedemption> {
        let call_data = execution::account_execute_call(&Execution::new(
            self.delegation_manager,
            U256::ZERO,
            redeem_call.clone(),
        ));
        let prepared = self
            .builder
            .prepare(OperationRequest::call(account, call_data), self.funding)
            .await?;
        let signed = self
            .builder
            .sign(prepared, &*self.broker, "Agent trade")
            .await?;
        Ok(PreparedRedemption {
            account,
            redeem_call,
            user_operation: Some(signed.op),
        })
    }

    async fn send(&self, prepared: &PreparedRedemption) -> Result<SubmissionHandle> {
        let op = prepared.user_operation.clone().ok_or_else(|| {
            Error::Validation("redemption was not prepared as a user operation".into())
        })?;
        let id = self.builder.submit_operation(&op).await?;
        Ok(SubmissionHandle { id })
    }

    async fn wait(&self, handle: &SubmissionHandle) -> Result<Option<RedemptionReceipt>> {
        match self.builder.wait(handle.id, None).await? {
            InclusionOutcome::Included(receipt) => Ok(Some(RedemptionReceipt {
                success: receipt.success,
                tx_hash: receipt.tx_hash,
                revert_reason: receipt.reason,
            })),
            _ => Ok(None),
        }
    }
}

// ============================================================================
// Executor
// ============================================================================

/// Runs trade attempts for agents in a [`DelegationStore`].
pub struct AutonomousExecutor {
    store: Arc<DelegationStore>,
    reader: Arc<dyn ChainReader>,
    submitter: Arc<dyn RedemptionSubmitter>,
    call_counts: CallCountReader,
    quotes: QuoteCache,
    spender_whitelist: BTreeSet<Address>,
    retry: RetryExecutor,
}

impl AutonomousExecutor {
    pub fn new(
        store: Arc<DelegationStore>,
        reader: Arc<dyn ChainReader>,
        submitter: Arc<dyn RedemptionSubmitter>,
        call_counts: CallCountReader,
        quotes: QuoteCache,
        retry: RetryExecutor,
    ) -> Self {
        Self {
            store,
            reader,
            submitter,
            call_counts,
            quotes,
            spender_whitelist: BTreeSet::new(),
            retry,
        }
    }

    pub fn with_spender_whitelist(mut self, spenders: impl IntoIterator<Item = Address>) -> Self {
        self.spender_whitelist = spenders.into_iter().collect();
        self
    }

    pub fn quotes(&self) -> &QuoteCache {
        &self.quotes
    }

    /// Run one attempt for `agent_id`.
    ///
    /// Returns `Err` only when the agent cannot be loaded or its record
    /// cannot be written back. Everything else is in the report.
    pub async fn execute(&self, agent_id: &str, intent: TradeIntent) -> Result<ExecutionReport> {
        let mut agent = self
            .store
            .get_agent(agent_id)?
            .ok_or_else(|| Error::AgentNotFound(agent_id.to_string()))?;
        let now = Utc::now();

        // Validate
        let trade = match self.validate(&mut agent, &intent, now) {
            Ok(trade) => trade,
            Err(error) => {
                warn!(agent_id, error = %error, "trade rejected");
                self.store.save_agent(&agent)?;
                let outcome = RedemptionOutcome::Rejected { error };
                return Ok(report(&agent, RedemptionStage::Validate, outcome));
            }
        };

        // LoadDelegationChain
        let chain = match self.load_chain(&agent) {
            Ok(chain) => chain,
            Err(error) => {
                return self.fail(&mut agent, RedemptionStage::LoadDelegationChain, error, now);
            }
        };
        debug!(agent_id, leaf = %chain.leaf_hash(), "delegation chain loaded");

        // Approval leg
        let mut approval = None;
        if let Some(spender) = trade.call.spender {
            if trade.call.token_in != crate::NATIVE_TOKEN {
                match self.approve_if_needed(&chain, &trade.call, spender).await {
                    Ok(None) => {}
                    Ok(Some(outcome)) if outcome.is_executed() => approval = Some(outcome),
                    Ok(Some(outcome)) => {
                        let stage = RedemptionStage::Redeem;
                        return self.conclude(&mut agent, stage, outcome, None, now);
                    }
                    Err(error) => {
                        return self.fail(&mut agent, RedemptionStage::Redeem, error, now);
                    }
                }
            }
        }

        // Trade leg
        let outcome = match self
            .redeem(&chain, SelectionContext::trade(), vec![trade.call.execution.clone()])
            .await
        {
            Ok(outcome) => outcome,
            Err((stage, error)) => return self.fail(&mut agent, stage, error, now),
        };

        if let RedemptionOutcome::Executed { tx_hash, .. } = &outcome {
            // UpdateLedger
            agent.record_trade(TradeRecord {
                tx_hash: *tx_hash,
                target: trade.call.execution.target,
                token: trade.call.token_in,
                amount: trade.call.amount_in,
                quote_id: trade.quote_id.clone(),
                executed_at: now,
            });
            if let Some(id) = &trade.quote_id {
                self.quotes.invalidate(id);
            }
            info!(
                agent_id,
                executed = agent.trades.executed,
                max_allowed = agent.trades.max_allowed,
                token = %trade.call.token_in,
                amount = %trade.call.amount_in,
                "trade recorded"
            );
            self.store.save_agent(&agent)?;
            return Ok(ExecutionReport {
                agent_id: agent.agent_id.clone(),
                stage: RedemptionStage::UpdateLedger,
                outcome,
                approval,
            });
        }

        self.conclude(&mut agent, RedemptionStage::InterpretReceipt, outcome, approval, now)
    }

    fn resolve(&self, intent: &TradeIntent) -> Result<ResolvedTrade> {
        match intent {
            TradeIntent::Quote { quote_id, approval } => {
                let quote = self.quotes.resolve(quote_id)?;
                Ok(ResolvedTrade {
                    call: TradeCall {
                        execution: quote.execution.clone(),
                        token_in: quote.token_in,
                        amount_in: quote.amount_in,
                        spender: quote.spender,
                        approval: *approval,
                    },
                    quote_id: Some(quote_id.clone()),
                })
            }
            TradeIntent::Direct(call) => Ok(ResolvedTrade {
                call: call.clone(),
                quote_id: None,
            }),
        }
    }

    fn validate(
        &self,
        agent: &mut AgentState,
        intent: &TradeIntent,
        now: DateTime<Utc>,
    ) -> Result<ResolvedTrade> {
        if let Err(e) = agent.check_can_trade(now, Address::ZERO, U256::ZERO) {
            if agent.complete_if_finished(now) {
                info!(agent_id = %agent.agent_id, "agent completed");
            }
            return Err(e);
        }
        let trade = self.resolve(intent)?;
        if let Some(spender) = trade.call.spender {
            if !self.spender_whitelist.contains(&spender) {
                return Err(Error::SpenderNotWhitelisted(spender));
            }
        }
        agent.check_can_trade(now, trade.call.token_in, trade.call.amount_in)?;
        Ok(trade)
    }

    /// `[sub, root]`, cloned from the store.
    fn load_chain(&self, agent: &AgentState) -> Result<DelegationChain> {
        let sub = self
            .store
            .get_delegation(agent.delegation_hash)?
            .ok_or_else(|| Error::DelegationNotFound(agent.delegation_hash.to_string()))?;
        let root_hash = sub.signed_delegation.authority();
        let root = self
            .store
            .get_delegation(root_hash)?
            .ok_or_else(|| Error::DelegationNotFound(root_hash.to_string()))?;
        DelegationChain::new(
            vec![sub.signed_delegation, root.signed_delegation],
            agent.wallet_address,
        )
    }

    /// Redeem an approval through the approve group if the allowance is
    /// short. The ledgers are not touched for this leg.
    async fn approve_if_needed(
        &self,
        chain: &DelegationChain,
        call: &TradeCall,
        spender: Address,
    ) -> Result<Option<RedemptionOutcome>> {
        // executions run in the root delegator's account
        let owner = chain
            .links()
            .last()
            .map(|root| root.delegator())
            .ok_or_else(|| Error::ChainBroken("empty chain".into()))?;
        let reader = &*self.reader;
        let token = call.token_in;
        let allowance = self
            .retry
            .run("erc20_allowance", move |_| rpc::erc20_allowance(reader, token, owner, spender))
            .await?;
        if allowance >= call.amount_in {
            debug!(%token, %spender, %allowance, "allowance sufficient");
            return Ok(None);
        }

        let amount = match call.approval {
            ApprovalAmount::Exact => call.amount_in,
            ApprovalAmount::Unlimited => U256::MAX,
        };
        info!(%token, %spender, %amount, "approving spender");
        let outcome = self
            .redeem(
                chain,
                SelectionContext::approve(),
                vec![Execution::erc20_approve(token, spender, amount)],
            )
            .await
            .map_err(|(_, e)| e)?;
        Ok(Some(outcome))
    }

    /// SelectCaveatGroup → BuildExecutions → Redeem → InterpretReceipt.
    async fn redeem(
        &self,
        chain: &DelegationChain,
        selection: SelectionContext,
        executions: Vec<Execution>,
    ) -> std::result::Result<RedemptionOutcome, (RedemptionStage, Error)> {
        let redeem_call = execution::redeem_delegations_call(chain, &selection, &executions)
            .map_err(|e| (RedemptionStage::BuildExecutions, e))?;
        let leaf = chain.leaf_hash();
        let account = chain.submitter();

        let call_counts = &self.call_counts;
        let baseline = self
            .retry
            .run("call_count", move |_| call_counts.call_count(leaf))
            .await
            .map_err(|e| (RedemptionStage::Redeem, e))?;

        let submitter = &self.submitter;
        let prepared = self
            .retry
            .run("prepare_redemption", move |_| {
                submitter.prepare(account, redeem_call.clone())
            })
            .await
            .map_err(|e| (RedemptionStage::Redeem, e))?;

        let handle = match self.submitter.send(&prepared).await {
            Ok(handle) => handle,
            Err(e) if e.is_transient() => {
                warn!(%leaf, error = %e, "send failed after possible submission");
                return Ok(self.reconcile(leaf, baseline, e.to_string()).await);
            }
            Err(e) => return Err((RedemptionStage::Redeem, e)),
        };
        info!(
            %leaf,
            submission = %handle.id,
            selector = %selection.selector,
            "redemption submitted"
        );

        match self.submitter.wait(&handle).await {
            Ok(Some(receipt)) if receipt.success => Ok(RedemptionOutcome::Executed {
                tx_hash: receipt.tx_hash,
                confirmation: Confirmation::Receipt,
            }),
            Ok(Some(receipt)) => Ok(RedemptionOutcome::Reverted {
                tx_hash: receipt.tx_hash,
                reason: receipt
                    .revert_reason
                    .unwrap_or_else(|| "execution reverted".into()),
            }),
            Ok(None) => Ok(self
                .reconcile(leaf, baseline, "receipt not observed before deadline".into())
                .await),
            Err(e) => Ok(self.reconcile(leaf, baseline, e.to_string()).await),
        }
    }

    /// Decide a submitted redemption from the enforcer's call count.
    async fn reconcile(&self, leaf: B256, baseline: U256, reason: String) -> RedemptionOutcome {
        let call_counts = &self.call_counts;
        match self
            .retry
            .run("call_count", move |_| call_counts.call_count(leaf))
            .await
        {
            Ok(count) if count > baseline => {
                info!(%leaf, %baseline, %count, "call count advanced, redemption landed");
                RedemptionOutcome::Executed {
                    tx_hash: None,
                    confirmation: Confirmation::CallCount,
                }
            }
            Ok(count) => {
                warn!(%leaf, %count, reason = %reason, "redemption outcome unknown");
                RedemptionOutcome::Indeterminate { reason }
            }
            Err(e) => RedemptionOutcome::Indeterminate {
                reason: format!("{reason}; call count unreadable: {e}"),
            },
        }
    }

    fn fail(
        &self,
        agent: &mut AgentState,
        stage: RedemptionStage,
        error: Error,
        now: DateTime<Utc>,
    ) -> Result<ExecutionReport> {
        self.conclude(agent, stage, RedemptionOutcome::Failed { error }, None, now)
    }

    /// Record a non-success outcome and persist the agent.
    fn conclude(
        &self,
        agent: &mut AgentState,
        stage: RedemptionStage,
        outcome: RedemptionOutcome,
        approval: Option<RedemptionOutcome>,
        now: DateTime<Utc>,
    ) -> Result<ExecutionReport> {
        match &outcome {
            RedemptionOutcome::Reverted { tx_hash, reason } => {
                let error = Error::Reverted {
                    tx_hash: *tx_hash,
                    reason: reason.clone(),
                };
                agent.record_error(&error, stage.as_str(), *tx_hash, now);
            }
            RedemptionOutcome::Failed { error } | RedemptionOutcome::Rejected { error } => {
                agent.record_error(error, stage.as_str(), None, now);
            }
            RedemptionOutcome::Indeterminate { .. } | RedemptionOutcome::Executed { .. } => {}
        }
        warn!(
            agent_id = %agent.agent_id,
            stage = %stage,
            outcome = outcome.label(),
            status = %agent.status,
            "trade attempt did not execute"
        );
        self.store.save_agent(agent)?;
        Ok(ExecutionReport {
            agent_id: agent.agent_id.clone(),
            stage,
            outcome,
            approval,
        })
    }
}

fn report(
    agent: &AgentState,
    stage: RedemptionStage,
    outcome: RedemptionOutcome,
) -> ExecutionReport {
    ExecutionReport {
        agent_id: agent.agent_id.clone(),
        stage,
        outcome,
        approval: None,
    }
}
