//! Building, funding and submitting user operations.
//!
//! Two paths:
//!
//! - **Self-paid**: the sender pays market gas. Fee caps and estimates come
//!   from the bundler, then floors are applied.
//! - **Sponsored**: `Draft → Sponsored → GasAdjusted? → ReSponsored? → Signed
//!   → Submitted → Included | TimedOut`. The paymaster signs over the gas
//!   limits, so whenever adjustment changes what it signed the operation is
//!   sponsored again over the final values.
//!
//! When inclusion polling times out, the intended side effect (a deployed
//! account, a funded balance) is checked on chain before giving up.

use std::fmt;
use std::sync::Arc;

use alloy_primitives::{Address, Bytes, B256, U256};
use tracing::{debug, info, warn};

use crate::bundler::{self, BundlerClient, PaymasterClient, UserOperationReceipt};
use crate::error::{Error, Result};
use crate::execution::{self, Execution};
use crate::poll::{PollOutcome, Poller};
use crate::rpc::ChainReader;
use crate::signer::SignatureBroker;
use crate::userop::{self, GasFields, GasFloors, UserOperation};

/// Placeholder signature used while estimating and sponsoring.
pub fn dummy_signature() -> Bytes {
    let mut sig = vec![0xffu8; 64];
    sig.push(0x1c);
    Bytes::from(sig)
}

/// Lifecycle stage of a user operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStage {
    Draft,
    Sponsored,
    GasAdjusted,
    ReSponsored,
    Signed,
    Submitted,
    Included,
    TimedOut,
}

impl OperationStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Sponsored => "sponsored",
            Self::GasAdjusted => "gas_adjusted",
            Self::ReSponsored => "re_sponsored",
            Self::Signed => "signed",
            Self::Submitted => "submitted",
            Self::Included => "included",
            Self::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for OperationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who pays for gas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Funding {
    SelfPaid,
    Sponsored,
}

/// What an operation is supposed to achieve, checked when inclusion
/// cannot be observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffect {
    AccountDeployed(Address),
    NativeBalanceAtLeast { account: Address, amount: U256 },
}

/// Inputs for a new operation.
#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub sender: Address,
    pub call_data: Bytes,
    pub factory: Option<(Address, Bytes)>,
}

impl OperationRequest {
    pub fn call(sender: Address, call_data: Bytes) -> Self {
        Self {
            sender,
            call_data,
            factory: None,
        }
    }
}

/// An operation plus the stages it has passed through.
#[derive(Debug, Clone)]
pub struct PreparedOperation {
    pub op: UserOperation,
    stages: Vec<OperationStage>,
}

impl PreparedOperation {
    fn new(op: UserOperation) -> Self {
        Self {
            op,
            stages: vec![OperationStage::Draft],
        }
    }

    fn advance(&mut self, stage: OperationStage) {
        debug!(sender = %self.op.sender, stage = %stage, "user operation stage");
        self.stages.push(stage);
    }

    pub fn stages(&self) -> &[OperationStage] {
        &self.stages
    }

    pub fn stage(&self) -> OperationStage {
        self.stages
            .last()
            .copied()
            .unwrap_or(OperationStage::Draft)
    }

    pub fn re_sponsorships(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| **s == OperationStage::ReSponsored)
            .count()
    }
}

/// How waiting for inclusion ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InclusionOutcome {
    Included(UserOperationReceipt),
    /// No receipt before the deadline, but the side effect is on chain.
    SideEffectObserved,
    TimedOut,
    Cancelled,
}

impl InclusionOutcome {
    pub fn stage(&self) -> OperationStage {
        match self {
            Self::Included(_) | Self::SideEffectObserved => OperationStage::Included,
            Self::TimedOut | Self::Cancelled => OperationStage::TimedOut,
        }
    }

    /// Included successfully, or observed through its side effect.
    pub fn is_confirmed(&self) -> bool {
        match self {
            Self::Included(receipt) => receipt.success,
            Self::SideEffectObserved => true,
            Self::TimedOut | Self::Cancelled => false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct GasAdjustment {
    changed: bool,
    /// A floor raised at least one field.
    floored: bool,
}

/// Prepares, signs and submits user operations.
#[derive(Clone)]
pub struct UserOperationBuilder {
    bundler: Arc<dyn BundlerClient>,
    paymaster: Option<Arc<dyn PaymasterClient>>,
    reader: Arc<dyn ChainReader>,
    entry_point: Address,
    chain_id: u64,
    floors: GasFloors,
    poller: Poller,
}

impl UserOperationBuilder {
    pub fn new(
        bundler: Arc<dyn BundlerClient>,
        reader: Arc<dyn ChainReader>,
        entry_point: Address,
        chain_id: u64,
        poller: Poller,
    ) -> Self {
        Self {
            bundler,
            paymaster: None,
            reader,
            entry_point,
            chain_id,
            floors: GasFloors::default(),
            poller,
        }
    }

    pub fn with_paymaster(mut self, paymaster: Arc<dyn PaymasterClient>) -> Self {
        self.paymaster = Some(paymaster);
        self
    }

    pub fn with_floors(mut self, floors: GasFloors) -> Self {
        self.floors = floors;
        self
    }

    pub fn floors(&self) -> &GasFloors {
        &self.floors
    }

    pub fn entry_point(&self) -> Address {
        self.entry_point
    }

    /// Draft: nonce, fee caps, zero gas, dummy signature.
    async fn draft(&self, request: OperationRequest) -> Result<PreparedOperation> {
        let nonce =
            bundler::entry_point_nonce(&*self.reader, self.entry_point, request.sender, U256::ZERO)
                .await?;
        let mut op = UserOperation::new(request.sender, nonce, request.call_data);
        if let Some((factory, data)) = request.factory {
            op = op.with_factory(factory, data);
        }
        op.fees = self.bundler.gas_price().await?;
        op.signature = dummy_signature();
        Ok(PreparedOperation::new(op))
    }

    /// Fill zero gas fields from a bundler estimate, then clamp to floors.
    async fn adjust_gas(&self, op: &mut UserOperation) -> Result<GasAdjustment> {
        let before = op.gas;
        let mut gas = op.gas;
        if gas.any_zero() {
            let estimate = self.bundler.estimate_gas(op).await?;
            gas = gas.fill_zeros(&estimate);
        }
        let (gas, floored) = userop::apply_gas_floors(gas, &self.floors);
        op.gas = gas;
        Ok(GasAdjustment {
            changed: gas != before,
            floored,
        })
    }

    /// Gas echoed by a re-sponsorship must still clear every floor.
    fn check_echoed_gas(&self, echoed: GasFields) -> Result<()> {
        let (_, below_floor) = userop::apply_gas_floors(echoed, &self.floors);
        if below_floor || echoed.any_zero() {
            return Err(Error::UnexpectedResponse {
                context: "paymaster".into(),
                detail: format!(
                    "re-sponsored gas below floors: call={} verification={} pre={}",
                    echoed.call_gas_limit,
                    echoed.verification_gas_limit,
                    echoed.pre_verification_gas
                ),
            });
        }
        Ok(())
    }

    /// Self-paid path.
    pub async fn prepare_self_paid(&self, request: OperationRequest) -> Result<PreparedOperation> {
        let mut prepared = self.draft(request).await?;
        if self.adjust_gas(&mut prepared.op).await?.changed {
            prepared.advance(OperationStage::GasAdjusted);
        }
        Ok(prepared)
    }

    /// Sponsored path up to (not including) signing.
    ///
    /// The operation is sponsored again only when a floor raised a value the
    /// sponsor signed. An estimate fill alone keeps the first sponsorship.
    pub async fn prepare_sponsored(&self, request: OperationRequest) -> Result<PreparedOperation> {
        let paymaster = self.paymaster.as_ref().ok_or_else(|| {
            Error::ConfigurationError("sponsored operation requires a paymaster".into())
        })?;

        let mut prepared = self.draft(request).await?;

        let sponsorship = paymaster.sponsor(&prepared.op).await?;
        prepared.op.paymaster = Some(sponsorship.paymaster);
        prepared.op.gas = sponsorship.gas;
        prepared.advance(OperationStage::Sponsored);

        let adjustment = self.adjust_gas(&mut prepared.op).await?;
        if adjustment.changed {
            prepared.advance(OperationStage::GasAdjusted);
        }

        if adjustment.floored {
            let adjusted = prepared.op.gas;
            let sponsorship = paymaster.sponsor(&prepared.op).await?;
            // a sponsor that echoes gas has signed those exact values
            if sponsorship.gas != GasFields::default() {
                self.check_echoed_gas(sponsorship.gas)?;
                prepared.op.gas = sponsorship.gas;
            }
            prepared.op.paymaster = Some(sponsorship.paymaster);
            info!(
                sender = %prepared.op.sender,
                call_gas_limit = %adjusted.call_gas_limit,
                verification_gas_limit = %adjusted.verification_gas_limit,
                pre_verification_gas = %adjusted.pre_verification_gas,
                "re-sponsored after gas adjustment"
            );
            prepared.advance(OperationStage::ReSponsored);
        }

        Ok(prepared)
    }

    pub async fn prepare(
        &self,
        request: OperationRequest,
        funding: Funding,
    ) -> Result<PreparedOperation> {
        match funding {
            Funding::SelfPaid => self.prepare_self_paid(request).await,
            Funding::Sponsored => self.prepare_sponsored(request).await,
        }
    }

    /// Freeze everything but the signature and sign the operation hash.
    pub async fn sign(
        &self,
        mut prepared: PreparedOperation,
        broker: &dyn SignatureBroker,
        label: &str,
    ) -> Result<PreparedOperation> {
        let hash = prepared.op.hash(self.entry_point, self.chain_id);
        prepared.op.signature = broker.sign(hash, label).await?;
        prepared.advance(OperationStage::Signed);
        Ok(prepared)
    }

    pub async fn submit(&self, prepared: &mut PreparedOperation) -> Result<B256> {
        let hash = self.submit_operation(&prepared.op).await?;
        prepared.advance(OperationStage::Submitted);
        Ok(hash)
    }

    /// Send an already signed operation.
    pub async fn submit_operation(&self, op: &UserOperation) -> Result<B256> {
        let hash = self.bundler.send(op).await?;
        info!(sender = %op.sender, user_op_hash = %hash, "user operation submitted");
        Ok(hash)
    }

    /// Poll for the receipt. On timeout, check `side_effect` if given.
    pub async fn wait(
        &self,
        user_op_hash: B256,
        side_effect: Option<&SideEffect>,
    ) -> Result<InclusionOutcome> {
        let bundler = &self.bundler;
        let outcome = self
            .poller
            .poll("eth_getUserOperationReceipt", move || bundler.receipt(user_op_hash))
            .await?;
        match outcome {
            PollOutcome::Ready(receipt) => Ok(InclusionOutcome::Included(receipt)),
            PollOutcome::Cancelled => Ok(InclusionOutcome::Cancelled),
            PollOutcome::TimedOut => {
                let observed = match side_effect {
                    Some(effect) => self.side_effect_observed(effect).await?,
                    None => false,
                };
                if observed {
                    info!(%user_op_hash, "receipt timed out but side effect is on chain");
                    Ok(InclusionOutcome::SideEffectObserved)
                } else {
                    warn!(%user_op_hash, "user operation not observed before deadline");
                    Ok(InclusionOutcome::TimedOut)
                }
            }
        }
    }

    pub async fn side_effect_observed(&self, effect: &SideEffect) -> Result<bool> {
        match effect {
            SideEffect::AccountDeployed(account) => {
                Ok(!self.reader.code(*account).await?.is_empty())
            }
            SideEffect::NativeBalanceAtLeast { account, amount } => {
                Ok(self.reader.balance(*account).await? >= *amount)
            }
        }
    }

    /// Prepare, sign, submit and wait.
    pub async fn run(
        &self,
        request: OperationRequest,
        funding: Funding,
        broker: &dyn SignatureBroker,
        label: &str,
        side_effect: Option<SideEffect>,
    ) -> Result<InclusionOutcome> {
        let prepared = self.prepare(request, funding).await?;
        let mut prepared = self.sign(prepared, broker, label).await?;
        let hash = self.submit(&mut prepared).await?;
        let outcome = self.wait(hash, side_effect.as_ref()).await?;
        if let InclusionOutcome::Included(receipt) = &outcome {
            if !receipt.success {
                return Err(Error::Reverted {
                    tx_hash: receipt.tx_hash,
                    reason: receipt
                        .reason
                        .clone()
                        .unwrap_or_else(|| "user operation failed".into()),
                });
            }
        }
        info!(user_op_hash = %hash, stage = %outcome.stage(), label, "user operation finished");
        Ok(outcome)
    }

    /// Deploy a counterfactual account through its factory.
    pub async fn deploy_account(
        &self,
        account: Address,
        factory: Address,
        factory_data: Bytes,
        funding: Funding,
        broker: &dyn SignatureBroker,
    ) -> Result<InclusionOutcome> {
        if !self.reader.code(account).await?.is_empty() {
            debug!(%account, "account already deployed");
            return Ok(InclusionOutcome::SideEffectObserved);
        }
        let request = OperationRequest {
            sender: account,
            call_data: Bytes::new(),
            factory: Some((factory, factory_data)),
        };
        self.run(
            request,
            funding,
            broker,
            "Deploy smart account",
            Some(SideEffect::AccountDeployed(account)),
        )
        .await
    }

    /// Send `amount` of native value from `account` to a session key.
    pub async fn fund_session_key(
        &self,
        account: Address,
        session_key: Address,
        amount: U256,
        funding: Funding,
        broker: &dyn SignatureBroker,
    ) -> Result<InclusionOutcome> {
        let target_balance = self.reader.balance(session_key).await?.saturating_add(amount);
        let call_data =
            execution::account_execute_call(&Execution::native_transfer(session_key, amount));
        self.run(
            OperationRequest::call(account, call_data),
            funding,
            broker,
            "Fund session key",
            Some(SideEffect::NativeBalanceAtLeast {
                account: session_key,
                amount: target_balance,
            }),
        )
        .await
    }
}
