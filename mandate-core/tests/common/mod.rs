//! In-memory doubles shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use chrono::Utc;
use mandate::abi;
use mandate::bundler::{BundlerClient, PaymasterClient, Sponsorship, UserOperationReceipt};
use mandate::executor::{
    PreparedRedemption, RedemptionReceipt, RedemptionSubmitter, SubmissionHandle,
};
use mandate::rpc::ChainReader;
use mandate::userop::{GasEstimate, GasFields, GasPrice, PaymasterFields, UserOperation};
use mandate::signer::sign_draft;
use mandate::{
    AgentArchetype, AgentManager, CaveatBuilder, DelegationDomain, DelegationFactory,
    DelegationPolicy, DelegationStore, EnforcerAddresses, Error, GroupSelector,
    NonceRevocationTracker, PermissionScope, PersistentRequest, Result, ScopeGroup,
    SignatureBroker, SignatureError, SpawnRequest, StoredDelegation,
};

pub const CHAIN_ID: u64 = 8453;

pub fn manager_address() -> Address {
    Address::repeat_byte(0xd0)
}

pub fn enforcers() -> EnforcerAddresses {
    EnforcerAddresses {
        timestamp: Address::repeat_byte(0x01),
        limited_calls: Address::repeat_byte(0x02),
        nonce: Address::repeat_byte(0x03),
        value_lte: Address::repeat_byte(0x04),
        allowed_targets: Address::repeat_byte(0x05),
        allowed_methods: Address::repeat_byte(0x06),
        allowed_calldata: Address::repeat_byte(0x07),
        logical_or: Address::repeat_byte(0x08),
    }
}

pub fn domain() -> DelegationDomain {
    DelegationDomain::new(CHAIN_ID, manager_address())
}

pub fn factory() -> DelegationFactory {
    DelegationFactory::new(
        domain(),
        CaveatBuilder::new(enforcers()),
        DelegationPolicy::default(),
    )
}

pub fn ether(n: u64) -> U256 {
    U256::from(n) * U256::from(10u64).pow(U256::from(18))
}

pub fn tracker(chain: &Arc<FakeChain>) -> NonceRevocationTracker {
    NonceRevocationTracker::new(chain.clone(), enforcers().nonce, manager_address())
}

fn selector(signature: &str) -> [u8; 4] {
    abi::selector(signature)
}

// ============================================================================
// Chain
// ============================================================================

/// Chain state answering the reads the engine makes. Counts every read.
#[derive(Default)]
pub struct FakeChain {
    reads: AtomicUsize,
    nonces: Mutex<HashMap<Address, U256>>,
    call_counts: Mutex<HashMap<B256, U256>>,
    allowances: Mutex<HashMap<(Address, Address, Address), U256>>,
    code: Mutex<HashMap<Address, Bytes>>,
    balances: Mutex<HashMap<Address, U256>>,
    failures: Mutex<VecDeque<Error>>,
}

impl FakeChain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn set_nonce(&self, delegator: Address, nonce: U256) {
        self.nonces.lock().unwrap().insert(delegator, nonce);
    }

    pub fn set_allowance(&self, token: Address, owner: Address, spender: Address, amount: U256) {
        self.allowances
            .lock()
            .unwrap()
            .insert((token, owner, spender), amount);
    }

    pub fn bump_call_count(&self, delegation_hash: B256) {
        *self
            .call_counts
            .lock()
            .unwrap()
            .entry(delegation_hash)
            .or_default() += U256::from(1);
    }

    pub fn call_count(&self, delegation_hash: B256) -> U256 {
        self.call_counts
            .lock()
            .unwrap()
            .get(&delegation_hash)
            .copied()
            .unwrap_or_default()
    }

    pub fn deploy(&self, account: Address) {
        self.code
            .lock()
            .unwrap()
            .insert(account, Bytes::from(vec![0x60, 0x80]));
    }

    pub fn set_balance(&self, account: Address, amount: U256) {
        self.balances.lock().unwrap().insert(account, amount);
    }

    /// Fail the next read with `error`.
    pub fn fail_next(&self, error: Error) {
        self.failures.lock().unwrap().push_back(error);
    }

    fn next_failure(&self) -> Option<Error> {
        self.failures.lock().unwrap().pop_front()
    }
}

fn word(value: U256) -> Bytes {
    Bytes::from(abi::word_u256(value).to_vec())
}

#[async_trait]
impl ChainReader for FakeChain {
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.next_failure() {
            return Err(e);
        }
        let (sel, args) = data.split_at(4);
        if sel == selector("currentNonce(address,address)") {
            let delegator = abi::decode_address(args, 1)?;
            let nonce = self.nonces.lock().unwrap().get(&delegator).copied();
            return Ok(word(nonce.unwrap_or_default()));
        }
        if sel == selector("callCounts(address,bytes32)") {
            let hash = B256::from(abi::decode_uint(args, 1)?.to_be_bytes::<32>());
            return Ok(word(self.call_count(hash)));
        }
        if sel == selector("allowance(address,address)") {
            let owner = abi::decode_address(args, 0)?;
            let spender = abi::decode_address(args, 1)?;
            let amount = self
                .allowances
                .lock()
                .unwrap()
                .get(&(to, owner, spender))
                .copied();
            return Ok(word(amount.unwrap_or_default()));
        }
        if sel == selector("getNonce(address,uint192)") || sel == selector("balanceOf(address)") {
            return Ok(word(U256::ZERO));
        }
        Err(Error::UnexpectedResponse {
            context: "fake chain".into(),
            detail: format!("unknown selector 0x{}", hex::encode(sel)),
        })
    }

    async fn code(&self, address: Address) -> Result<Bytes> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .code
            .lock()
            .unwrap()
            .get(&address)
            .cloned()
            .unwrap_or_default())
    }

    async fn balance(&self, address: Address) -> Result<U256> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .balances
            .lock()
            .unwrap()
            .get(&address)
            .copied()
            .unwrap_or_default())
    }
}

// ============================================================================
// Signer
// ============================================================================

/// Signs everything with a fixed 65-byte signature and remembers labels.
#[derive(Default)]
pub struct ApprovingBroker {
    pub labels: Mutex<Vec<String>>,
    pub cancel: bool,
}

impl ApprovingBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn cancelling() -> Arc<Self> {
        Arc::new(Self {
            cancel: true,
            ..Self::default()
        })
    }
}

#[async_trait]
impl SignatureBroker for ApprovingBroker {
    async fn sign(&self, digest: B256, label: &str) -> std::result::Result<Bytes, SignatureError> {
        self.labels.lock().unwrap().push(label.to_string());
        if self.cancel {
            return Err(SignatureError::Cancelled);
        }
        let mut sig = digest.to_vec();
        sig.extend_from_slice(digest.as_slice());
        sig.push(0x1b);
        Ok(Bytes::from(sig))
    }
}

// ============================================================================
// Redemption submitter
// ============================================================================

/// What one redemption attempt does.
pub struct Script {
    pub send: Result<()>,
    pub wait: Result<Option<RedemptionReceipt>>,
    /// Bump this delegation's call count on send, as the enforcer would.
    pub lands_on: Option<B256>,
}

impl Script {
    pub fn success(leaf: B256) -> Self {
        Self {
            send: Ok(()),
            wait: Ok(Some(RedemptionReceipt {
                success: true,
                tx_hash: Some(B256::repeat_byte(0x7a)),
                revert_reason: None,
            })),
            lands_on: Some(leaf),
        }
    }

    pub fn revert(reason: &str) -> Self {
        Self {
            send: Ok(()),
            wait: Ok(Some(RedemptionReceipt {
                success: false,
                tx_hash: Some(B256::repeat_byte(0x7b)),
                revert_reason: Some(reason.to_string()),
            })),
            lands_on: None,
        }
    }

    /// The send call errors, whether or not the operation reached the chain.
    pub fn send_failure(error: Error, lands_on: Option<B256>) -> Self {
        Self {
            send: Err(error),
            wait: Ok(None),
            lands_on,
        }
    }

    pub fn lost_receipt(lands_on: Option<B256>) -> Self {
        Self {
            send: Ok(()),
            wait: Err(Error::Network("connection reset".into())),
            lands_on,
        }
    }
}

pub struct ScriptedSubmitter {
    chain: Arc<FakeChain>,
    scripts: Mutex<VecDeque<Script>>,
    pub prepared: Mutex<Vec<Bytes>>,
    pub sends: AtomicUsize,
}

impl ScriptedSubmitter {
    pub fn new(chain: Arc<FakeChain>, scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            chain,
            scripts: Mutex::new(scripts.into()),
            prepared: Mutex::new(Vec::new()),
            sends: AtomicUsize::new(0),
        })
    }

    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RedemptionSubmitter for ScriptedSubmitter {
    async fn prepare(&self, account: Address, redeem_call: Bytes) -> Result<PreparedRedemption> {
        self.prepared.lock().unwrap().push(redeem_call.clone());
        Ok(PreparedRedemption {
            account,
            redeem_call,
            user_operation: None,
        })
    }

    async fn send(&self, _prepared: &PreparedRedemption) -> Result<SubmissionHandle> {
        let n = self.sends.fetch_add(1, Ordering::SeqCst);
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts.front_mut().ok_or_else(|| Error::Validation("no script left".into()))?;
        if let Some(leaf) = script.lands_on {
            self.chain.bump_call_count(leaf);
        }
        match std::mem::replace(&mut script.send, Ok(())) {
            Ok(()) => Ok(SubmissionHandle {
                id: B256::from(U256::from(n).to_be_bytes::<32>()),
            }),
            Err(e) => {
                scripts.pop_front();
                Err(e)
            }
        }
    }

    async fn wait(&self, _handle: &SubmissionHandle) -> Result<Option<RedemptionReceipt>> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::Validation("no script left".into()))?;
        script.wait
    }
}

// ============================================================================
// Bundler and paymaster
// ============================================================================

pub struct FakeBundler {
    pub sponsor_responses: Mutex<VecDeque<GasFields>>,
    pub estimate: GasEstimate,
    pub receipts: Mutex<VecDeque<Option<UserOperationReceipt>>>,
    pub sponsor_calls: AtomicUsize,
    pub estimate_calls: AtomicUsize,
    pub sent: Mutex<Vec<UserOperation>>,
    pub sponsored_gas: Mutex<Vec<GasFields>>,
}

impl FakeBundler {
    pub fn new(sponsor_responses: Vec<GasFields>, estimate: GasEstimate) -> Arc<Self> {
        Arc::new(Self {
            sponsor_responses: Mutex::new(sponsor_responses.into()),
            estimate,
            receipts: Mutex::new(VecDeque::new()),
            sponsor_calls: AtomicUsize::new(0),
            estimate_calls: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            sponsored_gas: Mutex::new(Vec::new()),
        })
    }

    pub fn push_receipt(&self, receipt: Option<UserOperationReceipt>) {
        self.receipts.lock().unwrap().push_back(receipt);
    }
}

#[async_trait]
impl BundlerClient for FakeBundler {
    async fn gas_price(&self) -> Result<GasPrice> {
        Ok(GasPrice {
            max_fee_per_gas: U256::from(2_000_000_000u64),
            max_priority_fee_per_gas: U256::from(1_000_000u64),
        })
    }

    async fn estimate_gas(&self, _op: &UserOperation) -> Result<GasEstimate> {
        self.estimate_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.estimate)
    }

    async fn send(&self, op: &UserOperation) -> Result<B256> {
        self.sent.lock().unwrap().push(op.clone());
        Ok(B256::repeat_byte(0x44))
    }

    async fn receipt(&self, user_op_hash: B256) -> Result<Option<UserOperationReceipt>> {
        Ok(self
            .receipts
            .lock()
            .unwrap()
            .pop_front()
            .flatten()
            .map(|mut r| {
                r.user_op_hash = user_op_hash;
                r
            }))
    }
}

#[async_trait]
impl PaymasterClient for FakeBundler {
    async fn sponsor(&self, op: &UserOperation) -> Result<Sponsorship> {
        self.sponsor_calls.fetch_add(1, Ordering::SeqCst);
        self.sponsored_gas.lock().unwrap().push(op.gas);
        let gas = self
            .sponsor_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();
        Ok(Sponsorship {
            paymaster: PaymasterFields {
                paymaster: Address::repeat_byte(0x99),
                verification_gas_limit: U256::from(30_000),
                post_op_gas_limit: U256::ZERO,
                data: Bytes::from(vec![0x01; 8]),
            },
            gas,
        })
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub const USER: Address = Address::new([0xa1; 20]);
pub const PRIMARY: Address = Address::new([0xa2; 20]);
pub const SUB_AGENT: Address = Address::new([0xa3; 20]);
pub const VENUE: Address = Address::new([0xb1; 20]);
pub const SPENDER: Address = Address::new([0xb2; 20]);
pub const USDC: Address = Address::new([0xc1; 20]);

pub fn trading_scope() -> PermissionScope {
    PermissionScope::single(ScopeGroup::new(GroupSelector::Trade, vec![VENUE]))
        .with_group(ScopeGroup::erc20_approvals(vec![USDC]))
}

/// Sign and store a root delegation from [`USER`] to [`PRIMARY`].
pub async fn store_root(
    store: &DelegationStore,
    chain: &Arc<FakeChain>,
    broker: &ApprovingBroker,
) -> StoredDelegation {
    let factory = factory();
    let draft = factory
        .root(
            &tracker(chain),
            USER,
            PRIMARY,
            PersistentRequest {
                expiry_days: 7,
                value_cap_per_call: ether(1),
                call_limit: 100,
                scope: trading_scope(),
                revocable: true,
            },
            Utc::now(),
        )
        .await
        .unwrap();
    let stored = sign_draft(broker, factory.domain(), draft).await.unwrap();
    store.save_delegation(&stored).unwrap();
    stored
}

pub fn agent_manager(
    store: &Arc<DelegationStore>,
    chain: &Arc<FakeChain>,
    broker: &Arc<ApprovingBroker>,
) -> AgentManager {
    let mut venues = BTreeMap::new();
    venues.insert(AgentArchetype::Trader, vec![VENUE]);
    AgentManager::new(factory(), tracker(chain), store.clone(), broker.clone(), venues)
}

pub fn spawn_request(max_trades: u64, usdc_budget: U256) -> SpawnRequest {
    let mut budget = BTreeMap::new();
    budget.insert(USDC, usdc_budget);
    SpawnRequest {
        wallet_id: "wallet-1".into(),
        wallet_address: SUB_AGENT,
        user: USER,
        primary: PRIMARY,
        archetype: AgentArchetype::Trader,
        budget,
        max_trades,
        call_limit: max_trades * 2,
        expiry_days: 3,
        value_cap_per_call: ether(1),
        revocable: false,
    }
}
