//! Delegations: the core primitive of Mandate.
//!
//! A delegation grants `delegate` the authority of `delegator`, bounded by
//! an ordered list of caveats. Delegations chain: a sub-delegation's
//! `authority` is the hash of its parent, and the outermost delegation
//! carries [`ROOT_AUTHORITY`].
//!
//! Once signed, a delegation is frozen as a [`SignedDelegation`], which
//! only exposes read accessors. The one thing a redeemer may still choose,
//! which `LogicalOrGroup` alternative to use, lives in a separate
//! [`SelectionContext`] joined at redemption time.

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use chrono::{DateTime, SubsecRound, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::abi::{self, Token};
use crate::caveats::{
    BoundCaveat, CaveatBuilder, GroupSelector, PermissionScope, TemporalProfile,
};
use crate::domain::{delegation_typehash, domain_separator, typed_data_digest, ROOT_AUTHORITY};
use crate::error::{Error, Result};
use crate::revocation::NonceRevocationTracker;

/// Minimum expiry of a persistent delegation, in days.
pub const MIN_EXPIRY_DAYS: u32 = 1;

/// Maximum expiry of a persistent delegation, in days.
pub const MAX_EXPIRY_DAYS: u32 = 30;

/// Minimum call limit of a persistent delegation.
pub const MIN_CALL_LIMIT: u64 = 1;

/// Maximum call limit of a persistent delegation.
pub const MAX_CALL_LIMIT: u64 = 10_000;

/// The EIP-712 domain delegations are signed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegationDomain {
    pub chain_id: u64,
    pub delegation_manager: Address,
}

impl DelegationDomain {
    pub fn new(chain_id: u64, delegation_manager: Address) -> Self {
        Self {
            chain_id,
            delegation_manager,
        }
    }

    pub fn separator(&self) -> B256 {
        domain_separator(self.chain_id, self.delegation_manager)
    }
}

/// An unsigned delegation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delegation {
    pub delegate: Address,
    pub delegator: Address,
    pub authority: B256,
    pub caveats: Vec<BoundCaveat>,
    pub salt: U256,
}

impl Delegation {
    /// EIP-712 struct hash. This is the delegation's identity on-chain.
    pub fn hash(&self) -> B256 {
        let caveat_hashes: Vec<u8> = self
            .caveats
            .iter()
            .flat_map(|c| c.struct_hash().0)
            .collect();
        keccak256(abi::encode(&[
            Token::FixedBytes(delegation_typehash()),
            Token::Address(self.delegate),
            Token::Address(self.delegator),
            Token::FixedBytes(self.authority),
            Token::FixedBytes(keccak256(caveat_hashes)),
            Token::Uint(self.salt),
        ]))
    }

    /// The digest the delegator signs.
    pub fn digest(&self, domain: &DelegationDomain) -> B256 {
        typed_data_digest(domain.separator(), self.hash())
    }

    pub fn is_root(&self) -> bool {
        self.authority == ROOT_AUTHORITY
    }

    /// Freeze this delegation with the delegator's signature.
    pub fn into_signed(self, signature: Bytes) -> SignedDelegation {
        SignedDelegation {
            delegation: self,
            signature,
        }
    }
}

/// A signed, immutable delegation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedDelegation {
    delegation: Delegation,
    signature: Bytes,
}

impl SignedDelegation {
    pub fn delegate(&self) -> Address {
        self.delegation.delegate
    }

    pub fn delegator(&self) -> Address {
        self.delegation.delegator
    }

    pub fn authority(&self) -> B256 {
        self.delegation.authority
    }

    pub fn caveats(&self) -> &[BoundCaveat] {
        &self.delegation.caveats
    }

    pub fn salt(&self) -> U256 {
        self.delegation.salt
    }

    pub fn signature(&self) -> &Bytes {
        &self.signature
    }

    pub fn hash(&self) -> B256 {
        self.delegation.hash()
    }

    pub fn is_root(&self) -> bool {
        self.delegation.is_root()
    }

    /// ABI tuple as `redeemDelegations` decodes it, with unsigned args
    /// filled in from `selection`.
    fn to_token(&self, selection: &SelectionContext) -> Result<Token> {
        let caveats = self
            .delegation
            .caveats
            .iter()
            .map(|c| {
                Ok(Token::Tuple(vec![
                    Token::Address(c.enforcer),
                    Token::Bytes(c.terms()),
                    Token::Bytes(c.selection_args(selection.selector)?),
                ]))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Token::Tuple(vec![
            Token::Address(self.delegation.delegate),
            Token::Address(self.delegation.delegator),
            Token::FixedBytes(self.delegation.authority),
            Token::Array(caveats),
            Token::Uint(self.delegation.salt),
            Token::Bytes(self.signature.to_vec()),
        ]))
    }
}

/// Unsigned choice of caveat group, joined to a chain at redemption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionContext {
    pub selector: GroupSelector,
}

impl SelectionContext {
    pub fn trade() -> Self {
        Self {
            selector: GroupSelector::Trade,
        }
    }

    pub fn approve() -> Self {
        Self {
            selector: GroupSelector::Approve,
        }
    }
}

/// Ordered delegation chain, innermost first.
///
/// `links[0].delegate()` is the account that redeems; each link's
/// authority is the hash of the next; the last link is the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationChain {
    links: Vec<SignedDelegation>,
}

impl DelegationChain {
    pub fn new(links: Vec<SignedDelegation>, submitter: Address) -> Result<Self> {
        let first = links
            .first()
            .ok_or_else(|| Error::ChainBroken("chain is empty".into()))?;
        if first.delegate() != submitter {
            return Err(Error::ChainDelegateMismatch {
                expected: submitter,
                actual: first.delegate(),
            });
        }
        for pair in links.windows(2) {
            let (child, parent) = (&pair[0], &pair[1]);
            if child.authority() != parent.hash() {
                return Err(Error::ChainBroken(format!(
                    "authority {} does not match parent hash {}",
                    child.authority(),
                    parent.hash()
                )));
            }
            if child.delegator() != parent.delegate() {
                return Err(Error::ChainBroken(format!(
                    "delegator {} is not the parent's delegate {}",
                    child.delegator(),
                    parent.delegate()
                )));
            }
        }
        if links.last().map_or(true, |root| !root.is_root()) {
            return Err(Error::ChainBroken(
                "outermost delegation is not a root".into(),
            ));
        }
        Ok(Self { links })
    }

    pub fn links(&self) -> &[SignedDelegation] {
        &self.links
    }

    pub fn submitter(&self) -> Address {
        self.links[0].delegate()
    }

    /// Hash of the innermost delegation (the one whose call count advances).
    pub fn leaf_hash(&self) -> B256 {
        self.links[0].hash()
    }

    /// `abi.encode(Delegation[])` with args chosen by `selection`.
    pub fn permission_context(&self, selection: &SelectionContext) -> Result<Bytes> {
        let tokens = self
            .links
            .iter()
            .map(|d| d.to_token(selection))
            .collect::<Result<Vec<_>>>()?;
        Ok(Bytes::from(abi::encode(&[Token::Array(tokens)])))
    }
}

/// Shape of a delegation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DelegationKind {
    /// Single trade, five minute window.
    Ephemeral,
    /// User to primary agent.
    Root,
    /// Primary agent to sub-agent, chained under a root.
    SubDelegation,
}

impl DelegationKind {
    pub fn label(self) -> &'static str {
        match self {
            DelegationKind::Ephemeral => "ephemeral",
            DelegationKind::Root => "root",
            DelegationKind::SubDelegation => "sub-delegation",
        }
    }
}

/// Policy bounds checked before anything is signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DelegationPolicy {
    pub min_expiry_days: u32,
    pub max_expiry_days: u32,
    pub min_call_limit: u64,
    pub max_call_limit: u64,
    /// Hard cap on `valueCapPerTx * maxCalls` for a root delegation.
    pub root_budget_ceiling: U256,
}

impl Default for DelegationPolicy {
    fn default() -> Self {
        Self {
            min_expiry_days: MIN_EXPIRY_DAYS,
            max_expiry_days: MAX_EXPIRY_DAYS,
            min_call_limit: MIN_CALL_LIMIT,
            max_call_limit: MAX_CALL_LIMIT,
            // 10_000 ether
            root_budget_ceiling: U256::from(10_000u64) * U256::from(10u64).pow(U256::from(18)),
        }
    }
}

impl DelegationPolicy {
    /// Configured bounds never widen the hard [1, 30] day window.
    fn check_expiry(&self, days: u32) -> Result<()> {
        let min = self.min_expiry_days.max(MIN_EXPIRY_DAYS);
        let max = self.max_expiry_days.min(MAX_EXPIRY_DAYS);
        if days < min || days > max {
            return Err(Error::ExpiryOutOfBounds { days, min, max });
        }
        Ok(())
    }

    fn check_call_limit(&self, limit: u64) -> Result<()> {
        let min = self.min_call_limit.max(MIN_CALL_LIMIT);
        let max = self.max_call_limit.min(MAX_CALL_LIMIT);
        if limit < min || limit > max {
            return Err(Error::CallLimitOutOfBounds { limit, min, max });
        }
        Ok(())
    }
}

/// Parameters of a persistent (root or sub) delegation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentRequest {
    pub expiry_days: u32,
    pub value_cap_per_call: U256,
    pub call_limit: u64,
    /// Scope groups. The per-call cap is applied on top.
    pub scope: PermissionScope,
    /// Embed a revocation nonce read from chain.
    pub revocable: bool,
}

/// A delegation ready to sign, with the metadata persisted alongside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationDraft {
    pub kind: DelegationKind,
    pub delegation: Delegation,
    pub scope: PermissionScope,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub value_cap_per_tx: Option<U256>,
    pub max_calls: u64,
    pub approximate_budget: Option<U256>,
    pub nonce: Option<U256>,
}

impl DelegationDraft {
    pub fn allowed_targets(&self) -> Vec<Address> {
        self.scope.all_targets()
    }

    /// Human readable label shown on the signing prompt.
    pub fn signing_label(&self) -> String {
        match self.kind {
            DelegationKind::Ephemeral => "Approve single trade".to_string(),
            DelegationKind::Root => format!(
                "Enable agent trading: up to {} calls until {}",
                self.max_calls,
                self.expires_at.format("%Y-%m-%d %H:%M UTC")
            ),
            DelegationKind::SubDelegation => format!(
                "Delegate to sub-agent: up to {} calls until {}",
                self.max_calls,
                self.expires_at.format("%Y-%m-%d %H:%M UTC")
            ),
        }
    }
}

/// Composes delegations from caveat sets.
#[derive(Debug, Clone)]
pub struct DelegationFactory {
    domain: DelegationDomain,
    caveats: CaveatBuilder,
    policy: DelegationPolicy,
}

impl DelegationFactory {
    pub fn new(domain: DelegationDomain, caveats: CaveatBuilder, policy: DelegationPolicy) -> Self {
        Self {
            domain,
            caveats,
            policy,
        }
    }

    pub fn domain(&self) -> &DelegationDomain {
        &self.domain
    }

    pub fn policy(&self) -> &DelegationPolicy {
        &self.policy
    }

    /// Single-trade delegation: five minutes, one call, nonce-revocable.
    pub async fn ephemeral(
        &self,
        tracker: &NonceRevocationTracker,
        delegator: Address,
        delegate: Address,
        scope: PermissionScope,
        issued_at: DateTime<Utc>,
    ) -> Result<DelegationDraft> {
        scope.validate()?;
        let nonce = tracker.current_nonce(delegator).await?;
        let profile = TemporalProfile::Ephemeral { nonce };
        let value_cap = scope.value_lte;
        self.build(
            DelegationKind::Ephemeral,
            delegator,
            delegate,
            ROOT_AUTHORITY,
            scope,
            profile,
            ephemeral_salt(issued_at),
            value_cap,
            None,
            issued_at,
        )
    }

    /// User to primary agent. Salt is zero.
    pub async fn root(
        &self,
        tracker: &NonceRevocationTracker,
        delegator: Address,
        delegate: Address,
        request: PersistentRequest,
        issued_at: DateTime<Utc>,
    ) -> Result<DelegationDraft> {
        let budget = self.check_persistent(&request)?;
        if budget > self.policy.root_budget_ceiling {
            return Err(Error::BudgetCeilingExceeded {
                budget,
                ceiling: self.policy.root_budget_ceiling,
            });
        }
        let nonce = self.read_nonce(tracker, delegator, request.revocable).await?;
        self.build_persistent(
            DelegationKind::Root,
            delegator,
            delegate,
            ROOT_AUTHORITY,
            request,
            nonce,
            U256::ZERO,
            budget,
            issued_at,
        )
    }

    /// Primary agent to sub-agent, chained under `parent`.
    pub async fn sub_delegation(
        &self,
        tracker: &NonceRevocationTracker,
        parent: &SignedDelegation,
        delegate: Address,
        request: PersistentRequest,
        issued_at: DateTime<Utc>,
    ) -> Result<DelegationDraft> {
        let budget = self.check_persistent(&request)?;
        let delegator = parent.delegate();
        let nonce = self.read_nonce(tracker, delegator, request.revocable).await?;
        self.build_persistent(
            DelegationKind::SubDelegation,
            delegator,
            delegate,
            parent.hash(),
            request,
            nonce,
            random_salt(),
            budget,
            issued_at,
        )
    }

    /// Validate a persistent request and return its approximate budget.
    fn check_persistent(&self, request: &PersistentRequest) -> Result<U256> {
        self.policy.check_expiry(request.expiry_days)?;
        self.policy.check_call_limit(request.call_limit)?;
        if request.value_cap_per_call.is_zero() {
            return Err(Error::InvalidValueCap);
        }
        request.scope.validate()?;
        request
            .value_cap_per_call
            .checked_mul(U256::from(request.call_limit))
            .ok_or_else(|| Error::Validation("approximate budget overflows uint256".into()))
    }

    async fn read_nonce(
        &self,
        tracker: &NonceRevocationTracker,
        delegator: Address,
        revocable: bool,
    ) -> Result<Option<U256>> {
        if revocable {
            Ok(Some(tracker.current_nonce(delegator).await?))
        } else {
            Ok(None)
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_persistent(
        &self,
        kind: DelegationKind,
        delegator: Address,
        delegate: Address,
        authority: B256,
        request: PersistentRequest,
        nonce: Option<U256>,
        salt: U256,
        budget: U256,
        issued_at: DateTime<Utc>,
    ) -> Result<DelegationDraft> {
        let profile = TemporalProfile::Persistent {
            days: request.expiry_days,
            call_limit: request.call_limit,
            nonce,
        };
        let scope = request.scope.with_value_cap(request.value_cap_per_call);
        self.build(
            kind,
            delegator,
            delegate,
            authority,
            scope,
            profile,
            salt,
            Some(request.value_cap_per_call),
            Some(budget),
            issued_at,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        &self,
        kind: DelegationKind,
        delegator: Address,
        delegate: Address,
        authority: B256,
        scope: PermissionScope,
        profile: TemporalProfile,
        salt: U256,
        value_cap_per_tx: Option<U256>,
        approximate_budget: Option<U256>,
        issued_at: DateTime<Utc>,
    ) -> Result<DelegationDraft> {
        if delegate == Address::ZERO || delegator == Address::ZERO {
            return Err(Error::Validation(
                "delegator and delegate must be non-zero addresses".into(),
            ));
        }
        // persisted timestamps are millisecond precision
        let issued_at = issued_at.trunc_subsecs(3);
        let set = self.caveats.build(&scope, &profile, issued_at)?;
        let delegation = Delegation {
            delegate,
            delegator,
            authority,
            caveats: set.caveats,
            salt,
        };

        tracing::debug!(
            kind = kind.label(),
            %delegator,
            %delegate,
            hash = %delegation.hash(),
            expires_at = %set.expires_at,
            "built delegation"
        );

        Ok(DelegationDraft {
            kind,
            delegation,
            scope: set.scope,
            created_at: issued_at,
            expires_at: set.expires_at,
            value_cap_per_tx,
            max_calls: profile.call_limit(),
            approximate_budget,
            nonce: profile.nonce(),
        })
    }
}

/// `timestamp_ms << 128 | random_u128`
fn ephemeral_salt(issued_at: DateTime<Utc>) -> U256 {
    let millis = U256::from(issued_at.timestamp_millis().max(0) as u64);
    let random: u128 = rand::thread_rng().gen();
    (millis << 128usize) | U256::from(random)
}

fn random_salt() -> U256 {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    U256::from_be_bytes(bytes)
}
