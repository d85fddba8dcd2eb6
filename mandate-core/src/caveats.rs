//! Caveats: the restrictions attached to a delegation.
//!
//! A [`Caveat`] is a typed restriction. Bound to its enforcer contract it
//! becomes a [`BoundCaveat`], whose `(enforcer, terms)` pair is what the
//! delegator signs. The per-redemption `args` are never signed; see
//! [`SelectionContext`](crate::delegation::SelectionContext).
//!
//! [`CaveatBuilder`] turns a [`PermissionScope`] and a [`TemporalProfile`]
//! into the ordered caveat list. The order is fixed:
//!
//! 1. `Timestamp`
//! 2. `LimitedCalls`
//! 3. `Nonce` (if any)
//! 4. `ValueLte` (if any)
//! 5. scope caveats: `AllowedTargets`, `AllowedMethods`, `AllowedCalldata`
//!    pins, or a single `LogicalOrGroup` when the scope has more than one
//!    alternative group.
//!
//! ## Trade-offs
//!
//! - An empty method list permits **every** method on the listed targets.
//! - Native value transfers are bounded by `ValueLte` and `AllowedTargets`
//!   only. There is no calldata pin on the recipient.

use alloy_primitives::{keccak256, Address, Bytes, Selector, B256, U256};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::abi::{self, Token};
use crate::domain::caveat_typehash;
use crate::error::{Error, Result};

/// Lifetime of an ephemeral (single trade) delegation.
pub const EPHEMERAL_WINDOW_SECS: i64 = 5 * 60;

/// `transfer(address,uint256)`
pub const ERC20_TRANSFER_SELECTOR: Selector = Selector::new([0xa9, 0x05, 0x9c, 0xbb]);

/// `approve(address,uint256)`
pub const ERC20_APPROVE_SELECTOR: Selector = Selector::new([0x09, 0x5e, 0xa7, 0xb3]);

/// Calldata offset of the recipient in `transfer(address,uint256)`.
pub const TRANSFER_RECIPIENT_OFFSET: u64 = 4;

/// Calldata offset of the amount in `transfer(address,uint256)`.
pub const TRANSFER_AMOUNT_OFFSET: u64 = 36;

/// A typed restriction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Caveat {
    /// Valid strictly after `after` and strictly before `before` (unix seconds).
    Timestamp { after: u64, before: u64 },
    LimitedCalls { limit: u64 },
    Nonce { value: U256 },
    ValueLte { max: U256 },
    AllowedTargets { targets: Vec<Address> },
    /// Empty list is never emitted; absence means all methods.
    AllowedMethods { selectors: Vec<Selector> },
    AllowedCalldata { offset: u64, expected: Bytes },
    /// Alternatives chosen at redemption time without re-signing.
    LogicalOrGroup { groups: Vec<CaveatGroup> },
}

/// Discriminant of a [`Caveat`], used to look up its enforcer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaveatKind {
    Timestamp,
    LimitedCalls,
    Nonce,
    ValueLte,
    AllowedTargets,
    AllowedMethods,
    AllowedCalldata,
    LogicalOrGroup,
}

impl Caveat {
    pub fn kind(&self) -> CaveatKind {
        match self {
            Caveat::Timestamp { .. } => CaveatKind::Timestamp,
            Caveat::LimitedCalls { .. } => CaveatKind::LimitedCalls,
            Caveat::Nonce { .. } => CaveatKind::Nonce,
            Caveat::ValueLte { .. } => CaveatKind::ValueLte,
            Caveat::AllowedTargets { .. } => CaveatKind::AllowedTargets,
            Caveat::AllowedMethods { .. } => CaveatKind::AllowedMethods,
            Caveat::AllowedCalldata { .. } => CaveatKind::AllowedCalldata,
            Caveat::LogicalOrGroup { .. } => CaveatKind::LogicalOrGroup,
        }
    }

    /// Enforcer terms, exactly as the enforcer contract decodes them.
    pub fn terms(&self) -> Vec<u8> {
        match self {
            Caveat::Timestamp { after, before } => {
                // uint128 after ‖ uint128 before
                let mut out = vec![0u8; 32];
                out[8..16].copy_from_slice(&after.to_be_bytes());
                out[24..32].copy_from_slice(&before.to_be_bytes());
                out
            }
            Caveat::LimitedCalls { limit } => abi::word_u256(U256::from(*limit)).to_vec(),
            Caveat::Nonce { value } => abi::word_u256(*value).to_vec(),
            Caveat::ValueLte { max } => abi::word_u256(*max).to_vec(),
            Caveat::AllowedTargets { targets } => targets
                .iter()
                .flat_map(|t| t.as_slice().iter().copied())
                .collect(),
            Caveat::AllowedMethods { selectors } => selectors
                .iter()
                .flat_map(|s| s.as_slice().iter().copied())
                .collect(),
            Caveat::AllowedCalldata { offset, expected } => {
                let mut out = abi::word_u256(U256::from(*offset)).to_vec();
                out.extend_from_slice(expected);
                out
            }
            Caveat::LogicalOrGroup { groups } => {
                let encoded_groups = groups
                    .iter()
                    .map(|group| {
                        let caveats = group
                            .caveats
                            .iter()
                            .map(|c| {
                                Token::Tuple(vec![
                                    Token::Address(c.enforcer),
                                    Token::Bytes(c.terms()),
                                    Token::Bytes(Vec::new()),
                                ])
                            })
                            .collect();
                        Token::Tuple(vec![Token::Array(caveats)])
                    })
                    .collect();
                abi::encode(&[Token::Array(encoded_groups)])
            }
        }
    }
}

/// A caveat bound to the enforcer contract that checks it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundCaveat {
    pub enforcer: Address,
    pub caveat: Caveat,
}

impl BoundCaveat {
    pub fn terms(&self) -> Vec<u8> {
        self.caveat.terms()
    }

    /// EIP-712 struct hash of `Caveat(address enforcer,bytes terms)`.
    pub fn struct_hash(&self) -> B256 {
        keccak256(abi::encode(&[
            Token::FixedBytes(caveat_typehash()),
            Token::Address(self.enforcer),
            Token::FixedBytes(keccak256(self.terms())),
        ]))
    }

    /// Unsigned redemption args selecting `selector` in a `LogicalOrGroup`.
    ///
    /// Returns empty args for every other caveat kind.
    pub fn selection_args(&self, selector: GroupSelector) -> Result<Vec<u8>> {
        let Caveat::LogicalOrGroup { groups } = &self.caveat else {
            return Ok(Vec::new());
        };
        let (index, group) = groups
            .iter()
            .enumerate()
            .find(|(_, g)| g.selector == selector)
            .ok_or_else(|| {
                Error::Validation(format!("delegation has no '{}' caveat group", selector))
            })?;
        let inner_args = group
            .caveats
            .iter()
            .map(|_| Token::Bytes(Vec::new()))
            .collect();
        Ok(abi::encode(&[Token::Tuple(vec![
            Token::uint(index as u64),
            Token::Array(inner_args),
        ])]))
    }
}

/// One alternative inside a `LogicalOrGroup`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaveatGroup {
    pub selector: GroupSelector,
    pub caveats: Vec<BoundCaveat>,
}

/// Named alternative a redemption can choose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupSelector {
    Trade,
    Approve,
}

impl std::fmt::Display for GroupSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GroupSelector::Trade => write!(f, "trade"),
            GroupSelector::Approve => write!(f, "approve"),
        }
    }
}

/// Enforcer contract addresses for a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnforcerAddresses {
    pub timestamp: Address,
    pub limited_calls: Address,
    pub nonce: Address,
    pub value_lte: Address,
    pub allowed_targets: Address,
    pub allowed_methods: Address,
    pub allowed_calldata: Address,
    pub logical_or: Address,
}

impl EnforcerAddresses {
    pub fn for_kind(&self, kind: CaveatKind) -> Address {
        match kind {
            CaveatKind::Timestamp => self.timestamp,
            CaveatKind::LimitedCalls => self.limited_calls,
            CaveatKind::Nonce => self.nonce,
            CaveatKind::ValueLte => self.value_lte,
            CaveatKind::AllowedTargets => self.allowed_targets,
            CaveatKind::AllowedMethods => self.allowed_methods,
            CaveatKind::AllowedCalldata => self.allowed_calldata,
            CaveatKind::LogicalOrGroup => self.logical_or,
        }
    }

    pub fn bind(&self, caveat: Caveat) -> BoundCaveat {
        BoundCaveat {
            enforcer: self.for_kind(caveat.kind()),
            caveat,
        }
    }
}

/// A byte-exact calldata pin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalldataPin {
    pub offset: u64,
    pub expected: Bytes,
}

/// One alternative of a permission scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeGroup {
    pub selector: GroupSelector,
    pub targets: Vec<Address>,
    #[serde(default)]
    pub methods: Vec<Selector>,
    #[serde(default)]
    pub calldata_pins: Vec<CalldataPin>,
}

impl ScopeGroup {
    pub fn new(selector: GroupSelector, targets: Vec<Address>) -> Self {
        Self {
            selector,
            targets,
            methods: Vec::new(),
            calldata_pins: Vec::new(),
        }
    }

    pub fn methods(mut self, methods: impl IntoIterator<Item = Selector>) -> Self {
        self.methods.extend(methods);
        self
    }

    pub fn pin(mut self, offset: u64, expected: impl Into<Bytes>) -> Self {
        self.calldata_pins.push(CalldataPin {
            offset,
            expected: expected.into(),
        });
        self
    }

    /// `token.transfer(recipient, amount)`, with recipient and amount pinned.
    pub fn erc20_transfer(token: Address, recipient: Address, amount: U256) -> Self {
        Self::new(GroupSelector::Trade, vec![token])
            .methods([ERC20_TRANSFER_SELECTOR])
            .pin(
                TRANSFER_RECIPIENT_OFFSET,
                abi::word_address(recipient).to_vec(),
            )
            .pin(TRANSFER_AMOUNT_OFFSET, abi::word_u256(amount).to_vec())
    }

    /// `token.approve(..)` on each token. The spender is checked against
    /// the whitelist before redemption, not pinned here.
    pub fn erc20_approvals(tokens: Vec<Address>) -> Self {
        Self::new(GroupSelector::Approve, tokens).methods([ERC20_APPROVE_SELECTOR])
    }

    fn is_transfer_only(&self) -> bool {
        self.methods.len() == 1 && self.methods[0] == ERC20_TRANSFER_SELECTOR
    }

    fn validate(&self) -> Result<()> {
        if self.targets.is_empty() {
            return Err(Error::EmptyTargets);
        }
        if self.is_transfer_only() {
            let pinned = |offset| self.calldata_pins.iter().any(|p| p.offset == offset);
            if !(pinned(TRANSFER_RECIPIENT_OFFSET) && pinned(TRANSFER_AMOUNT_OFFSET)) {
                return Err(Error::IncompleteTransferPin {
                    token: self.targets[0],
                });
            }
        }
        Ok(())
    }

    fn caveats(&self, enforcers: &EnforcerAddresses) -> Vec<BoundCaveat> {
        let mut out = vec![enforcers.bind(Caveat::AllowedTargets {
            targets: self.targets.clone(),
        })];
        if !self.methods.is_empty() {
            out.push(enforcers.bind(Caveat::AllowedMethods {
                selectors: self.methods.clone(),
            }));
        }
        for pin in &self.calldata_pins {
            out.push(enforcers.bind(Caveat::AllowedCalldata {
                offset: pin.offset,
                expected: pin.expected.clone(),
            }));
        }
        out
    }
}

/// What a delegation permits: a per-call value cap plus one or more
/// alternative target/method groups.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionScope {
    #[serde(default)]
    pub value_lte: Option<U256>,
    pub groups: Vec<ScopeGroup>,
}

impl PermissionScope {
    pub fn single(group: ScopeGroup) -> Self {
        Self {
            value_lte: None,
            groups: vec![group],
        }
    }

    pub fn with_group(mut self, group: ScopeGroup) -> Self {
        self.groups.push(group);
        self
    }

    pub fn with_value_cap(mut self, max: U256) -> Self {
        self.value_lte = Some(max);
        self
    }

    /// Native value transfer to `recipient`, capped at `amount` per call.
    pub fn native_transfer(recipient: Address, amount: U256) -> Self {
        Self::single(ScopeGroup::new(GroupSelector::Trade, vec![recipient])).with_value_cap(amount)
    }

    /// Every target across all groups, deduplicated, in first-seen order.
    pub fn all_targets(&self) -> Vec<Address> {
        let mut out: Vec<Address> = Vec::new();
        for target in self.groups.iter().flat_map(|g| g.targets.iter()) {
            if !out.contains(target) {
                out.push(*target);
            }
        }
        out
    }

    pub fn validate(&self) -> Result<()> {
        if self.groups.is_empty() {
            return Err(Error::EmptyTargets);
        }
        if self.value_lte == Some(U256::ZERO) {
            return Err(Error::InvalidValueCap);
        }
        for group in &self.groups {
            group.validate()?;
        }
        let mut seen = Vec::with_capacity(self.groups.len());
        for group in &self.groups {
            if seen.contains(&group.selector) {
                return Err(Error::Validation(format!(
                    "duplicate '{}' group in permission scope",
                    group.selector
                )));
            }
            seen.push(group.selector);
        }
        Ok(())
    }
}

/// Temporal and quantity bounds of a delegation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemporalProfile {
    /// Five minute window, exactly one call, revocable by nonce.
    Ephemeral { nonce: U256 },
    /// Multi-day window and a call budget. The nonce is present only when
    /// revocation support was requested.
    Persistent {
        days: u32,
        call_limit: u64,
        nonce: Option<U256>,
    },
}

impl TemporalProfile {
    pub fn call_limit(&self) -> u64 {
        match self {
            TemporalProfile::Ephemeral { .. } => 1,
            TemporalProfile::Persistent { call_limit, .. } => *call_limit,
        }
    }

    pub fn nonce(&self) -> Option<U256> {
        match self {
            TemporalProfile::Ephemeral { nonce } => Some(*nonce),
            TemporalProfile::Persistent { nonce, .. } => *nonce,
        }
    }

    pub fn window(&self) -> Duration {
        match self {
            TemporalProfile::Ephemeral { .. } => Duration::seconds(EPHEMERAL_WINDOW_SECS),
            TemporalProfile::Persistent { days, .. } => Duration::days(i64::from(*days)),
        }
    }
}

/// Output of [`CaveatBuilder::build`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaveatSet {
    pub caveats: Vec<BoundCaveat>,
    pub scope: PermissionScope,
    pub expires_at: DateTime<Utc>,
}

/// Builds ordered caveat lists.
#[derive(Debug, Clone)]
pub struct CaveatBuilder {
    enforcers: EnforcerAddresses,
}

impl CaveatBuilder {
    pub fn new(enforcers: EnforcerAddresses) -> Self {
        Self { enforcers }
    }

    pub fn enforcers(&self) -> &EnforcerAddresses {
        &self.enforcers
    }

    pub fn build(
        &self,
        scope: &PermissionScope,
        profile: &TemporalProfile,
        issued_at: DateTime<Utc>,
    ) -> Result<CaveatSet> {
        scope.validate()?;

        let expires_at = issued_at + profile.window();
        let before = u64::try_from(expires_at.timestamp())
            .map_err(|_| Error::Validation(format!("expiry {expires_at} is before the epoch")))?;

        let mut caveats = vec![
            self.enforcers.bind(Caveat::Timestamp { after: 0, before }),
            self.enforcers.bind(Caveat::LimitedCalls {
                limit: profile.call_limit(),
            }),
        ];
        if let Some(value) = profile.nonce() {
            caveats.push(self.enforcers.bind(Caveat::Nonce { value }));
        }
        if let Some(max) = scope.value_lte {
            caveats.push(self.enforcers.bind(Caveat::ValueLte { max }));
        }

        match scope.groups.as_slice() {
            [only] => caveats.extend(only.caveats(&self.enforcers)),
            groups => {
                let groups = groups
                    .iter()
                    .map(|g| CaveatGroup {
                        selector: g.selector,
                        caveats: g.caveats(&self.enforcers),
                    })
                    .collect();
                caveats.push(self.enforcers.bind(Caveat::LogicalOrGroup { groups }));
            }
        }

        Ok(CaveatSet {
            caveats,
            scope: scope.clone(),
            expires_at,
        })
    }
}
