//! Delegation construction and chaining through the public factory API.

mod common;

use alloy_primitives::U256;
use chrono::{Duration, Utc};
use common::*;
use mandate::caveats::{Caveat, CaveatKind};
use mandate::signer::sign_draft;
use mandate::{
    DelegationChain, DelegationKind, Error, GroupSelector, PermissionScope, PersistentRequest,
    ScopeGroup, SelectionContext, ROOT_AUTHORITY,
};

fn persistent(days: u32, cap: U256, calls: u64) -> PersistentRequest {
    PersistentRequest {
        expiry_days: days,
        value_cap_per_call: cap,
        call_limit: calls,
        scope: trading_scope(),
        revocable: true,
    }
}

fn kinds(caveats: &[mandate::caveats::BoundCaveat]) -> Vec<CaveatKind> {
    caveats.iter().map(|c| c.caveat.kind()).collect()
}

// ============================================================================
// Root
// ============================================================================

#[tokio::test]
async fn test_root_budget_and_expiry() {
    let chain = FakeChain::new();
    let issued_at = Utc::now();

    let draft = factory()
        .root(&tracker(&chain), USER, PRIMARY, persistent(7, ether(1), 100), issued_at)
        .await
        .unwrap();

    assert_eq!(draft.kind, DelegationKind::Root);
    assert_eq!(draft.approximate_budget, Some(ether(100)));
    assert_eq!(draft.value_cap_per_tx, Some(ether(1)));
    assert_eq!(draft.max_calls, 100);
    assert_eq!(draft.expires_at - draft.created_at, Duration::days(7));
    assert_eq!(
        draft.created_at.timestamp_millis(),
        issued_at.timestamp_millis(),
        "issue time keeps millisecond precision"
    );
    assert_eq!(draft.delegation.authority, ROOT_AUTHORITY);
    assert_eq!(draft.delegation.salt, U256::ZERO);
    assert_eq!(
        kinds(&draft.delegation.caveats),
        vec![
            CaveatKind::Timestamp,
            CaveatKind::LimitedCalls,
            CaveatKind::Nonce,
            CaveatKind::ValueLte,
            CaveatKind::LogicalOrGroup,
        ]
    );
}

#[tokio::test]
async fn test_non_revocable_root_skips_nonce_read() {
    let chain = FakeChain::new();
    let mut request = persistent(7, ether(1), 100);
    request.revocable = false;

    let draft = factory()
        .root(&tracker(&chain), USER, PRIMARY, request, Utc::now())
        .await
        .unwrap();

    assert_eq!(draft.nonce, None);
    assert_eq!(chain.reads(), 0);
    assert!(!kinds(&draft.delegation.caveats).contains(&CaveatKind::Nonce));
}

#[tokio::test]
async fn test_root_policy_bounds() {
    let chain = FakeChain::new();
    let tracker = tracker(&chain);
    let factory = factory();
    let now = Utc::now();

    for days in [0, 31] {
        let err = factory
            .root(&tracker, USER, PRIMARY, persistent(days, ether(1), 10), now)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ExpiryOutOfBounds { .. }), "{days}: {err}");
    }
    for calls in [0, 10_001] {
        let err = factory
            .root(&tracker, USER, PRIMARY, persistent(7, ether(1), calls), now)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CallLimitOutOfBounds { .. }), "{calls}: {err}");
    }

    let err = factory
        .root(&tracker, USER, PRIMARY, persistent(7, U256::ZERO, 10), now)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidValueCap));

    let err = factory
        .root(&tracker, USER, PRIMARY, persistent(7, ether(200), 100), now)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BudgetCeilingExceeded { .. }));
    assert_eq!(err.kind(), mandate::ErrorKind::Validation);

    // nothing was read for rejected requests
    assert_eq!(chain.reads(), 0);
}

#[tokio::test]
async fn test_signing_label_describes_root() {
    let chain = FakeChain::new();
    let broker = ApprovingBroker::new();
    let store_dir = tempfile::tempdir().unwrap();
    let store = mandate::DelegationStore::open(store_dir.path()).unwrap();

    let stored = store_root(&store, &chain, &broker).await;

    let labels = broker.labels.lock().unwrap();
    assert_eq!(labels.len(), 1);
    assert!(labels[0].starts_with("Enable agent trading: up to 100 calls until"));
    assert_eq!(stored.delegation_hash, stored.signed_delegation.hash());
    assert_eq!(stored.allowed_targets, vec![VENUE, USDC]);
}

// ============================================================================
// Ephemeral
// ============================================================================

#[tokio::test]
async fn test_ephemeral_single_call_five_minutes() {
    let chain = FakeChain::new();
    chain.set_nonce(USER, U256::from(7));
    let scope = PermissionScope::single(
        ScopeGroup::new(GroupSelector::Trade, vec![VENUE])
            .methods([alloy_primitives::FixedBytes::new([0x12, 0x34, 0x56, 0x78])]),
    );

    let draft = factory()
        .ephemeral(&tracker(&chain), USER, PRIMARY, scope, Utc::now())
        .await
        .unwrap();

    assert_eq!(draft.kind, DelegationKind::Ephemeral);
    assert_eq!(draft.max_calls, 1);
    assert_eq!(draft.nonce, Some(U256::from(7)));
    assert_eq!(draft.expires_at - draft.created_at, Duration::minutes(5));
    assert_eq!(draft.approximate_budget, None);
    assert_eq!(
        kinds(&draft.delegation.caveats),
        vec![
            CaveatKind::Timestamp,
            CaveatKind::LimitedCalls,
            CaveatKind::Nonce,
            CaveatKind::AllowedTargets,
            CaveatKind::AllowedMethods,
        ]
    );
    assert!(matches!(
        draft.delegation.caveats[2].caveat,
        Caveat::Nonce { value } if value == U256::from(7)
    ));
    // salt carries the issue time in its upper 128 bits
    let millis: U256 = draft.delegation.salt >> 128usize;
    assert_eq!(millis, U256::from(draft.created_at.timestamp_millis() as u64));
}

#[tokio::test]
async fn test_ephemeral_native_transfer_caps_value() {
    let chain = FakeChain::new();
    let recipient = alloy_primitives::Address::repeat_byte(0x77);

    let draft = factory()
        .ephemeral(
            &tracker(&chain),
            USER,
            PRIMARY,
            PermissionScope::native_transfer(recipient, ether(2)),
            Utc::now(),
        )
        .await
        .unwrap();

    assert!(draft
        .delegation
        .caveats
        .iter()
        .any(|c| c.caveat == Caveat::ValueLte { max: ether(2) }));
    assert!(draft.delegation.caveats.iter().any(|c| c.caveat
        == Caveat::AllowedTargets {
            targets: vec![recipient]
        }));
}

// ============================================================================
// Chains
// ============================================================================

#[tokio::test]
async fn test_sub_delegation_chains_under_root() {
    let chain = FakeChain::new();
    let broker = ApprovingBroker::new();
    let factory = factory();
    let tracker = tracker(&chain);

    let root_draft = factory
        .root(&tracker, USER, PRIMARY, persistent(7, ether(1), 100), Utc::now())
        .await
        .unwrap();
    let root = sign_draft(&*broker, factory.domain(), root_draft).await.unwrap();

    let sub_draft = factory
        .sub_delegation(
            &tracker,
            &root.signed_delegation,
            SUB_AGENT,
            persistent(3, ether(1), 10),
            Utc::now(),
        )
        .await
        .unwrap();
    assert_eq!(sub_draft.kind, DelegationKind::SubDelegation);
    assert_eq!(sub_draft.delegation.delegator, PRIMARY);
    assert_eq!(sub_draft.delegation.authority, root.delegation_hash);
    assert_ne!(sub_draft.delegation.salt, U256::ZERO);
    let sub = sign_draft(&*broker, factory.domain(), sub_draft).await.unwrap();

    let links = vec![sub.signed_delegation.clone(), root.signed_delegation.clone()];
    let chain_ok = DelegationChain::new(links.clone(), SUB_AGENT).unwrap();
    assert_eq!(chain_ok.submitter(), SUB_AGENT);
    assert_eq!(chain_ok.leaf_hash(), sub.delegation_hash);

    let err = DelegationChain::new(links.clone(), PRIMARY).unwrap_err();
    assert!(matches!(err, Error::ChainDelegateMismatch { .. }));

    let reversed = vec![root.signed_delegation, sub.signed_delegation];
    assert!(DelegationChain::new(reversed, PRIMARY).is_err());
}

#[tokio::test]
async fn test_selection_changes_context_not_hash() {
    let chain = FakeChain::new();
    let broker = ApprovingBroker::new();
    let factory = factory();

    let draft = factory
        .root(&tracker(&chain), USER, PRIMARY, persistent(7, ether(1), 100), Utc::now())
        .await
        .unwrap();
    let unsigned_hash = draft.delegation.hash();
    let root = sign_draft(&*broker, factory.domain(), draft).await.unwrap();
    assert_eq!(root.delegation_hash, unsigned_hash);

    let chain = DelegationChain::new(vec![root.signed_delegation.clone()], PRIMARY).unwrap();
    let trade = chain.permission_context(&SelectionContext::trade()).unwrap();
    let approve = chain.permission_context(&SelectionContext::approve()).unwrap();

    assert_ne!(trade, approve);
    assert_eq!(chain.leaf_hash(), unsigned_hash);
}

#[tokio::test]
async fn test_single_group_ignores_selection() {
    let chain = FakeChain::new();
    let broker = ApprovingBroker::new();
    let factory = factory();
    let mut request = persistent(7, ether(1), 100);
    request.scope = PermissionScope::single(ScopeGroup::new(GroupSelector::Trade, vec![VENUE]));

    let draft = factory
        .root(&tracker(&chain), USER, PRIMARY, request, Utc::now())
        .await
        .unwrap();
    let root = sign_draft(&*broker, factory.domain(), draft).await.unwrap();
    let chain = DelegationChain::new(vec![root.signed_delegation], PRIMARY).unwrap();

    assert_eq!(
        chain.permission_context(&SelectionContext::trade()).unwrap(),
        chain.permission_context(&SelectionContext::approve()).unwrap()
    );
}
