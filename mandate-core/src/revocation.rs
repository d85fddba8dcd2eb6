//! Nonce-based revocation and enforcer state reads.
//!
//! A delegation that embeds a `Nonce` caveat is valid only while the
//! delegator's on-chain nonce still equals the embedded value. Bumping the
//! nonce with `incrementNonce` invalidates every delegation signed against
//! the old value in one transaction.
//!
//! The nonce is read from chain immediately before use and never cached.
//!
//! Two creations for the same delegator that both read the nonce before
//! either is signed will embed the same value. That is harmless for hash
//! uniqueness (salts differ) but means one increment revokes both. Callers
//! that need independent revocation must serialize creation per delegator.

use std::sync::Arc;

use alloy_primitives::{Address, B256, U256};
use tracing::debug;

use crate::abi::{self, Token};
use crate::error::Result;
use crate::execution::Execution;
use crate::rpc::ChainReader;

/// Reads and bumps the delegator's revocation nonce.
#[derive(Clone)]
pub struct NonceRevocationTracker {
    reader: Arc<dyn ChainReader>,
    nonce_enforcer: Address,
    delegation_manager: Address,
}

impl NonceRevocationTracker {
    pub fn new(
        reader: Arc<dyn ChainReader>,
        nonce_enforcer: Address,
        delegation_manager: Address,
    ) -> Self {
        Self {
            reader,
            nonce_enforcer,
            delegation_manager,
        }
    }

    /// `NonceEnforcer.currentNonce(delegationManager, delegator)`
    pub async fn current_nonce(&self, delegator: Address) -> Result<U256> {
        let data = abi::encode_call(
            "currentNonce(address,address)",
            &[
                Token::Address(self.delegation_manager),
                Token::Address(delegator),
            ],
        );
        let out = self.reader.call(self.nonce_enforcer, data).await?;
        let nonce = abi::decode_uint(&out, 0)?;
        debug!(%delegator, %nonce, "read revocation nonce");
        Ok(nonce)
    }

    /// Execution the delegator runs to invalidate every delegation signed
    /// against its current nonce.
    pub fn increment_nonce_execution(&self) -> Execution {
        Execution::new(
            self.nonce_enforcer,
            U256::ZERO,
            abi::encode_call(
                "incrementNonce(address)",
                &[Token::Address(self.delegation_manager)],
            ),
        )
    }
}

/// Reads `LimitedCallsEnforcer.callCounts(manager, delegationHash)`.
#[derive(Clone)]
pub struct CallCountReader {
    reader: Arc<dyn ChainReader>,
    limited_calls_enforcer: Address,
    delegation_manager: Address,
}

impl CallCountReader {
    pub fn new(
        reader: Arc<dyn ChainReader>,
        limited_calls_enforcer: Address,
        delegation_manager: Address,
    ) -> Self {
        Self {
            reader,
            limited_calls_enforcer,
            delegation_manager,
        }
    }

    /// Calls already redeemed against `delegation_hash`.
    pub async fn call_count(&self, delegation_hash: B256) -> Result<U256> {
        let data = abi::encode_call(
            "callCounts(address,bytes32)",
            &[
                Token::Address(self.delegation_manager),
                Token::FixedBytes(delegation_hash),
            ],
        );
        let out = self.reader.call(self.limited_calls_enforcer, data).await?;
        abi::decode_uint(&out, 0)
    }
}
