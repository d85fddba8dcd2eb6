//! The signing seam.
//!
//! Private keys never enter this crate. A [`SignatureBroker`] is handed a
//! digest plus a human readable label, shows the label to the user, and
//! returns a signature once they confirm. Implementations typically wrap a
//! secure-enclave passkey.

use alloy_primitives::{Bytes, B256};
use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::info;

use crate::delegation::{DelegationDraft, DelegationDomain};
use crate::error::Error;
use crate::store::StoredDelegation;

/// Why a signing request did not produce a signature.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    /// The user dismissed the prompt. Callers may ask again.
    #[error("cancelled by user")]
    Cancelled,
    /// The enclave or device failed.
    #[error("enclave failure: {0}")]
    Enclave(String),
}

impl From<SignatureError> for Error {
    fn from(e: SignatureError) -> Self {
        match e {
            SignatureError::Cancelled => Error::SignatureCancelled,
            SignatureError::Enclave(msg) => Error::SignatureFailed(msg),
        }
    }
}

/// Signs 32-byte digests after user confirmation.
#[async_trait]
pub trait SignatureBroker: Send + Sync {
    /// Sign `digest`. Blocks until the user confirms or cancels.
    async fn sign(&self, digest: B256, label: &str) -> Result<Bytes, SignatureError>;
}

/// Sign a delegation draft and produce the record to persist.
pub async fn sign_draft(
    broker: &dyn SignatureBroker,
    domain: &DelegationDomain,
    draft: DelegationDraft,
) -> crate::Result<StoredDelegation> {
    let digest = draft.delegation.digest(domain);
    let label = draft.signing_label();
    let signature = broker.sign(digest, &label).await?;

    let stored = StoredDelegation::from_draft(draft, signature);
    info!(
        kind = stored.kind.label(),
        hash = %stored.delegation_hash,
        signed_at = %Utc::now(),
        "delegation signed"
    );
    Ok(stored)
}
