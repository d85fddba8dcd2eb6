//! Durable local state: signed delegations and agent records.
//!
//! Two JSON files live in the store directory, `delegations.json` and
//! `agents.json`. Every write replaces the whole file by writing a sibling
//! temp file and renaming it over the original, so a crash leaves either
//! the old or the new contents.
//!
//! Deleting a delegation here only forgets it locally. On-chain it stays
//! redeemable until its caveats (expiry, call limit, nonce) stop it.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use alloy_primitives::{Address, Bytes, B256, U256};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::agent::AgentState;
use crate::caveats::PermissionScope;
use crate::delegation::{DelegationDraft, DelegationKind, SignedDelegation};
use crate::error::{Error, Result};

const DELEGATIONS_FILE: &str = "delegations.json";
const AGENTS_FILE: &str = "agents.json";
const STORE_VERSION: u32 = 1;

/// A signed delegation plus the metadata derived when it was built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredDelegation {
    pub delegation_hash: B256,
    pub kind: DelegationKind,
    pub signed_delegation: SignedDelegation,
    pub allowed_targets: Vec<Address>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub value_cap_per_tx: Option<U256>,
    pub max_calls: u64,
    #[serde(default)]
    pub approximate_budget: Option<U256>,
    #[serde(default)]
    pub nonce: Option<U256>,
    pub scope: PermissionScope,
}

impl StoredDelegation {
    pub fn from_draft(draft: DelegationDraft, signature: Bytes) -> Self {
        let allowed_targets = draft.allowed_targets();
        let signed = draft.delegation.into_signed(signature);
        Self {
            delegation_hash: signed.hash(),
            kind: draft.kind,
            signed_delegation: signed,
            allowed_targets,
            created_at: draft.created_at,
            expires_at: draft.expires_at,
            value_cap_per_tx: draft.value_cap_per_tx,
            max_calls: draft.max_calls,
            approximate_budget: draft.approximate_budget,
            nonce: draft.nonce,
            scope: draft.scope,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Serialize, Deserialize)]
struct StoreFile<T> {
    version: u32,
    records: Vec<T>,
}

/// File-backed store.
#[derive(Debug)]
pub struct DelegationStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl DelegationStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        debug!(dir = %dir.display(), "opened delegation store");
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // ------------------------------------------------------------------
    // Delegations
    // ------------------------------------------------------------------

    /// Insert or replace by hash.
    pub fn save_delegation(&self, record: &StoredDelegation) -> Result<()> {
        self.update::<StoredDelegation, _>(DELEGATIONS_FILE, |records| {
            match records
                .iter_mut()
                .find(|r| r.delegation_hash == record.delegation_hash)
            {
                Some(existing) => *existing = record.clone(),
                None => records.push(record.clone()),
            }
        })?;
        info!(
            kind = record.kind.label(),
            hash = %record.delegation_hash,
            expires_at = %record.expires_at,
            "stored delegation"
        );
        Ok(())
    }

    pub fn get_delegation(&self, hash: B256) -> Result<Option<StoredDelegation>> {
        Ok(self
            .read::<StoredDelegation>(DELEGATIONS_FILE)?
            .into_iter()
            .find(|r| r.delegation_hash == hash))
    }

    pub fn list_delegations(&self) -> Result<Vec<StoredDelegation>> {
        self.read(DELEGATIONS_FILE)
    }

    /// Forget a delegation locally. Returns whether it existed.
    pub fn revoke_delegation(&self, hash: B256) -> Result<bool> {
        let mut removed = false;
        self.update::<StoredDelegation, _>(DELEGATIONS_FILE, |records| {
            let before = records.len();
            records.retain(|r| r.delegation_hash != hash);
            removed = records.len() != before;
        })?;
        if removed {
            info!(%hash, "revoked delegation locally");
        }
        Ok(removed)
    }

    /// Newest unexpired root delegation from `delegator` to `delegate`.
    pub fn root_delegation(
        &self,
        delegator: Address,
        delegate: Address,
        now: DateTime<Utc>,
    ) -> Result<Option<StoredDelegation>> {
        Ok(self
            .list_delegations()?
            .into_iter()
            .filter(|r| {
                r.kind == DelegationKind::Root
                    && r.signed_delegation.delegator() == delegator
                    && r.signed_delegation.delegate() == delegate
                    && !r.is_expired(now)
            })
            .max_by_key(|r| r.created_at))
    }

    // ------------------------------------------------------------------
    // Agents
    // ------------------------------------------------------------------

    /// Insert or replace by agent id.
    pub fn save_agent(&self, agent: &AgentState) -> Result<()> {
        self.update::<AgentState, _>(AGENTS_FILE, |records| {
            match records.iter_mut().find(|r| r.agent_id == agent.agent_id) {
                Some(existing) => *existing = agent.clone(),
                None => records.push(agent.clone()),
            }
        })?;
        debug!(agent_id = %agent.agent_id, status = %agent.status, "stored agent");
        Ok(())
    }

    pub fn get_agent(&self, agent_id: &str) -> Result<Option<AgentState>> {
        Ok(self
            .read::<AgentState>(AGENTS_FILE)?
            .into_iter()
            .find(|r| r.agent_id == agent_id))
    }

    pub fn list_agents(&self) -> Result<Vec<AgentState>> {
        self.read(AGENTS_FILE)
    }

    /// Mark an agent revoked and forget its sub-delegation.
    pub fn revoke_agent(&self, agent_id: &str) -> Result<AgentState> {
        let mut agent = self
            .get_agent(agent_id)?
            .ok_or_else(|| Error::AgentNotFound(agent_id.to_string()))?;
        agent.revoke();
        self.revoke_delegation(agent.delegation_hash)?;
        self.save_agent(&agent)?;
        info!(agent_id, "agent revoked");
        Ok(agent)
    }

    // ------------------------------------------------------------------
    // File plumbing
    // ------------------------------------------------------------------

    fn read<T: DeserializeOwned>(&self, name: &str) -> Result<Vec<T>> {
        let _guard = self.lock.lock().map_err(|_| poisoned())?;
        self.read_unlocked(name)
    }

    fn read_unlocked<T: DeserializeOwned>(&self, name: &str) -> Result<Vec<T>> {
        let path = self.dir.join(name);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path)?;
        let file: StoreFile<T> = serde_json::from_str(&content)?;
        if file.version != STORE_VERSION {
            return Err(Error::DeserializationError(format!(
                "{} has version {}, expected {}",
                path.display(),
                file.version,
                STORE_VERSION
            )));
        }
        Ok(file.records)
    }

    fn update<T, F>(&self, name: &str, mutate: F) -> Result<()>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut Vec<T>),
    {
        let _guard = self.lock.lock().map_err(|_| poisoned())?;
        let mut records = self.read_unlocked::<T>(name)?;
        mutate(&mut records);

        let file = StoreFile {
            version: STORE_VERSION,
            records,
        };
        let json = serde_json::to_string_pretty(&file)?;
        let path = self.dir.join(name);
        let tmp = self.dir.join(format!("{name}.tmp"));
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

fn poisoned() -> Error {
    Error::Io("store lock poisoned".into())
}
