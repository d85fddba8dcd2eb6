//! Bundler and paymaster clients.
//!
//! The traits are the seam; [`PimlicoClient`] is the JSON-RPC
//! implementation. Everything except `eth_sendUserOperation` is idempotent
//! and runs under the retry policy.

use std::sync::Arc;

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::abi::{self, Token};
use crate::error::{Error, Result};
use crate::retry::RetryExecutor;
use crate::rpc::{ChainReader, JsonRpcTransport};
use crate::userop::{self, GasEstimate, GasFields, GasPrice, PaymasterFields, UserOperation};

/// Outcome of an included user operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserOperationReceipt {
    pub user_op_hash: B256,
    pub success: bool,
    pub tx_hash: Option<B256>,
    pub reason: Option<String>,
}

impl UserOperationReceipt {
    pub fn from_rpc(value: &Value) -> Result<Self> {
        let unexpected = |detail: &str| Error::UnexpectedResponse {
            context: "eth_getUserOperationReceipt".into(),
            detail: detail.to_string(),
        };
        let success = value
            .get("success")
            .and_then(Value::as_bool)
            .ok_or_else(|| unexpected("missing success flag"))?;
        let user_op_hash = match value.get("userOpHash").and_then(Value::as_str) {
            Some(raw) => parse_b256(raw, "userOpHash")?,
            None => B256::ZERO,
        };
        let tx_hash = value
            .get("receipt")
            .and_then(|r| r.get("transactionHash"))
            .and_then(Value::as_str)
            .map(|raw| parse_b256(raw, "transactionHash"))
            .transpose()?;
        let reason = value
            .get("reason")
            .and_then(Value::as_str)
            .filter(|r| !r.is_empty() && *r != "0x")
            .map(str::to_string);
        Ok(Self {
            user_op_hash,
            success,
            tx_hash,
            reason,
        })
    }
}

/// Paymaster response: who pays plus the gas the paymaster signed over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sponsorship {
    pub paymaster: PaymasterFields,
    pub gas: GasFields,
}

#[async_trait]
pub trait BundlerClient: Send + Sync {
    /// Current fast-tier fee caps.
    async fn gas_price(&self) -> Result<GasPrice>;

    async fn estimate_gas(&self, op: &UserOperation) -> Result<GasEstimate>;

    /// Submit. Returns the user operation hash. Never retried.
    async fn send(&self, op: &UserOperation) -> Result<B256>;

    /// `None` while the operation is pending.
    async fn receipt(&self, user_op_hash: B256) -> Result<Option<UserOperationReceipt>>;
}

#[async_trait]
pub trait PaymasterClient: Send + Sync {
    async fn sponsor(&self, op: &UserOperation) -> Result<Sponsorship>;
}

/// Pimlico-flavoured JSON-RPC bundler and paymaster.
#[derive(Clone)]
pub struct PimlicoClient {
    transport: Arc<dyn JsonRpcTransport>,
    entry_point: Address,
    retry: RetryExecutor,
}

impl PimlicoClient {
    pub fn new(
        transport: Arc<dyn JsonRpcTransport>,
        entry_point: Address,
        retry: RetryExecutor,
    ) -> Self {
        Self {
            transport,
            entry_point,
            retry,
        }
    }

    pub fn entry_point(&self) -> Address {
        self.entry_point
    }

    async fn idempotent(&self, method: &'static str, params: Value) -> Result<Value> {
        let transport = &self.transport;
        self.retry
            .run(method, move |_| transport.request(method, params.clone()))
            .await
    }
}

#[async_trait]
impl BundlerClient for PimlicoClient {
    async fn gas_price(&self) -> Result<GasPrice> {
        let value = self
            .idempotent("pimlico_getUserOperationGasPrice", json!([]))
            .await?;
        let tier = value
            .get("fast")
            .or_else(|| value.get("standard"))
            .ok_or_else(|| Error::UnexpectedResponse {
                context: "pimlico_getUserOperationGasPrice".into(),
                detail: "no fast or standard tier".into(),
            })?;
        let field = |name: &str| -> Result<U256> {
            let raw = tier.get(name).and_then(Value::as_str).ok_or_else(|| {
                Error::UnexpectedResponse {
                    context: "pimlico_getUserOperationGasPrice".into(),
                    detail: format!("missing {name}"),
                }
            })?;
            abi::parse_hex_quantity(raw, name)
        };
        Ok(GasPrice {
            max_fee_per_gas: field("maxFeePerGas")?,
            max_priority_fee_per_gas: field("maxPriorityFeePerGas")?,
        })
    }

    async fn estimate_gas(&self, op: &UserOperation) -> Result<GasEstimate> {
        let value = self
            .idempotent(
                "eth_estimateUserOperationGas",
                json!([op.to_rpc(), self.entry_point]),
            )
            .await?;
        GasEstimate::from_rpc(&value)
    }

    async fn send(&self, op: &UserOperation) -> Result<B256> {
        let value = self
            .transport
            .request("eth_sendUserOperation", json!([op.to_rpc(), self.entry_point]))
            .await?;
        let raw = value.as_str().ok_or_else(|| Error::UnexpectedResponse {
            context: "eth_sendUserOperation".into(),
            detail: format!("expected hash, got {value}"),
        })?;
        let hash = parse_b256(raw, "eth_sendUserOperation")?;
        debug!(sender = %op.sender, user_op_hash = %hash, "user operation sent");
        Ok(hash)
    }

    async fn receipt(&self, user_op_hash: B256) -> Result<Option<UserOperationReceipt>> {
        let value = self
            .idempotent("eth_getUserOperationReceipt", json!([user_op_hash]))
            .await?;
        if value.is_null() {
            return Ok(None);
        }
        UserOperationReceipt::from_rpc(&value).map(Some)
    }
}

#[async_trait]
impl PaymasterClient for PimlicoClient {
    async fn sponsor(&self, op: &UserOperation) -> Result<Sponsorship> {
        let value = self
            .idempotent(
                "pm_sponsorUserOperation",
                json!([op.to_rpc(), self.entry_point]),
            )
            .await?;
        Ok(Sponsorship {
            paymaster: PaymasterFields::from_rpc(&value)?,
            gas: userop::sponsored_gas(&value)?,
        })
    }
}

/// `EntryPoint.getNonce(sender, key)`
pub async fn entry_point_nonce(
    reader: &dyn ChainReader,
    entry_point: Address,
    sender: Address,
    key: U256,
) -> Result<U256> {
    let data = abi::encode_call(
        "getNonce(address,uint192)",
        &[Token::Address(sender), Token::Uint(key)],
    );
    let out = reader.call(entry_point, data).await?;
    abi::decode_uint(&out, 0)
}

fn parse_b256(raw: &str, field: &str) -> Result<B256> {
    raw.parse::<B256>().map_err(|e| Error::UnexpectedResponse {
        context: field.to_string(),
        detail: e.to_string(),
    })
}
