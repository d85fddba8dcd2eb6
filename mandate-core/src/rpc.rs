//! JSON-RPC 2.0 transport and chain reads.
//!
//! [`HttpJsonRpc`] speaks to nodes, bundlers and paymasters alike. HTTP
//! statuses, transport failures and JSON-RPC error objects are mapped onto
//! [`Error`] variants so the retry layer can tell transient failures apart.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, Bytes, U256};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::abi::{self, Token};
use crate::error::{Error, Result};
use crate::retry::RetryExecutor;

/// Sends one JSON-RPC request and returns its `result`.
#[async_trait]
pub trait JsonRpcTransport: Send + Sync {
    async fn request(&self, method: &str, params: Value) -> Result<Value>;
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// HTTP JSON-RPC client.
#[derive(Debug)]
pub struct HttpJsonRpc {
    client: Client,
    url: String,
    next_id: AtomicU64,
}

impl HttpJsonRpc {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::ConfigurationError(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl JsonRpcTransport for HttpJsonRpc {
    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });

        debug!(method, id, url = %self.url, "json-rpc request");

        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "<no body>".to_string());
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: RpcResponse = response.json().await?;
        if let Some(err) = parsed.error {
            return Err(Error::Rpc {
                method: method.to_string(),
                code: err.code,
                message: err.message,
            });
        }
        Ok(parsed.result.unwrap_or(Value::Null))
    }
}

/// Read-only chain state.
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// `eth_call` against the latest block.
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes>;

    /// `eth_getCode`
    async fn code(&self, address: Address) -> Result<Bytes>;

    /// `eth_getBalance`
    async fn balance(&self, address: Address) -> Result<U256>;
}

/// [`ChainReader`] over a JSON-RPC node. Reads are idempotent, so each
/// one runs under the retry policy.
#[derive(Clone)]
pub struct RpcChainReader {
    transport: Arc<dyn JsonRpcTransport>,
    retry: RetryExecutor,
}

impl RpcChainReader {
    pub fn new(transport: Arc<dyn JsonRpcTransport>, retry: RetryExecutor) -> Self {
        Self { transport, retry }
    }

    async fn hex_result(&self, method: &str, params: Value) -> Result<String> {
        let transport = &self.transport;
        let value = self
            .retry
            .run(method, move |_| transport.request(method, params.clone()))
            .await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::UnexpectedResponse {
                context: method.to_string(),
                detail: format!("expected hex string, got {value}"),
            })
    }
}

#[async_trait]
impl ChainReader for RpcChainReader {
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes> {
        let raw = self
            .hex_result("eth_call", json!([{ "to": to, "data": data }, "latest"]))
            .await?;
        Ok(Bytes::from(abi::parse_hex_blob(&raw, "eth_call")?))
    }

    async fn code(&self, address: Address) -> Result<Bytes> {
        let raw = self
            .hex_result("eth_getCode", json!([address, "latest"]))
            .await?;
        Ok(Bytes::from(abi::parse_hex_blob(&raw, "eth_getCode")?))
    }

    async fn balance(&self, address: Address) -> Result<U256> {
        let raw = self
            .hex_result("eth_getBalance", json!([address, "latest"]))
            .await?;
        abi::parse_hex_quantity(&raw, "eth_getBalance")
    }
}

/// `token.allowance(owner, spender)`
pub async fn erc20_allowance(
    reader: &dyn ChainReader,
    token: Address,
    owner: Address,
    spender: Address,
) -> Result<U256> {
    let data = abi::encode_call(
        "allowance(address,address)",
        &[Token::Address(owner), Token::Address(spender)],
    );
    let out = reader.call(token, data).await?;
    abi::decode_uint(&out, 0)
}

/// `token.balanceOf(owner)`
pub async fn erc20_balance(
    reader: &dyn ChainReader,
    token: Address,
    owner: Address,
) -> Result<U256> {
    let data = abi::encode_call("balanceOf(address)", &[Token::Address(owner)]);
    let out = reader.call(token, data).await?;
    abi::decode_uint(&out, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Replays canned results and records every request.
    struct Scripted {
        results: Mutex<Vec<Result<Value>>>,
        seen: Mutex<Vec<(String, Value)>>,
    }

    impl Scripted {
        fn new(mut results: Vec<Result<Value>>) -> Self {
            results.reverse();
            Self {
                results: Mutex::new(results),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl JsonRpcTransport for Scripted {
        async fn request(&self, method: &str, params: Value) -> Result<Value> {
            self.seen.lock().unwrap().push((method.to_string(), params));
            self.results
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(Error::Io("script exhausted".into())))
        }
    }

    fn fast_retry() -> RetryExecutor {
        RetryExecutor::new(crate::retry::RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            exponential: false,
            classifier: Error::is_transient,
        })
    }

    #[tokio::test]
    async fn test_balance_retries_rate_limit() {
        let transport = Arc::new(Scripted::new(vec![
            Err(Error::HttpStatus {
                status: 429,
                message: "slow down".into(),
            }),
            Ok(json!("0xde0b6b3a7640000")),
        ]));
        let reader = RpcChainReader::new(transport.clone(), fast_retry());
        let balance = reader.balance(Address::repeat_byte(1)).await.unwrap();
        assert_eq!(balance, U256::from(1_000_000_000_000_000_000u64));
        assert_eq!(transport.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_allowance_decodes_word() {
        let mut word = [0u8; 32];
        word[31] = 42;
        let transport = Arc::new(Scripted::new(vec![Ok(json!(format!(
            "0x{}",
            hex::encode(word)
        )))]));
        let reader = RpcChainReader::new(transport.clone(), fast_retry());
        let allowance = erc20_allowance(
            &reader,
            Address::repeat_byte(0x10),
            Address::repeat_byte(0x20),
            Address::repeat_byte(0x30),
        )
        .await
        .unwrap();
        assert_eq!(allowance, U256::from(42));

        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen[0].0, "eth_call");
        let data = seen[0].1[0]["data"].as_str().unwrap();
        assert!(data.starts_with("0xdd62ed3e"));
    }

    #[tokio::test]
    async fn test_non_string_result_is_internal() {
        let transport = Arc::new(Scripted::new(vec![Ok(json!({ "unexpected": true }))]));
        let reader = RpcChainReader::new(transport, fast_retry());
        let err = reader.code(Address::ZERO).await.unwrap_err();
        assert!(matches!(err, Error::UnexpectedResponse { .. }));
    }
}
