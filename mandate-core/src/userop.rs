//! ERC-4337 (entry point v0.7) user operations.
//!
//! Covers the operation shape, its hash, its JSON-RPC form, paymaster field
//! normalization and the gas floor function.

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::abi::{self, Token};
use crate::error::{Error, Result};

/// Default `callGasLimit` floor.
pub const DEFAULT_CALL_GAS_FLOOR: u64 = 100_000;

/// Default `verificationGasLimit` floor. Passkey verification is expensive.
pub const DEFAULT_VERIFICATION_GAS_FLOOR: u64 = 500_000;

/// Default `preVerificationGas` floor.
pub const DEFAULT_PRE_VERIFICATION_GAS_FLOOR: u64 = 60_000;

/// The three gas limits a sponsor signs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasFields {
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
}

impl GasFields {
    pub fn new(call: u64, verification: u64, pre_verification: u64) -> Self {
        Self {
            call_gas_limit: U256::from(call),
            verification_gas_limit: U256::from(verification),
            pre_verification_gas: U256::from(pre_verification),
        }
    }

    pub fn any_zero(&self) -> bool {
        self.call_gas_limit.is_zero()
            || self.verification_gas_limit.is_zero()
            || self.pre_verification_gas.is_zero()
    }

    /// Fill zero fields from an estimate. Non-zero fields are kept.
    pub fn fill_zeros(self, estimate: &GasEstimate) -> Self {
        let pick = |current: U256, estimated: Option<U256>| {
            if current.is_zero() {
                estimated.unwrap_or(current)
            } else {
                current
            }
        };
        Self {
            call_gas_limit: pick(self.call_gas_limit, estimate.call_gas_limit),
            verification_gas_limit: pick(
                self.verification_gas_limit,
                estimate.verification_gas_limit,
            ),
            pre_verification_gas: pick(self.pre_verification_gas, estimate.pre_verification_gas),
        }
    }
}

/// Minimum gas limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasFloors {
    pub call_gas_limit: u64,
    pub verification_gas_limit: u64,
    pub pre_verification_gas: u64,
}

impl Default for GasFloors {
    fn default() -> Self {
        Self {
            call_gas_limit: DEFAULT_CALL_GAS_FLOOR,
            verification_gas_limit: DEFAULT_VERIFICATION_GAS_FLOOR,
            pre_verification_gas: DEFAULT_PRE_VERIFICATION_GAS_FLOOR,
        }
    }
}

/// Clamp every field up to its floor. Returns the clamped fields and
/// whether anything changed. Applying it twice changes nothing the second
/// time.
pub fn apply_gas_floors(gas: GasFields, floors: &GasFloors) -> (GasFields, bool) {
    let clamped = GasFields {
        call_gas_limit: gas.call_gas_limit.max(U256::from(floors.call_gas_limit)),
        verification_gas_limit: gas
            .verification_gas_limit
            .max(U256::from(floors.verification_gas_limit)),
        pre_verification_gas: gas
            .pre_verification_gas
            .max(U256::from(floors.pre_verification_gas)),
    };
    (clamped, clamped != gas)
}

/// Bundler gas estimate. Any field may be missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GasEstimate {
    pub call_gas_limit: Option<U256>,
    pub verification_gas_limit: Option<U256>,
    pub pre_verification_gas: Option<U256>,
}

impl GasEstimate {
    pub fn from_rpc(value: &Value) -> Result<Self> {
        Ok(Self {
            call_gas_limit: optional_quantity(value, "callGasLimit")?,
            verification_gas_limit: optional_quantity(value, "verificationGasLimit")?,
            pre_verification_gas: optional_quantity(value, "preVerificationGas")?,
        })
    }
}

/// Fee caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasPrice {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

/// Paymaster fields in the split (v0.7) shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymasterFields {
    pub paymaster: Address,
    pub verification_gas_limit: U256,
    pub post_op_gas_limit: U256,
    pub data: Bytes,
}

impl PaymasterFields {
    /// Normalize a sponsor response carrying either `paymasterAndData` or
    /// `paymaster` + `paymasterData`.
    pub fn from_rpc(value: &Value) -> Result<Self> {
        if let Some(paymaster) = value.get("paymaster").and_then(Value::as_str) {
            let paymaster = parse_address(paymaster, "paymaster")?;
            let data = match value.get("paymasterData").and_then(Value::as_str) {
                Some(raw) => Bytes::from(abi::parse_hex_blob(raw, "paymasterData")?),
                None => Bytes::new(),
            };
            return Ok(Self {
                paymaster,
                verification_gas_limit: optional_quantity(value, "paymasterVerificationGasLimit")?
                    .unwrap_or_default(),
                post_op_gas_limit: optional_quantity(value, "paymasterPostOpGasLimit")?
                    .unwrap_or_default(),
                data,
            });
        }

        let raw = value
            .get("paymasterAndData")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::UnexpectedResponse {
                context: "pm_sponsorUserOperation".into(),
                detail: "response has neither paymaster nor paymasterAndData".into(),
            })?;
        Self::from_packed(&abi::parse_hex_blob(raw, "paymasterAndData")?)
    }

    /// `paymaster(20) ‖ verificationGasLimit(16) ‖ postOpGasLimit(16) ‖ data`
    pub fn from_packed(packed: &[u8]) -> Result<Self> {
        if packed.len() < 20 {
            return Err(Error::UnexpectedResponse {
                context: "paymasterAndData".into(),
                detail: format!("{} bytes is shorter than an address", packed.len()),
            });
        }
        let paymaster = Address::from_slice(&packed[..20]);
        if packed.len() < 52 {
            return Ok(Self {
                paymaster,
                verification_gas_limit: U256::ZERO,
                post_op_gas_limit: U256::ZERO,
                data: Bytes::from(packed[20..].to_vec()),
            });
        }
        Ok(Self {
            paymaster,
            verification_gas_limit: U256::from_be_slice(&packed[20..36]),
            post_op_gas_limit: U256::from_be_slice(&packed[36..52]),
            data: Bytes::from(packed[52..].to_vec()),
        })
    }

    pub fn packed(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(52 + self.data.len());
        out.extend_from_slice(self.paymaster.as_slice());
        out.extend_from_slice(&uint128_bytes(self.verification_gas_limit));
        out.extend_from_slice(&uint128_bytes(self.post_op_gas_limit));
        out.extend_from_slice(&self.data);
        out
    }
}

/// A v0.7 user operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    #[serde(default)]
    pub factory: Option<Address>,
    #[serde(default)]
    pub factory_data: Bytes,
    pub call_data: Bytes,
    pub gas: GasFields,
    pub fees: GasPrice,
    #[serde(default)]
    pub paymaster: Option<PaymasterFields>,
    #[serde(default)]
    pub signature: Bytes,
}

impl UserOperation {
    pub fn new(sender: Address, nonce: U256, call_data: Bytes) -> Self {
        Self {
            sender,
            nonce,
            factory: None,
            factory_data: Bytes::new(),
            call_data,
            gas: GasFields::default(),
            fees: GasPrice::default(),
            paymaster: None,
            signature: Bytes::new(),
        }
    }

    pub fn with_factory(mut self, factory: Address, factory_data: Bytes) -> Self {
        self.factory = Some(factory);
        self.factory_data = factory_data;
        self
    }

    fn init_code(&self) -> Vec<u8> {
        match self.factory {
            Some(factory) => {
                let mut out = factory.to_vec();
                out.extend_from_slice(&self.factory_data);
                out
            }
            None => Vec::new(),
        }
    }

    fn paymaster_and_data(&self) -> Vec<u8> {
        self.paymaster
            .as_ref()
            .map(PaymasterFields::packed)
            .unwrap_or_default()
    }

    /// The hash the account's signer signs. Excludes the signature.
    pub fn hash(&self, entry_point: Address, chain_id: u64) -> B256 {
        let account_gas_limits =
            pack_u128_pair(self.gas.verification_gas_limit, self.gas.call_gas_limit);
        let gas_fees =
            pack_u128_pair(self.fees.max_priority_fee_per_gas, self.fees.max_fee_per_gas);
        let packed = abi::encode(&[
            Token::Address(self.sender),
            Token::Uint(self.nonce),
            Token::FixedBytes(keccak256(self.init_code())),
            Token::FixedBytes(keccak256(&self.call_data)),
            Token::FixedBytes(account_gas_limits),
            Token::Uint(self.gas.pre_verification_gas),
            Token::FixedBytes(gas_fees),
            Token::FixedBytes(keccak256(self.paymaster_and_data())),
        ]);
        keccak256(abi::encode(&[
            Token::FixedBytes(keccak256(packed)),
            Token::Address(entry_point),
            Token::Uint(U256::from(chain_id)),
        ]))
    }

    /// Unpacked JSON form accepted by v0.7 bundlers.
    pub fn to_rpc(&self) -> Value {
        let q = abi::to_hex_quantity;
        let mut map = Map::new();
        map.insert("sender".into(), json!(self.sender));
        map.insert("nonce".into(), json!(q(self.nonce)));
        if let Some(factory) = self.factory {
            map.insert("factory".into(), json!(factory));
            map.insert("factoryData".into(), json!(self.factory_data));
        }
        map.insert("callData".into(), json!(self.call_data));
        map.insert("callGasLimit".into(), json!(q(self.gas.call_gas_limit)));
        map.insert(
            "verificationGasLimit".into(),
            json!(q(self.gas.verification_gas_limit)),
        );
        map.insert(
            "preVerificationGas".into(),
            json!(q(self.gas.pre_verification_gas)),
        );
        map.insert("maxFeePerGas".into(), json!(q(self.fees.max_fee_per_gas)));
        map.insert(
            "maxPriorityFeePerGas".into(),
            json!(q(self.fees.max_priority_fee_per_gas)),
        );
        if let Some(pm) = &self.paymaster {
            map.insert("paymaster".into(), json!(pm.paymaster));
            map.insert(
                "paymasterVerificationGasLimit".into(),
                json!(q(pm.verification_gas_limit)),
            );
            map.insert(
                "paymasterPostOpGasLimit".into(),
                json!(q(pm.post_op_gas_limit)),
            );
            map.insert("paymasterData".into(), json!(pm.data));
        }
        map.insert("signature".into(), json!(self.signature));
        Value::Object(map)
    }
}

fn uint128_bytes(value: U256) -> [u8; 16] {
    let word = value.to_be_bytes::<32>();
    let mut out = [0u8; 16];
    out.copy_from_slice(&word[16..]);
    out
}

/// `uint128(high) << 128 | uint128(low)`
fn pack_u128_pair(high: U256, low: U256) -> B256 {
    let mut out = [0u8; 32];
    out[..16].copy_from_slice(&uint128_bytes(high));
    out[16..].copy_from_slice(&uint128_bytes(low));
    B256::new(out)
}

fn optional_quantity(value: &Value, field: &str) -> Result<Option<U256>> {
    match value.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(raw)) => abi::parse_hex_quantity(raw, field).map(Some),
        Some(other) => Err(Error::UnexpectedResponse {
            context: field.to_string(),
            detail: format!("expected hex quantity, got {other}"),
        }),
    }
}

fn parse_address(raw: &str, field: &str) -> Result<Address> {
    raw.parse::<Address>().map_err(|e| Error::UnexpectedResponse {
        context: field.to_string(),
        detail: e.to_string(),
    })
}

/// Read the optional gas fields of a sponsor response.
pub fn sponsored_gas(value: &Value) -> Result<GasFields> {
    Ok(GasFields {
        call_gas_limit: optional_quantity(value, "callGasLimit")?.unwrap_or_default(),
        verification_gas_limit: optional_quantity(value, "verificationGasLimit")?
            .unwrap_or_default(),
        pre_verification_gas: optional_quantity(value, "preVerificationGas")?.unwrap_or_default(),
    })
}
