//! Minimal Solidity ABI codec.
//!
//! Covers exactly the shapes the engine emits: delegation tuples for
//! `redeemDelegations`, caveat group encodings, ERC-20 calls, and the
//! enforcer view calls used for revocation and call-count checks.

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};

use crate::error::{Error, Result};

const WORD: usize = 32;

/// An ABI value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Address(Address),
    Uint(U256),
    Bool(bool),
    /// `bytes32`
    FixedBytes(B256),
    /// `bytes`
    Bytes(Vec<u8>),
    /// `T[]` (dynamically sized)
    Array(Vec<Token>),
    Tuple(Vec<Token>),
}

impl Token {
    pub fn uint(value: u64) -> Self {
        Token::Uint(U256::from(value))
    }

    pub fn bytes(value: impl AsRef<[u8]>) -> Self {
        Token::Bytes(value.as_ref().to_vec())
    }

    fn is_dynamic(&self) -> bool {
        match self {
            Token::Bytes(_) | Token::Array(_) => true,
            Token::Tuple(items) => items.iter().any(Token::is_dynamic),
            _ => false,
        }
    }

    /// Size of the head slot for a static token.
    fn head_len(&self) -> usize {
        match self {
            Token::Tuple(items) if !self.is_dynamic() => items.iter().map(Token::head_len).sum(),
            _ => WORD,
        }
    }
}

/// First four bytes of `keccak256(signature)`.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    let mut out = [0u8; 4];
    out.copy_from_slice(&hash[..4]);
    out
}

/// `abi.encode(tokens...)`
pub fn encode(tokens: &[Token]) -> Vec<u8> {
    encode_sequence(tokens)
}

/// Selector followed by `abi.encode(args...)`.
pub fn encode_call(signature: &str, args: &[Token]) -> Bytes {
    let mut out = selector(signature).to_vec();
    out.extend(encode_sequence(args));
    Bytes::from(out)
}

fn encode_sequence(tokens: &[Token]) -> Vec<u8> {
    let heads_len: usize = tokens
        .iter()
        .map(|t| if t.is_dynamic() { WORD } else { t.head_len() })
        .sum();

    let mut heads = Vec::with_capacity(heads_len);
    let mut tails = Vec::new();
    for token in tokens {
        if token.is_dynamic() {
            heads.extend_from_slice(&word_u256(U256::from(heads_len + tails.len())));
            tails.extend(encode_single(token));
        } else {
            heads.extend(encode_single(token));
        }
    }
    heads.extend(tails);
    heads
}

fn encode_single(token: &Token) -> Vec<u8> {
    match token {
        Token::Address(address) => word_address(*address).to_vec(),
        Token::Uint(value) => word_u256(*value).to_vec(),
        Token::Bool(flag) => word_u256(U256::from(u8::from(*flag))).to_vec(),
        Token::FixedBytes(value) => value.to_vec(),
        Token::Bytes(data) => {
            let mut out = word_u256(U256::from(data.len())).to_vec();
            out.extend_from_slice(data);
            out.resize(out.len() + padding(data.len()), 0);
            out
        }
        Token::Array(items) => {
            let mut out = word_u256(U256::from(items.len())).to_vec();
            out.extend(encode_sequence(items));
            out
        }
        Token::Tuple(items) => encode_sequence(items),
    }
}

fn padding(len: usize) -> usize {
    (WORD - len % WORD) % WORD
}

/// Left-padded 32-byte word for a uint.
pub fn word_u256(value: U256) -> [u8; 32] {
    value.to_be_bytes::<32>()
}

/// Left-padded 32-byte word for an address.
pub fn word_address(address: Address) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[12..].copy_from_slice(address.as_slice());
    out
}

/// Read the `index`-th 32-byte word of return data as a uint.
pub fn decode_uint(data: &[u8], index: usize) -> Result<U256> {
    let start = index * WORD;
    let word = data.get(start..start + WORD).ok_or_else(|| Error::UnexpectedResponse {
        context: "abi".into(),
        detail: format!(
            "return data has {} bytes, need word {} ({} bytes)",
            data.len(),
            index,
            start + WORD
        ),
    })?;
    Ok(U256::from_be_slice(word))
}

/// Read the `index`-th 32-byte word of return data as an address.
pub fn decode_address(data: &[u8], index: usize) -> Result<Address> {
    let value = decode_uint(data, index)?;
    let bytes = value.to_be_bytes::<32>();
    if bytes[..12].iter().any(|b| *b != 0) {
        return Err(Error::UnexpectedResponse {
            context: "abi".into(),
            detail: "address word has non-zero high bytes".into(),
        });
    }
    Ok(Address::from_slice(&bytes[12..]))
}

/// Parse a `0x`-prefixed hex blob.
pub fn parse_hex_blob(raw: &str, field: &str) -> Result<Vec<u8>> {
    let trimmed = raw.trim();
    let without_prefix = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .ok_or_else(|| Error::UnexpectedResponse {
            context: field.to_string(),
            detail: "expected 0x-prefixed hex".into(),
        })?;
    hex::decode(without_prefix).map_err(|e| Error::UnexpectedResponse {
        context: field.to_string(),
        detail: e.to_string(),
    })
}

/// Parse a `0x`-prefixed hex quantity (leading zeros stripped, as JSON-RPC returns).
pub fn parse_hex_quantity(raw: &str, field: &str) -> Result<U256> {
    let trimmed = raw.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .ok_or_else(|| Error::UnexpectedResponse {
            context: field.to_string(),
            detail: format!("{trimmed:?} is not 0x-prefixed"),
        })?;
    if digits.is_empty() {
        return Ok(U256::ZERO);
    }
    U256::from_str_radix(digits, 16).map_err(|e| Error::UnexpectedResponse {
        context: field.to_string(),
        detail: e.to_string(),
    })
}

/// Format a quantity the way JSON-RPC expects (`0x0`, `0x1a`, ...).
pub fn to_hex_quantity(value: U256) -> String {
    format!("0x{value:x}")
}
