//! Executions and the `redeemDelegations` call that carries them.

use alloy_primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};

use crate::abi::{self, Token};
use crate::delegation::{DelegationChain, SelectionContext};
use crate::error::{Error, Result};

pub const REDEEM_DELEGATIONS_SIGNATURE: &str = "redeemDelegations(bytes[],bytes32[],bytes[])";

/// Smart account `execute(address,uint256,bytes)`.
pub const ACCOUNT_EXECUTE_SIGNATURE: &str = "execute(address,uint256,bytes)";

/// A single call made on behalf of the delegator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub target: Address,
    pub value: U256,
    pub call_data: Bytes,
}

impl Execution {
    pub fn new(target: Address, value: U256, call_data: impl Into<Bytes>) -> Self {
        Self {
            target,
            value,
            call_data: call_data.into(),
        }
    }

    /// `token.approve(spender, amount)`
    pub fn erc20_approve(token: Address, spender: Address, amount: U256) -> Self {
        Self::new(
            token,
            U256::ZERO,
            abi::encode_call(
                "approve(address,uint256)",
                &[Token::Address(spender), Token::Uint(amount)],
            ),
        )
    }

    /// `token.transfer(recipient, amount)`
    pub fn erc20_transfer(token: Address, recipient: Address, amount: U256) -> Self {
        Self::new(
            token,
            U256::ZERO,
            abi::encode_call(
                "transfer(address,uint256)",
                &[Token::Address(recipient), Token::Uint(amount)],
            ),
        )
    }

    /// Plain value transfer.
    pub fn native_transfer(recipient: Address, amount: U256) -> Self {
        Self::new(recipient, amount, Bytes::new())
    }

    fn to_token(&self) -> Token {
        Token::Tuple(vec![
            Token::Address(self.target),
            Token::Uint(self.value),
            Token::Bytes(self.call_data.to_vec()),
        ])
    }

    /// `abi.encodePacked(target, value, callData)`
    fn encode_packed(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(20 + 32 + self.call_data.len());
        out.extend_from_slice(self.target.as_slice());
        out.extend_from_slice(&abi::word_u256(self.value));
        out.extend_from_slice(&self.call_data);
        out
    }
}

/// ERC-7579 call type of a redemption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Single,
    Batch,
}

impl ExecutionMode {
    /// The `bytes32` mode word: call type in the first byte, default exec type.
    pub fn word(self) -> B256 {
        let mut out = [0u8; 32];
        if self == ExecutionMode::Batch {
            out[0] = 0x01;
        }
        B256::new(out)
    }

    pub fn for_executions(executions: &[Execution]) -> Self {
        if executions.len() == 1 {
            ExecutionMode::Single
        } else {
            ExecutionMode::Batch
        }
    }
}

/// Encode executions for the given mode.
pub fn encode_executions(mode: ExecutionMode, executions: &[Execution]) -> Result<Bytes> {
    match (mode, executions) {
        (_, []) => Err(Error::Validation("no executions to redeem".into())),
        (ExecutionMode::Single, [only]) => Ok(Bytes::from(only.encode_packed())),
        (ExecutionMode::Single, _) => Err(Error::Validation(
            "single mode carries exactly one execution".into(),
        )),
        (ExecutionMode::Batch, many) => Ok(Bytes::from(abi::encode(&[Token::Array(
            many.iter().map(Execution::to_token).collect(),
        )]))),
    }
}

/// Calldata for `DelegationManager.redeemDelegations` with one chain.
pub fn redeem_delegations_call(
    chain: &DelegationChain,
    selection: &SelectionContext,
    executions: &[Execution],
) -> Result<Bytes> {
    let mode = ExecutionMode::for_executions(executions);
    let context = chain.permission_context(selection)?;
    let calldata = encode_executions(mode, executions)?;
    Ok(abi::encode_call(
        REDEEM_DELEGATIONS_SIGNATURE,
        &[
            Token::Array(vec![Token::Bytes(context.to_vec())]),
            Token::Array(vec![Token::FixedBytes(mode.word())]),
            Token::Array(vec![Token::Bytes(calldata.to_vec())]),
        ],
    ))
}

/// Calldata for a smart account to run `execution` itself.
pub fn account_execute_call(execution: &Execution) -> Bytes {
    abi::encode_call(
        ACCOUNT_EXECUTE_SIGNATURE,
        &[
            Token::Address(execution.target),
            Token::Uint(execution.value),
            Token::Bytes(execution.call_data.to_vec()),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_is_packed() {
        let exec = Execution::erc20_transfer(
            Address::repeat_byte(0x10),
            Address::repeat_byte(0x20),
            U256::from(5),
        );
        let encoded = encode_executions(ExecutionMode::Single, &[exec.clone()]).unwrap();
        assert_eq!(encoded.len(), 20 + 32 + exec.call_data.len());
        assert_eq!(&encoded[..20], exec.target.as_slice());
    }

    #[test]
    fn test_batch_mode_word() {
        assert_eq!(ExecutionMode::Single.word(), B256::ZERO);
        assert_eq!(ExecutionMode::Batch.word()[0], 0x01);
        assert!(ExecutionMode::Batch.word()[1..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_mode_selection() {
        let exec = Execution::native_transfer(Address::repeat_byte(1), U256::from(1));
        assert_eq!(ExecutionMode::for_executions(&[exec.clone()]), ExecutionMode::Single);
        assert_eq!(
            ExecutionMode::for_executions(&[exec.clone(), exec.clone()]),
            ExecutionMode::Batch
        );
        assert!(encode_executions(ExecutionMode::Single, &[exec.clone(), exec]).is_err());
        assert!(encode_executions(ExecutionMode::Batch, &[]).is_err());
    }

    #[test]
    fn test_approve_calldata() {
        let exec = Execution::erc20_approve(
            Address::repeat_byte(0x10),
            Address::repeat_byte(0x20),
            U256::MAX,
        );
        assert_eq!(&exec.call_data[..4], &[0x09, 0x5e, 0xa7, 0xb3]);
        assert_eq!(abi::decode_uint(&exec.call_data[4..], 1).unwrap(), U256::MAX);
    }

    #[test]
    fn test_account_execute_selector() {
        let exec = Execution::native_transfer(Address::repeat_byte(1), U256::from(1));
        let data = account_execute_call(&exec);
        assert_eq!(&data[..4], &abi::selector(ACCOUNT_EXECUTE_SIGNATURE));
    }
}
