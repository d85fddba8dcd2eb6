//! EIP-712 domain separation for delegation signatures.
//!
//! Delegations are signed as typed data under the delegation manager's
//! domain. A signature for one chain or one manager deployment cannot be
//! replayed against another because the domain separator binds both.

use alloy_primitives::{keccak256, Address, B256, U256};

use crate::abi::{self, Token};

/// EIP-712 domain name of the delegation manager.
pub const DOMAIN_NAME: &str = "DelegationManager";

/// EIP-712 domain version of the delegation manager.
pub const DOMAIN_VERSION: &str = "1";

pub const EIP712_DOMAIN_TYPE: &str =
    "EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)";

/// Encoded type of a delegation, with its referenced `Caveat` type appended.
pub const DELEGATION_TYPE: &str = concat!(
    "Delegation(address delegate,address delegator,bytes32 authority,Caveat[] caveats,uint256 salt)",
    "Caveat(address enforcer,bytes terms)"
);

pub const CAVEAT_TYPE: &str = "Caveat(address enforcer,bytes terms)";

/// Authority value marking a delegation as the root of its chain.
pub const ROOT_AUTHORITY: B256 = B256::new([0xff; 32]);

pub fn delegation_typehash() -> B256 {
    keccak256(DELEGATION_TYPE.as_bytes())
}

pub fn caveat_typehash() -> B256 {
    keccak256(CAVEAT_TYPE.as_bytes())
}

/// Domain separator for a manager deployment on a chain.
pub fn domain_separator(chain_id: u64, delegation_manager: Address) -> B256 {
    keccak256(abi::encode(&[
        Token::FixedBytes(keccak256(EIP712_DOMAIN_TYPE.as_bytes())),
        Token::FixedBytes(keccak256(DOMAIN_NAME.as_bytes())),
        Token::FixedBytes(keccak256(DOMAIN_VERSION.as_bytes())),
        Token::Uint(U256::from(chain_id)),
        Token::Address(delegation_manager),
    ]))
}

/// `keccak256(0x1901 ‖ domainSeparator ‖ structHash)`
pub fn typed_data_digest(domain_separator: B256, struct_hash: B256) -> B256 {
    let mut preimage = Vec::with_capacity(2 + 64);
    preimage.extend_from_slice(&[0x19, 0x01]);
    preimage.extend_from_slice(domain_separator.as_slice());
    preimage.extend_from_slice(struct_hash.as_slice());
    keccak256(preimage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_binds_chain_and_manager() {
        let manager = Address::repeat_byte(0x42);
        let base = domain_separator(8453, manager);
        assert_ne!(base, domain_separator(1, manager));
        assert_ne!(base, domain_separator(8453, Address::repeat_byte(0x43)));
        assert_eq!(base, domain_separator(8453, manager));
    }

    #[test]
    fn test_digest_prefix_matters() {
        let domain = B256::repeat_byte(1);
        let a = typed_data_digest(domain, B256::repeat_byte(2));
        let b = typed_data_digest(domain, B256::repeat_byte(3));
        assert_ne!(a, b);
    }

    #[test]
    fn test_root_authority_is_all_ones() {
        assert!(ROOT_AUTHORITY.iter().all(|b| *b == 0xff));
    }
}
