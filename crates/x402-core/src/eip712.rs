//! EIP-712 typed-data machinery for EIP-3009 transfer authorizations.
//!
//! The signing domain is derived from the network's token metadata
//! (`{name, version, chainId, verifyingContract}`); verification recovers the
//! signer from the 65-byte compact signature and rejects high-s encodings.

use alloy::primitives::{Address, Signature, B256, U256};
use alloy::sol_types::SolStruct;

use crate::error::PaymentError;
use crate::network::NetworkDescriptor;
use crate::TransferWithAuthorization;

/// Build the EIP-712 domain for a network's settlement token.
pub fn payment_domain(
    network: &NetworkDescriptor,
) -> Result<alloy::sol_types::Eip712Domain, PaymentError> {
    let chain_id = network.chain_id.ok_or_else(|| {
        PaymentError::ConfigError(format!("network {} has no chain id", network.network_id))
    })?;
    let verifying_contract: Address = network.token.address.parse().map_err(|_| {
        PaymentError::ConfigError(format!("invalid token address {}", network.token.address))
    })?;
    Ok(alloy::sol_types::Eip712Domain {
        name: Some(std::borrow::Cow::Owned(network.token.display_name.clone())),
        version: Some(std::borrow::Cow::Owned(network.token.domain_version.clone())),
        chain_id: Some(U256::from(chain_id)),
        verifying_contract: Some(verifying_contract),
        salt: None,
    })
}

/// Compute the EIP-712 signing hash of an authorization on a network.
pub fn signing_hash(
    auth: &TransferWithAuthorization,
    network: &NetworkDescriptor,
) -> Result<B256, PaymentError> {
    Ok(auth.eip712_signing_hash(&payment_domain(network)?))
}

/// secp256k1 curve order N / 2. Signatures with s above this are malleable
/// (EIP-2) and rejected.
const SECP256K1_N_DIV_2: U256 = U256::from_limbs([
    0xBFD25E8CD0364140,
    0xBAAEDCE6AF48A03B,
    0xFFFFFFFFFFFFFFFE,
    0x7FFFFFFFFFFFFFFF,
]);

/// Decode a `0x`-prefixed hex signature into raw bytes.
pub fn decode_signature_hex(signature: &str) -> Result<Vec<u8>, PaymentError> {
    alloy::hex::decode(signature.strip_prefix("0x").unwrap_or(signature))
        .map_err(|e| PaymentError::SignatureError(format!("invalid hex signature: {e}")))
}

fn parse_signature(signature_bytes: &[u8]) -> Result<Signature, PaymentError> {
    if signature_bytes.len() != 65 {
        return Err(PaymentError::SignatureError(format!(
            "signature must be 65 bytes, got {}",
            signature_bytes.len()
        )));
    }
    let sig = Signature::from_raw(signature_bytes)
        .map_err(|e| PaymentError::SignatureError(format!("invalid signature: {e}")))?;
    if sig.s() > SECP256K1_N_DIV_2 {
        return Err(PaymentError::SignatureError(
            "high-s signature rejected (EIP-2 malleability)".to_string(),
        ));
    }
    Ok(sig)
}

/// Recover the signer of an authorization from its 65-byte signature.
pub fn recover_signer(
    auth: &TransferWithAuthorization,
    signature_bytes: &[u8],
    network: &NetworkDescriptor,
) -> Result<Address, PaymentError> {
    let sig = parse_signature(signature_bytes)?;
    let hash = signing_hash(auth, network)?;
    sig.recover_address_from_prehash(&hash)
        .map_err(|e| PaymentError::SignatureError(format!("recovery failed: {e}")))
}

/// Split a 65-byte signature into the (v, r, s) triple
/// `transferWithAuthorization` expects on-chain. v is Electrum notation.
pub fn split_signature(signature_bytes: &[u8]) -> Result<(u8, B256, B256), PaymentError> {
    let sig = parse_signature(signature_bytes)?;
    let v = if sig.v() { 28 } else { 27 };
    Ok((v, B256::from(sig.r()), B256::from(sig.s())))
}
