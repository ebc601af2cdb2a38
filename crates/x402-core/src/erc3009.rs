//! On-chain EIP-3009 token operations.

use alloy::primitives::{Address, TxHash, B256, U256};
use alloy::providers::Provider;

use crate::error::PaymentError;
use crate::Eip3009Token;

/// Query the token balance of `owner`.
pub async fn balance_of<P: Provider>(
    provider: &P,
    token: Address,
    owner: Address,
) -> Result<U256, PaymentError> {
    let contract = Eip3009Token::new(token, provider);
    let balance = contract
        .balanceOf(owner)
        .call()
        .await
        .map_err(|e| PaymentError::ChainError(format!("balanceOf failed: {e}")))?;
    Ok(balance)
}

/// Outcome of a mined `transferWithAuthorization`.
#[derive(Debug, Clone)]
pub struct SettledTransfer {
    pub tx_hash: TxHash,
    pub block_number: Option<u64>,
}

/// Execute `transferWithAuthorization` and wait one confirmation.
///
/// Send and receipt waits are bounded; a hang here would pin the caller's
/// nonce claim until its pending TTL expires.
#[allow(clippy::too_many_arguments)]
pub async fn transfer_with_authorization<P: Provider>(
    provider: &P,
    token: Address,
    from: Address,
    to: Address,
    value: U256,
    valid_after: U256,
    valid_before: U256,
    nonce: B256,
    v: u8,
    r: B256,
    s: B256,
) -> Result<SettledTransfer, PaymentError> {
    let contract = Eip3009Token::new(token, provider);
    let call = contract.transferWithAuthorization(
        from,
        to,
        value,
        valid_after,
        valid_before,
        nonce,
        v,
        r,
        s,
    );

    let pending = tokio::time::timeout(std::time::Duration::from_secs(30), call.send())
        .await
        .map_err(|_| {
            PaymentError::ChainError("transferWithAuthorization send timed out after 30s".to_string())
        })?
        .map_err(|e| PaymentError::ChainError(format!("transferWithAuthorization send failed: {e}")))?;

    let receipt = tokio::time::timeout(std::time::Duration::from_secs(60), pending.get_receipt())
        .await
        .map_err(|_| {
            PaymentError::ChainError(
                "transferWithAuthorization receipt timed out after 60s".to_string(),
            )
        })?
        .map_err(|e| {
            PaymentError::ChainError(format!("transferWithAuthorization receipt failed: {e}"))
        })?;

    if !receipt.status() {
        return Err(PaymentError::ChainError(
            "transferWithAuthorization reverted".to_string(),
        ));
    }

    Ok(SettledTransfer {
        tx_hash: receipt.transaction_hash,
        block_number: receipt.block_number,
    })
}
