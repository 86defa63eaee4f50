//! ERC-20 and account reads.

use alloy::primitives::{Address, Bytes, U256};
use alloy::sol;
use alloy::sol_types::SolCall;
use serde::{Deserialize, Serialize};

use crate::evm::rpc::{decode_return, JsonRpcTransport, RpcExt};
use crate::evm::types::EvmResult;

sol! {
    #[allow(missing_docs)]
    interface IERC20 {
        function transfer(address to, uint256 amount) external returns (bool);
        function balanceOf(address owner) external view returns (uint256);
        function decimals() external view returns (uint8);
        function symbol() external view returns (string);
        function name() external view returns (string);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub address: Address,
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

/// Calldata for `transfer(to, amount)`.
pub fn transfer_calldata(to: Address, amount: U256) -> Bytes {
    IERC20::transferCall { to, amount }.abi_encode().into()
}

pub async fn token_balance<R>(rpc: &R, token: Address, owner: Address) -> EvmResult<U256>
where
    R: JsonRpcTransport + ?Sized,
{
    let data: Bytes = IERC20::balanceOfCall { owner }.abi_encode().into();
    let result = rpc.call(token, &data).await?;
    Ok(decode_return(&result, "balanceOf")?)
}

pub async fn token_metadata<R>(rpc: &R, token: Address) -> EvmResult<TokenMetadata>
where
    R: JsonRpcTransport + ?Sized,
{
    let name = rpc.call(token, &IERC20::nameCall {}.abi_encode().into()).await?;
    let symbol = rpc.call(token, &IERC20::symbolCall {}.abi_encode().into()).await?;
    let decimals = rpc
        .call(token, &IERC20::decimalsCall {}.abi_encode().into())
        .await?;

    // uint8 is ABI-encoded as a full word.
    let decimals: U256 = decode_return(&decimals, "decimals")?;
    Ok(TokenMetadata {
        address: token,
        name: decode_return(&name, "name")?,
        symbol: decode_return(&symbol, "symbol")?,
        decimals: decimals.saturating_to::<u8>(),
    })
}

pub async fn native_balance<R>(rpc: &R, owner: Address) -> EvmResult<U256>
where
    R: JsonRpcTransport + ?Sized,
{
    Ok(rpc.balance(owner).await?)
}

/// Whether `address` has deployed code.
pub async fn is_contract<R>(rpc: &R, address: Address) -> EvmResult<bool>
where
    R: JsonRpcTransport + ?Sized,
{
    Ok(!rpc.code(address).await?.is_empty())
}
