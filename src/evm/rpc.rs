//! JSON-RPC plumbing for EVM nodes.

use std::sync::atomic::{AtomicU64, Ordering};

use alloy::primitives::{hex, Address, Bytes, B256, U256};
use alloy::sol_types::{SolType, SolValue};
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::evm::types::RpcError;
use crate::http::HttpTransport;

/// Anything that can answer a JSON-RPC call.
#[async_trait]
pub trait JsonRpcTransport: Send + Sync {
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError>;
}

/// JSON-RPC 2.0 over an [`HttpTransport`].
pub struct HttpJsonRpc<T> {
    http: T,
    url: String,
    next_id: AtomicU64,
}

impl<T: HttpTransport> HttpJsonRpc<T> {
    pub fn new(http: T, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl<T: HttpTransport> JsonRpcTransport for HttpJsonRpc<T> {
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });

        let response = self.http.post_json(&self.url, &body).await?;
        let mut value: Value = response
            .json()
            .map_err(|e| RpcError::Malformed(format!("{}: {}", method, e)))?;

        if let Some(error) = value.get("error") {
            return Err(node_error(error));
        }
        match value.get_mut("result") {
            Some(result) => Ok(result.take()),
            None => Err(RpcError::Malformed(format!("{}: no result", method))),
        }
    }
}

fn node_error(error: &Value) -> RpcError {
    let data = match error.get("data") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    };
    RpcError::Node {
        code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
        message: error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string(),
        data,
    }
}

/// Parse a hex quantity (`"0x1a"`).
pub fn parse_u64(value: &Value) -> Result<u64, RpcError> {
    let s = value
        .as_str()
        .ok_or_else(|| RpcError::Malformed(format!("expected hex quantity, got {}", value)))?;
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(if digits.is_empty() { "0" } else { digits }, 16)
        .map_err(|e| RpcError::Malformed(format!("bad quantity {}: {}", s, e)))
}

pub fn parse_u256(value: &Value) -> Result<U256, RpcError> {
    let s = value
        .as_str()
        .ok_or_else(|| RpcError::Malformed(format!("expected hex quantity, got {}", value)))?;
    let digits = s.strip_prefix("0x").unwrap_or(s);
    U256::from_str_radix(if digits.is_empty() { "0" } else { digits }, 16)
        .map_err(|e| RpcError::Malformed(format!("bad quantity {}: {}", s, e)))
}

pub fn parse_bytes(value: &Value) -> Result<Bytes, RpcError> {
    let s = value
        .as_str()
        .ok_or_else(|| RpcError::Malformed(format!("expected hex data, got {}", value)))?;
    hex::decode(s)
        .map(Bytes::from)
        .map_err(|e| RpcError::Malformed(format!("bad hex data: {}", e)))
}

pub fn quantity(value: impl Into<U256>) -> String {
    format!("0x{:x}", value.into())
}

/// Decode the return data of an `eth_call`.
pub fn decode_return<T>(data: &Bytes, what: &str) -> Result<T, RpcError>
where
    T: SolValue + From<<T::SolType as SolType>::RustType>,
{
    T::abi_decode(data).map_err(|e| RpcError::Malformed(format!("{}: {}", what, e)))
}

/// Typed wrappers over the calls the engine uses.
#[async_trait]
pub trait RpcExt: JsonRpcTransport {
    async fn chain_id(&self) -> Result<u64, RpcError> {
        parse_u64(&self.request("eth_chainId", json!([])).await?)
    }

    async fn gas_price(&self) -> Result<u128, RpcError> {
        let price = parse_u256(&self.request("eth_gasPrice", json!([])).await?)?;
        u128::try_from(price).map_err(|_| RpcError::Malformed("gas price overflows u128".into()))
    }

    async fn block_number(&self) -> Result<u64, RpcError> {
        parse_u64(&self.request("eth_blockNumber", json!([])).await?)
    }

    /// Transaction count including pending transactions.
    async fn pending_nonce(&self, address: Address) -> Result<u64, RpcError> {
        parse_u64(
            &self
                .request("eth_getTransactionCount", json!([address, "pending"]))
                .await?,
        )
    }

    async fn balance(&self, address: Address) -> Result<U256, RpcError> {
        parse_u256(&self.request("eth_getBalance", json!([address, "latest"])).await?)
    }

    async fn code(&self, address: Address) -> Result<Bytes, RpcError> {
        parse_bytes(&self.request("eth_getCode", json!([address, "latest"])).await?)
    }

    async fn call(&self, to: Address, data: &Bytes) -> Result<Bytes, RpcError> {
        let tx = json!({ "to": to, "data": data });
        parse_bytes(&self.request("eth_call", json!([tx, "latest"])).await?)
    }

    async fn estimate_gas(
        &self,
        from: Address,
        to: Address,
        value: U256,
        data: &Bytes,
    ) -> Result<u64, RpcError> {
        let tx = json!({ "from": from, "to": to, "value": quantity(value), "data": data });
        parse_u64(&self.request("eth_estimateGas", json!([tx])).await?)
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<B256, RpcError> {
        let result = self
            .request("eth_sendRawTransaction", json!([hex::encode_prefixed(raw)]))
            .await?;
        result
            .as_str()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| RpcError::Malformed(format!("bad transaction hash: {}", result)))
    }

    /// `None` while the transaction is unmined.
    async fn transaction_receipt(&self, hash: B256) -> Result<Option<Value>, RpcError> {
        let receipt = self
            .request("eth_getTransactionReceipt", json!([hash]))
            .await?;
        Ok((!receipt.is_null()).then_some(receipt))
    }
}

impl<R: JsonRpcTransport + ?Sized> RpcExt for R {}
