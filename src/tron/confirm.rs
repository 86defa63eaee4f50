//! Confirmation polling for broadcast TRON transactions.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::{interval, timeout};

use crate::http::HttpTransport;
use crate::records::ConfirmationOutcome;
use crate::tron::client::ProtocolClient;
use crate::tron::normalize;
use crate::tron::types::TronResult;

impl<T: HttpTransport> ProtocolClient<T> {
    /// Poll until the transaction has an on-chain verdict or the configured
    /// timeout passes. Probe errors are logged and retried.
    pub async fn wait_for_confirmation(&self, gateway: &str, txid: &str) -> ConfirmationOutcome {
        let poll_interval = Duration::from_millis(self.polling.interval_ms);
        let deadline = Duration::from_secs(self.polling.confirmation_timeout_secs);

        let result = timeout(deadline, async {
            let mut ticker = interval(poll_interval);
            loop {
                ticker.tick().await;
                match self.check_confirmation(gateway, txid).await {
                    Ok(Some(outcome)) => return outcome,
                    Ok(None) => tracing::debug!(txid, "Transaction pending"),
                    Err(err) => tracing::debug!(txid, error = %err, "Confirmation probe failed"),
                }
            }
        })
        .await;

        result.unwrap_or_else(|_| {
            tracing::warn!(txid, "Confirmation not observed before timeout");
            ConfirmationOutcome::Unresolved
        })
    }

    /// One probe: transaction info (full node, then solidity node), then the
    /// transaction's own `ret` as a last resort. `None` means still pending.
    pub async fn check_confirmation(
        &self,
        gateway: &str,
        txid: &str,
    ) -> TronResult<Option<ConfirmationOutcome>> {
        let body = json!({ "value": txid });

        let mut info = self
            .call(gateway, "/wallet/gettransactioninfobyid", body.clone())
            .await?;
        if is_empty(&info) {
            info = self
                .call(gateway, "/walletsolidity/gettransactioninfobyid", body.clone())
                .await
                .unwrap_or(Value::Null);
        }

        if let Some(outcome) = outcome_from_info(&info) {
            return Ok(Some(outcome));
        }

        let tx = self.call(gateway, "/wallet/gettransactionbyid", body).await?;
        Ok(outcome_from_ret(&tx))
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn outcome_from_info(info: &Value) -> Option<ConfirmationOutcome> {
    let block_number = info.get("blockNumber").and_then(Value::as_u64);

    if let Some(result) = info.pointer("/receipt/result").and_then(Value::as_str) {
        return Some(if result == "SUCCESS" {
            ConfirmationOutcome::Confirmed { block_number }
        } else {
            ConfirmationOutcome::Failed {
                reason: failure_reason(result, info),
            }
        });
    }

    if info.get("result").and_then(Value::as_str) == Some("FAILED") {
        return Some(ConfirmationOutcome::Failed {
            reason: failure_reason("FAILED", info),
        });
    }

    block_number.map(|n| ConfirmationOutcome::Confirmed {
        block_number: Some(n),
    })
}

fn outcome_from_ret(tx: &Value) -> Option<ConfirmationOutcome> {
    match tx.pointer("/ret/0/contractRet").and_then(Value::as_str)? {
        "SUCCESS" => Some(ConfirmationOutcome::Confirmed { block_number: None }),
        other => Some(ConfirmationOutcome::Failed {
            reason: other.to_string(),
        }),
    }
}

fn failure_reason(result: &str, info: &Value) -> String {
    match info.get("resMessage").and_then(Value::as_str) {
        Some(message) => format!("{}: {}", result, normalize::decode_message(message)),
        None => result.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::http::{HttpResponse, TransportError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_receipt_success() {
        let info = json!({"blockNumber": 42, "receipt": {"result": "SUCCESS"}});
        assert_eq!(
            outcome_from_info(&info),
            Some(ConfirmationOutcome::Confirmed { block_number: Some(42) })
        );
    }

    #[test]
    fn test_receipt_failure_with_message() {
        let info = json!({
            "blockNumber": 42,
            "receipt": {"result": "REVERT"},
            // "no"
            "resMessage": "6e6f"
        });
        assert_eq!(
            outcome_from_info(&info),
            Some(ConfirmationOutcome::Failed { reason: "REVERT: no".into() })
        );
    }

    #[test]
    fn test_block_without_receipt_result() {
        let info = json!({"blockNumber": 7, "receipt": {"net_usage": 268}});
        assert_eq!(
            outcome_from_info(&info),
            Some(ConfirmationOutcome::Confirmed { block_number: Some(7) })
        );
        assert_eq!(outcome_from_info(&json!({})), None);
    }

    #[test]
    fn test_contract_ret_fallback() {
        let tx = json!({"ret": [{"contractRet": "OUT_OF_ENERGY"}]});
        assert_eq!(
            outcome_from_ret(&tx),
            Some(ConfirmationOutcome::Failed { reason: "OUT_OF_ENERGY".into() })
        );
        assert_eq!(outcome_from_ret(&json!({})), None);
    }

    /// Empty until the third info probe.
    struct SlowNode {
        info_calls: AtomicUsize,
    }

    #[async_trait]
    impl HttpTransport for SlowNode {
        async fn post_json(&self, url: &str, _: &Value) -> Result<HttpResponse, TransportError> {
            if url.ends_with("/wallet/gettransactioninfobyid") {
                let n = self.info_calls.fetch_add(1, Ordering::SeqCst);
                if n >= 2 {
                    return Ok(HttpResponse::ok(
                        json!({"blockNumber": 9, "receipt": {"result": "SUCCESS"}}).to_string(),
                    ));
                }
            }
            Ok(HttpResponse::ok("{}"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_polls_until_confirmed() {
        let client = ProtocolClient::new(
            SlowNode { info_calls: AtomicUsize::new(0) },
            &EngineConfig::default(),
        );
        let outcome = client.wait_for_confirmation("http://node.local", "ab").await;
        assert_eq!(outcome, ConfirmationOutcome::Confirmed { block_number: Some(9) });
        assert_eq!(client.http().inner().info_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_unresolved() {
        let client = ProtocolClient::new(
            SlowNode { info_calls: AtomicUsize::new(0) },
            &{
                let mut config = EngineConfig::default();
                config.polling.confirmation_timeout_secs = 1;
                config.polling.interval_ms = 600;
                config
            },
        );
        // Two probes fit in one second; both see nothing.
        let outcome = client.wait_for_confirmation("http://node.local", "ab").await;
        assert_eq!(outcome, ConfirmationOutcome::Unresolved);
    }
}
