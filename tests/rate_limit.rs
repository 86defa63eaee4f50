//! Gateway limiter over real HTTP against a local backend.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;

use common::start_programmable_backend;
use wallet_engine::config::RateLimitConfig;
use wallet_engine::http::{ReqwestTransport, TransportError};
use wallet_engine::tron::{ProtocolClient, TronAddress, TronError};
use wallet_engine::EngineConfig;

fn limited_client(max_retries: u32) -> ProtocolClient<ReqwestTransport> {
    let mut config = EngineConfig::default();
    config.tron.rate_limited_hosts = vec!["127.0.0.1".to_string()];
    config.rate_limit = RateLimitConfig {
        base_interval_ms: 10,
        max_interval_ms: 200,
        relax_step_ms: 5,
        max_retries,
    };
    let transport = ReqwestTransport::new(Duration::from_secs(5), None).unwrap();
    ProtocolClient::new(transport, &config)
}

fn account() -> TronAddress {
    common::key(common::KEY_0).tron_address()
}

#[tokio::test]
async fn test_gateway_429_is_retried_with_growing_spacing() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let addr = start_programmable_backend(move |path, _body| {
        let hit = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            assert_eq!(path, "/wallet/getReward");
            if hit < 2 {
                (429, r#"{"Error":"rate limited"}"#.to_string())
            } else {
                (200, r#"{"reward":42}"#.to_string())
            }
        }
    })
    .await;
    let gateway = format!("http://{}", addr);
    let client = limited_client(3);

    let reward = client.get_reward(&gateway, &account()).await.unwrap();
    assert_eq!(reward, 42);
    assert_eq!(hits.load(Ordering::SeqCst), 3);

    // 10 → 20 → 40 on the two 429s, then one relax step.
    let state = client.http().state("127.0.0.1").await.unwrap();
    assert_eq!(state.interval_ms, 35);
}

#[tokio::test]
async fn test_gateway_429_surfaces_after_retries() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let addr = start_programmable_backend(move |_path, _body| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { (429, "slow down".to_string()) }
    })
    .await;
    let client = limited_client(2);

    let err = client
        .get_reward(&format!("http://{}", addr), &account())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TronError::Transport(TransportError::Status { status: 429, .. })
    ));
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_one_request_in_flight_per_gateway() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
    let addr = start_programmable_backend(move |_path, _body| {
        let (active, peak) = (Arc::clone(&a), Arc::clone(&p));
        async move {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            active.fetch_sub(1, Ordering::SeqCst);
            (200, r#"{"reward":1}"#.to_string())
        }
    })
    .await;
    let gateway = format!("http://{}", addr);
    let client = limited_client(0);
    let address = account();

    let results = join_all((0..4).map(|_| client.get_reward(&gateway, &address))).await;
    assert!(results.iter().all(|r| matches!(r, Ok(1))));
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}
