//! Integration tests for the request pipeline.
//!
//! Exercises forwarding of admitted requests, rate-limit headers, throttle
//! and block denials, whitelisting, plan multipliers, route overrides and
//! upstream failures against throwaway local backends.

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use chrono::TimeDelta;
use common::*;
use gatekeeper::config::RouteConfig;
use hyper::{Method, Request, StatusCode};

#[tokio::test]
async fn admitted_request_is_forwarded_with_rate_limit_headers() {
    init_tracing();
    let (addr, _shutdown) = start_backend(StatusCode::OK, "text/plain", "hello").await;
    let clock = test_clock();
    let state = test_state(test_config(addr, 5), &clock);

    let resp = send(get("/readings?page=1"), &state).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["x-ratelimit-limit"], "5");
    assert_eq!(resp.headers()["x-ratelimit-remaining"], "4");
    assert_eq!(resp.headers()["x-ratelimit-reset"], "1700000100");

    let body = collect_body(resp.into_body()).await;
    assert_eq!(body, Bytes::from("hello"));
}

#[tokio::test]
async fn forwarding_headers_are_injected() {
    init_tracing();
    let (addr, _shutdown) = start_echo_headers_backend().await;
    let clock = test_clock();
    let state = test_state(test_config(addr, 5), &clock);

    let req = Request::builder()
        .uri("/readings")
        .header("connection", "keep-alive")
        .header("host", "api.example.com")
        .body(http_body_util::Empty::<Bytes>::new())
        .unwrap();

    let resp = send(req, &state).await;
    let body = collect_body(resp.into_body()).await;
    let text = String::from_utf8_lossy(&body);

    assert!(text.contains("x-forwarded-for: 192.168.1.100"));
    assert!(text.contains(&format!("host: {addr}")));
    assert!(!text.contains("connection: keep-alive"));
}

#[tokio::test]
async fn exceeding_quota_returns_429_with_retry_after() {
    init_tracing();
    let (addr, _shutdown) = start_backend(StatusCode::OK, "text/plain", "ok").await;
    let clock = test_clock();
    let state = test_state(test_config(addr, 2), &clock);

    for _ in 0..2 {
        assert_eq!(send(get("/readings"), &state).await.status(), StatusCode::OK);
    }

    clock.advance(TimeDelta::seconds(15));
    let resp = send(get("/readings"), &state).await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(resp.headers()["retry-after"], "45");
    assert_eq!(resp.headers()["x-ratelimit-remaining"], "0");

    let body = json_body(resp).await;
    assert_eq!(body["error"], "rate_limited");
    assert_eq!(body["limit"], 2);
    assert_eq!(state.violations.get_violations("192.168.1.100"), 1);
}

#[tokio::test]
async fn repeated_throttling_escalates_to_block() {
    init_tracing();
    let (addr, _shutdown) = start_backend(StatusCode::OK, "text/plain", "ok").await;
    let clock = test_clock();
    let state = test_state(test_config(addr, 1), &clock);

    assert_eq!(send(get("/readings"), &state).await.status(), StatusCode::OK);
    for _ in 0..10 {
        assert_eq!(
            send(get("/readings"), &state).await.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    // The counter window has reset, the block has not.
    clock.advance(TimeDelta::minutes(2));
    let resp = send(get("/readings"), &state).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert!(resp.headers().contains_key("retry-after"));

    let body = json_body(resp).await;
    assert_eq!(body["error"], "blocked");
    assert!(
        body["message"]
            .as_str()
            .unwrap()
            .contains("temporarily blocked")
    );

    // Blocked denials are not violations.
    assert_eq!(state.violations.get_violations("192.168.1.100"), 10);

    clock.advance(TimeDelta::hours(1));
    assert_eq!(send(get("/readings"), &state).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn whitelisted_client_bypasses_block_and_quota() {
    init_tracing();
    let (addr, _shutdown) = start_backend(StatusCode::OK, "text/plain", "ok").await;
    let clock = test_clock();
    let state = test_state(test_config(addr, 0), &clock);

    state.whitelist.add("192.168.1.100");
    state.violations.block_ip("192.168.1.100", 3600, None);

    let resp = send(get("/readings"), &state).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(!resp.headers().contains_key("x-ratelimit-limit"));
}

#[tokio::test]
async fn loopback_is_trusted_by_default() {
    init_tracing();
    let (addr, _shutdown) = start_backend(StatusCode::OK, "text/plain", "ok").await;
    let clock = test_clock();
    let state = test_state(test_config(addr, 0), &clock);
    let loopback: SocketAddr = "127.0.0.1:40000".parse().unwrap();

    let resp = send_from(get("/readings"), &state, loopback).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn forwarded_for_takes_precedence_over_peer() {
    init_tracing();
    let (addr, _shutdown) = start_backend(StatusCode::OK, "text/plain", "ok").await;
    let clock = test_clock();
    let state = test_state(test_config(addr, 1), &clock);
    state.violations.block_ip("203.0.113.77", 60, Some("manual"));

    let req = Request::builder()
        .uri("/readings")
        .header("x-forwarded-for", "203.0.113.77, 10.0.0.1")
        .body(http_body_util::Empty::<Bytes>::new())
        .unwrap();
    assert_eq!(send(req, &state).await.status(), StatusCode::FORBIDDEN);

    assert_eq!(send(get("/readings"), &state).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn premium_principal_gets_doubled_quota_on_its_own_tracker() {
    init_tracing();
    let (addr, _shutdown) = start_backend(StatusCode::OK, "text/plain", "ok").await;
    let clock = test_clock();
    let state = test_state(test_config(addr, 1), &clock);

    let resp = send(get_as("/readings", 2), &state).await;
    assert_eq!(resp.headers()["x-ratelimit-limit"], "2");
    assert_eq!(
        send(get_as("/readings", 2), &state).await.status(),
        StatusCode::OK
    );
    assert_eq!(
        send(get_as("/readings", 2), &state).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );

    // Another user behind the same address has an independent quota.
    assert_eq!(
        send(get_as("/readings", 1), &state).await.status(),
        StatusCode::OK
    );
}

#[tokio::test]
async fn claimed_plan_header_does_not_raise_quota() {
    init_tracing();
    let (addr, _shutdown) = start_backend(StatusCode::OK, "text/plain", "ok").await;
    let clock = test_clock();
    let state = test_state(test_config(addr, 1), &clock);

    let claiming_premium = || {
        Request::builder()
            .uri("/readings")
            .header("x-user-id", "1")
            .header("x-user-plan", "premium")
            .body(http_body_util::Empty::<Bytes>::new())
            .unwrap()
    };

    let resp = send(claiming_premium(), &state).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["x-ratelimit-limit"], "1");
    assert_eq!(
        send(claiming_premium(), &state).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[tokio::test]
async fn admin_account_is_not_metered() {
    init_tracing();
    let (addr, _shutdown) = start_backend(StatusCode::OK, "text/plain", "ok").await;
    let clock = test_clock();
    let state = test_state(test_config(addr, 0), &clock);

    for _ in 0..3 {
        let resp = send(get_as("/readings", 3), &state).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(!resp.headers().contains_key("x-ratelimit-limit"));
    }
    assert_eq!(state.violations.get_violations("192.168.1.100"), 0);
}

#[tokio::test]
async fn forwarded_for_ignored_from_untrusted_peer() {
    init_tracing();
    let (addr, _shutdown) = start_backend(StatusCode::OK, "text/plain", "ok").await;
    let clock = test_clock();
    let mut config = test_config(addr, 0);
    config.identity.trusted_proxies = vec!["10.0.0.2".into()];
    let state = test_state(config, &clock);

    let spoofed = || {
        Request::builder()
            .uri("/readings")
            .header("x-forwarded-for", "127.0.0.1")
            .body(http_body_util::Empty::<Bytes>::new())
            .unwrap()
    };

    let resp = send(spoofed(), &state).await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(state.violations.get_violations("192.168.1.100"), 1);

    let proxy: SocketAddr = "10.0.0.2:443".parse().unwrap();
    assert_eq!(
        send_from(spoofed(), &state, proxy).await.status(),
        StatusCode::OK
    );
}

#[tokio::test]
async fn route_override_replaces_plan_quota() {
    init_tracing();
    let (addr, _shutdown) = start_backend(StatusCode::OK, "text/plain", "ok").await;
    let clock = test_clock();
    let mut config = test_config(addr, 100);
    config.rate_limit.routes = vec![RouteConfig {
        path: "^/auth/login$".into(),
        method: Some("POST".into()),
        limit: 1,
        ttl_ms: Some(300_000),
    }];
    let state = test_state(config, &clock);

    let login = || {
        Request::builder()
            .method(Method::POST)
            .uri("/auth/login")
            .header("x-user-id", "2")
            .body(http_body_util::Empty::<Bytes>::new())
            .unwrap()
    };

    let resp = send(login(), &state).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["x-ratelimit-limit"], "1");

    let resp = send(login(), &state).await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);

    // Other routes keep the plan quota.
    let resp = send(get_as("/readings", 2), &state).await;
    assert_eq!(resp.headers()["x-ratelimit-limit"], "200");
}

#[tokio::test]
async fn upstream_timeout_returns_504() {
    init_tracing();
    let (addr, _shutdown) = start_slow_backend(Duration::from_secs(2)).await;
    let clock = test_clock();
    let mut config = test_config(addr, 5);
    config.request_timeout_ms = Some(100);
    let state = test_state(config, &clock);

    let resp = send(get("/slow"), &state).await;
    assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test]
async fn unreachable_upstream_returns_502() {
    init_tracing();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let clock = test_clock();
    let state = test_state(test_config(addr, 5), &clock);

    let resp = send(get("/readings"), &state).await;
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
}
