mod common;

use anyhow::Context as _;
use common::{
    ACCEPT_JSON, CONTAINER, ECHO, ProxyOptions, request, session_header, start_proxy, tool_call,
    tool_text,
};
use reqwest::StatusCode;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::time::Duration;

#[tokio::test]
async fn initialize_without_session_mints_a_session() -> anyhow::Result<()> {
    let proxy = start_proxy(ProxyOptions::default()).await?;

    let (status, session, body) = proxy
        .call_json(None, &json!({"jsonrpc": "2.0", "method": "initialize", "id": 1}))
        .await?;

    assert_eq!(status, StatusCode::OK);
    let session = session.context("Mcp-Session-Id header")?;
    assert!(!session.is_empty());
    assert_eq!(body["jsonrpc"], "2.0");
    assert_eq!(body["id"], 1);
    assert_eq!(body["result"]["serverInfo"]["name"], "mcp-echo-server");
    Ok(())
}

#[tokio::test]
async fn session_reuse_reaches_the_same_subprocess() -> anyhow::Result<()> {
    let proxy = start_proxy(ProxyOptions::default()).await?;

    let (_, session, listed) = proxy
        .call_json(None, &request(2, "tools/list", json!({})))
        .await?;
    let session = session.context("session header")?;
    assert!(listed["result"]["tools"].as_array().is_some_and(|t| !t.is_empty()));

    let (status, again, set) = proxy
        .call_json(
            Some(&session),
            &tool_call(3, "set", json!({"key": "color", "value": "blue"})),
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again.as_deref(), Some(session.as_str()));
    assert_eq!(tool_text(&set), "ok");

    let (_, _, got) = proxy
        .call_json(Some(&session), &tool_call(4, "get", json!({"key": "color"})))
        .await?;
    assert_eq!(tool_text(&got), "\"blue\"");

    let status = proxy.status().await?;
    assert_eq!(status["stats"]["spawnedTotal"], 1);
    assert_eq!(status["stats"]["liveSessions"], 1);
    assert_eq!(status["sessions"][0]["sessionId"], session.as_str());
    Ok(())
}

#[tokio::test]
async fn omitting_the_session_header_always_creates_a_new_session() -> anyhow::Result<()> {
    let proxy = start_proxy(ProxyOptions::default()).await?;

    let mut sessions = HashSet::new();
    let mut pids = HashSet::new();
    for id in 0..3 {
        let (status, session, body) = proxy
            .call_json(None, &tool_call(id, "pid", json!({})))
            .await?;
        assert_eq!(status, StatusCode::OK);
        sessions.insert(session.context("session header")?);
        pids.insert(tool_text(&body).to_string());
    }
    assert_eq!(sessions.len(), 3);
    assert_eq!(pids.len(), 3);
    assert_eq!(proxy.manager.stats().spawned_total, 3);
    Ok(())
}

#[tokio::test]
async fn unknown_session_id_is_replaced_silently() -> anyhow::Result<()> {
    let proxy = start_proxy(ProxyOptions::default()).await?;

    let (status, session, body) = proxy
        .call_json(Some("not-a-live-session"), &request(1, "ping", json!({})))
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], 1);
    let session = session.context("session header")?;
    assert_ne!(session, "not-a-live-session");
    Ok(())
}

#[tokio::test]
async fn batch_replies_are_correlated_by_id() -> anyhow::Result<()> {
    let proxy = start_proxy(ProxyOptions::default()).await?;

    let batch = json!([
        tool_call("a", "echo", json!({"message": "one"})),
        {"jsonrpc": "2.0", "method": "notifications/initialized"},
        tool_call("b", "echo", json!({"message": "two"})),
        request(7, "tools/list", json!({})),
    ]);
    let (status, _, body) = proxy.call_json(None, &batch).await?;
    assert_eq!(status, StatusCode::OK);

    let replies = body.as_array().context("batch reply is an array")?;
    assert_eq!(replies.len(), 3);
    let by_id = |id: Value| replies.iter().find(|r| r["id"] == id).cloned();
    assert_eq!(tool_text(&by_id(json!("a")).context("a")?), "one");
    assert_eq!(tool_text(&by_id(json!("b")).context("b")?), "two");
    assert!(by_id(json!(7)).context("7")?["result"]["tools"].is_array());
    Ok(())
}

#[tokio::test]
async fn unknown_methods_pass_through_as_errors() -> anyhow::Result<()> {
    let proxy = start_proxy(ProxyOptions::default()).await?;

    let (status, _, body) = proxy
        .call_json(None, &request(5, "resources/list", json!({})))
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["error"]["code"], -32601);
    assert_eq!(body["id"], 5);
    Ok(())
}

#[tokio::test]
async fn malformed_json_is_a_parse_error() -> anyhow::Result<()> {
    let proxy = start_proxy(ProxyOptions::default()).await?;

    let resp = proxy
        .post_raw(CONTAINER, ECHO, None, ACCEPT_JSON, br#"{"method":}"#.to_vec())
        .await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await?;
    assert_eq!(body["error"]["code"], -32700);
    assert_eq!(body["id"], Value::Null);
    assert_eq!(proxy.manager.stats().spawned_total, 0);
    Ok(())
}

#[tokio::test]
async fn invalid_requests_are_rejected_with_their_id() -> anyhow::Result<()> {
    let proxy = start_proxy(ProxyOptions::default()).await?;

    let resp = proxy
        .post(ECHO, None, ACCEPT_JSON, &json!({"jsonrpc": "2.0", "id": 3}))
        .await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await?;
    assert_eq!(body["error"]["code"], -32600);
    assert_eq!(body["id"], 3);

    let resp = proxy.post(ECHO, None, ACCEPT_JSON, &json!([])).await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn unknown_container_and_server_are_not_found() -> anyhow::Result<()> {
    let proxy = start_proxy(ProxyOptions::default()).await?;
    let body = serde_json::to_vec(&request(1, "initialize", json!({})))?;

    let resp = proxy
        .post_raw("missing", ECHO, None, ACCEPT_JSON, body.clone())
        .await?;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let err: Value = resp.json().await?;
    assert_eq!(err["id"], 1);
    assert!(err["error"]["message"].as_str().unwrap_or_default().contains("missing"));

    let resp = proxy
        .post_raw(CONTAINER, "missing", None, ACCEPT_JSON, body)
        .await?;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn spawn_failure_is_an_internal_error() -> anyhow::Result<()> {
    let proxy = start_proxy(ProxyOptions::default()).await?;

    let resp = proxy
        .post("broken", None, ACCEPT_JSON, &request(1, "initialize", json!({})))
        .await?;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(session_header(&resp).is_none());
    let body: Value = resp.json().await?;
    assert_eq!(body["error"]["code"], -32603);
    assert!(proxy.manager.is_empty());
    Ok(())
}

#[tokio::test]
async fn notifications_only_are_accepted_without_waiting() -> anyhow::Result<()> {
    let proxy = start_proxy(ProxyOptions::default()).await?;

    let resp = proxy
        .post(
            ECHO,
            None,
            ACCEPT_JSON,
            &json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
        )
        .await?;
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    assert!(session_header(&resp).is_some());
    Ok(())
}

#[tokio::test]
async fn crash_mid_call_fails_the_call_and_kills_the_session() -> anyhow::Result<()> {
    let proxy = start_proxy(ProxyOptions::default()).await?;

    let (_, session, _) = proxy
        .call_json(None, &request(1, "initialize", json!({})))
        .await?;
    let session = session.context("session header")?;

    let (status, _, body) = proxy
        .call_json(Some(&session), &tool_call(2, "crash", json!({})))
        .await?;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["id"], 2);
    assert_eq!(body["error"]["code"], -32603);

    // The dead session is replaced on the next call.
    let (status, replaced, body) = proxy
        .call_json(Some(&session), &request(3, "ping", json!({})))
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], 3);
    assert_ne!(replaced.as_deref(), Some(session.as_str()));
    Ok(())
}

#[tokio::test]
async fn timeout_answers_504_and_keeps_the_session() -> anyhow::Result<()> {
    let proxy = start_proxy(ProxyOptions {
        call_timeout: Duration::from_millis(300),
        ..ProxyOptions::default()
    })
    .await?;

    let (_, session, _) = proxy
        .call_json(None, &request(1, "initialize", json!({})))
        .await?;
    let session = session.context("session header")?;

    let (status, again, body) = proxy
        .call_json(Some(&session), &tool_call(2, "sleep", json!({"ms": 1000})))
        .await?;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(again.as_deref(), Some(session.as_str()));
    assert_eq!(body["id"], 2);
    assert_eq!(body["error"]["code"], -32603);

    // Let the slow reply drain, then use the same session again.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    let (status, again, body) = proxy
        .call_json(Some(&session), &tool_call(3, "echo", json!({"message": "still here"})))
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again.as_deref(), Some(session.as_str()));
    assert_eq!(tool_text(&body), "still here");
    Ok(())
}

#[tokio::test]
async fn reusing_a_request_id_on_a_session_is_rejected() -> anyhow::Result<()> {
    let proxy = start_proxy(ProxyOptions::default()).await?;

    let (_, session, _) = proxy
        .call_json(None, &request(1, "initialize", json!({})))
        .await?;
    let session = session.context("session header")?;

    let (status, _, body) = proxy
        .call_json(Some(&session), &request(1, "ping", json!({})))
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], -32600);
    assert_eq!(body["id"], 1);
    Ok(())
}

#[tokio::test]
async fn malformed_subprocess_lines_are_skipped() -> anyhow::Result<()> {
    let proxy = start_proxy(ProxyOptions::default()).await?;

    let (status, _, body) = proxy
        .call_json(None, &tool_call(1, "garbage", json!({})))
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tool_text(&body), "after garbage");
    Ok(())
}

#[tokio::test]
async fn delete_terminates_the_session() -> anyhow::Result<()> {
    let proxy = start_proxy(ProxyOptions::default()).await?;

    let (_, session, _) = proxy
        .call_json(None, &request(1, "initialize", json!({})))
        .await?;
    let session = session.context("session header")?;

    let url = proxy.endpoint(CONTAINER, ECHO);
    let resp = proxy
        .client
        .delete(&url)
        .header("Mcp-Session-Id", &session)
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert!(proxy.manager.is_empty());

    let resp = proxy
        .client
        .delete(&url)
        .header("Mcp-Session-Id", &session)
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = proxy.client.delete(&url).send().await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn unacceptable_accept_header_is_406() -> anyhow::Result<()> {
    let proxy = start_proxy(ProxyOptions::default()).await?;

    let resp = proxy
        .post(ECHO, None, "text/html", &request(1, "ping", json!({})))
        .await?;
    assert_eq!(resp.status(), StatusCode::NOT_ACCEPTABLE);
    assert!(proxy.manager.is_empty());
    Ok(())
}

#[tokio::test]
async fn health_and_status_report_counters() -> anyhow::Result<()> {
    let proxy = start_proxy(ProxyOptions::default()).await?;

    let health: Value = proxy
        .client
        .get(format!("{}/health", proxy.base))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(health["status"], "healthy");

    proxy
        .call_json(None, &request(1, "initialize", json!({})))
        .await?;
    let resp = proxy
        .post_raw(CONTAINER, ECHO, None, ACCEPT_JSON, b"nope".to_vec())
        .await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let status = proxy.status().await?;
    assert_eq!(status["version"], "test");
    assert_eq!(status["stats"]["totalRequests"], 2);
    assert_eq!(status["stats"]["failedRequests"], 1);
    Ok(())
}
