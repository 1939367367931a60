use assert_cmd::Command;
use assert_cmd::cargo;
use mockito::{Matcher, Server};
use request_dispatcher::http::{
    FailureKind, RateLimitPolicy, RefreshPolicy, RequestDispatcher, RetryPolicy,
};
use request_dispatcher::oauth::{AppTokenClient, ClientCredentials};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::{TempDir, tempdir};

/// Config with no back-off so retries don't slow the tests down.
fn write_fast_config(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("config.json");
    std::fs::write(
        &path,
        r#"{"auto_retry_sleep_secs": 0, "rate_limit_sleep_secs": 0, "num_auto_retries": 2}"#,
    )
    .unwrap();
    path
}

fn fast_dispatcher(base_url: &str, retries: u32) -> RequestDispatcher {
    let mut dispatcher = RequestDispatcher::new(base_url).unwrap();
    dispatcher.set_retry_policy(RetryPolicy {
        num_auto_retries: retries,
        auto_retry_sleep: Duration::ZERO,
        non_retryable_statuses: vec![404],
    });
    dispatcher.set_rate_limit_policy(RateLimitPolicy {
        statuses: vec![429],
        sleep: Duration::ZERO,
    });
    dispatcher
}

#[test_log::test(tokio::test)]
async fn test_dispatcher_get_against_server() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/users")
        .match_query(Matcher::UrlEncoded("id".into(), "42".into()))
        .with_status(200)
        .with_header("Content-Type", "application/json")
        .with_body(r#"{"data":[{"id":"42"}]}"#)
        .create_async()
        .await;

    let mut dispatcher = fast_dispatcher(&server.url(), 2);
    let result = dispatcher.get("/users", &[("id", "42")], &[]).await.unwrap();

    mock.assert_async().await;
    assert_eq!(dispatcher.last_http_code(), Some(200));
    assert_eq!(
        dispatcher.last_raw_response(),
        Some(r#"{"data":[{"id":"42"}]}"#)
    );
    assert_eq!(
        dispatcher.response_header("CONTENT-TYPE"),
        Some("application/json")
    );
    let body: serde_json::Value = result.json().unwrap();
    assert_eq!(body["data"][0]["id"], "42");
}

#[tokio::test]
async fn test_dispatcher_exhausts_retries_against_server() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/flaky")
        .with_status(500)
        .with_body("oops")
        .expect(3)
        .create_async()
        .await;

    let mut dispatcher = fast_dispatcher(&server.url(), 2);
    let err = dispatcher.get("/flaky", &[], &[]).await.unwrap_err();

    mock.assert_async().await;
    assert_eq!(err.status(), Some(500));
    assert_eq!(err.body(), Some("oops"));
    assert_eq!(err.attempts(), 3);
    assert!(err.is_exhausted());
}

#[tokio::test]
async fn test_dispatcher_non_retryable_against_server() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("DELETE", "/gone")
        .with_status(404)
        .expect(1)
        .create_async()
        .await;

    let mut dispatcher = fast_dispatcher(&server.url(), 5);
    let err = dispatcher.delete("/gone", &[], "", &[]).await.unwrap_err();

    mock.assert_async().await;
    assert_eq!(err.kind(), FailureKind::Http);
    assert!(!err.retryable());
}

#[tokio::test]
async fn test_dispatcher_refreshes_token_from_token_endpoint() {
    let mut server = Server::new_async().await;
    let expired = server
        .mock("GET", "/helix/users")
        .match_header("authorization", "Bearer expired")
        .with_status(401)
        .expect(1)
        .create_async()
        .await;
    let token = server
        .mock("POST", "/oauth2/token")
        .match_query(Matcher::UrlEncoded("grant_type".into(), "client_credentials".into()))
        .with_status(200)
        .with_body(r#"{"access_token": "fresh", "expires_in": 3600, "token_type": "bearer"}"#)
        .expect(1)
        .create_async()
        .await;
    let ok = server
        .mock("GET", "/helix/users")
        .match_header("authorization", "Bearer fresh")
        .with_status(200)
        .with_body("[]")
        .expect(1)
        .create_async()
        .await;

    let token_client = AppTokenClient::new(
        ClientCredentials {
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
        },
        Some(server.url()),
    )
    .unwrap();

    let mut dispatcher = fast_dispatcher(&server.url(), 1);
    dispatcher.set_oauth_header(Some("Authorization: Bearer expired".to_string()));
    dispatcher
        .set_refresh_policy(RefreshPolicy::new(vec![401]).with_refresher(Arc::new(token_client)));

    let result = dispatcher.get("/helix/users", &[], &[]).await.unwrap();

    expired.assert_async().await;
    token.assert_async().await;
    ok.assert_async().await;
    assert_eq!(result.raw_response.as_deref(), Some("[]"));
}

#[test]
fn test_cli_request_prints_body() {
    let mut server = Server::new();
    let _mock = server
        .mock("GET", "/users")
        .match_query(Matcher::UrlEncoded("login".into(), "shrum".into()))
        .match_header("client-id", "abc")
        .with_status(200)
        .with_header("ratelimit-remaining", "799")
        .with_body(r#"{"data":[]}"#)
        .create();

    let dir = tempdir().unwrap();
    let config = write_fast_config(&dir);

    let mut cmd = Command::new(cargo::cargo_bin!("dispatch"));
    cmd.arg("--config")
        .arg(&config)
        .arg("--base-url")
        .arg(server.url())
        .args(["request", "get", "/users", "-q", "login=shrum", "-H", "Client-Id: abc", "-i"]);

    cmd.assert()
        .success()
        .stdout(predicates::str::contains("HTTP 200"))
        .stdout(predicates::str::contains("ratelimit-remaining: 799"))
        .stdout(predicates::str::contains(r#"{"data":[]}"#));
}

#[test]
fn test_cli_request_failure_exits_nonzero() {
    let mut server = Server::new();
    let mock = server
        .mock("POST", "/chat")
        .with_status(503)
        .with_body("maintenance")
        .expect(2)
        .create();

    let dir = tempdir().unwrap();
    let config = write_fast_config(&dir);

    let mut cmd = Command::new(cargo::cargo_bin!("dispatch"));
    cmd.arg("--config")
        .arg(&config)
        .arg("--base-url")
        .arg(server.url())
        .args(["--retries", "1", "request", "post", "/chat", "-d", r#"{"message":"hi"}"#]);

    cmd.assert()
        .failure()
        .stderr(predicates::str::contains("maintenance"))
        .stderr(predicates::str::contains("HTTP 503 error after 2 attempts"));

    mock.assert();
}

#[test]
fn test_cli_token() {
    let mut server = Server::new();
    let _mock = server
        .mock("POST", "/oauth2/token")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("client_id".into(), "abc".into()),
            Matcher::UrlEncoded("client_secret".into(), "xyz".into()),
        ]))
        .with_status(200)
        .with_body(r#"{"access_token": "tok", "expires_in": 100, "token_type": "bearer"}"#)
        .create();

    let mut cmd = Command::new(cargo::cargo_bin!("dispatch"));
    cmd.env_remove("TWITCH_CLIENT_ID")
        .env_remove("TWITCH_CLIENT_SECRET")
        .args(["token", "--client-id", "abc", "--client-secret", "xyz", "--oauth-url"])
        .arg(server.url());

    cmd.assert()
        .success()
        .stdout(predicates::str::contains(r#""access_token": "tok""#));
}

#[test]
fn test_cli_token_requires_credentials() {
    let mut cmd = Command::new(cargo::cargo_bin!("dispatch"));
    cmd.env_remove("TWITCH_CLIENT_ID")
        .env_remove("TWITCH_CLIENT_SECRET")
        .arg("token");

    cmd.assert()
        .failure()
        .stderr(predicates::str::contains("--client-id"));
}
