//! Installation client cache wired from configuration against a mock API.

use std::sync::Arc;

use mockito::Matcher;
use policybot_cache::config::parse_config;
use policybot_cache::credentials::BackendRegistry;
use policybot_cache::forge::ApiRequest;
use policybot_cache::{installation_access_token, InstallationClients, MetricsRegistry, Scope};

const TEST_KEY: &str = include_str!("fixtures/test_app_key.pem");

fn clients_for(server: &mockito::ServerGuard, metrics: &MetricsRegistry) -> InstallationClients {
    let key_path = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/test_app_key.pem");
    let yaml = format!(
        "github:\n  app_id: 1234\n  api_url: {}\n  key_secret: file://{key_path}\n",
        server.url()
    );
    let registry = BackendRegistry::with_defaults();
    let config = parse_config(&yaml, &registry).unwrap();
    InstallationClients::from_config(&config.github, &registry, Some(Arc::clone(&metrics.metrics)))
        .unwrap()
}

#[tokio::test]
async fn app_client_mints_org_token() {
    assert!(TEST_KEY.contains("PRIVATE KEY"));
    let mut server = mockito::Server::new_async().await;
    let tokens_url = format!("{}/app/installations/42/access_tokens", server.url());
    let lookup = server
        .mock("GET", "/orgs/acme/installation")
        .match_header("authorization", Matcher::Regex("^Bearer ".into()))
        .with_status(200)
        .with_body(format!(r#"{{"id":42,"access_tokens_url":"{tokens_url}"}}"#))
        .create_async()
        .await;
    let mint = server
        .mock("POST", "/app/installations/42/access_tokens")
        .match_header("authorization", Matcher::Regex("^Bearer ".into()))
        .with_status(201)
        .with_body(r#"{"token":"ghs_org_token","expires_at":"2030-01-01T00:00:00Z"}"#)
        .create_async()
        .await;

    let metrics = MetricsRegistry::new();
    let clients = clients_for(&server, &metrics);
    let app = clients.get(0).await.unwrap();
    assert_eq!(app.scope(), Scope::Application);

    let token = installation_access_token(&app, "acme").await.unwrap();
    assert_eq!(token, "ghs_org_token");
    lookup.assert_async().await;
    mint.assert_async().await;
}

#[tokio::test]
async fn installation_client_authenticates_and_caches_responses() {
    let mut server = mockito::Server::new_async().await;
    let mint = server
        .mock("POST", "/app/installations/42/access_tokens")
        .with_status(201)
        .with_body(r#"{"token":"ghs_inst","expires_at":"2030-01-01T00:00:00Z"}"#)
        .expect(1)
        .create_async()
        .await;
    let first = server
        .mock("GET", "/repos/acme/widgets")
        .match_header("authorization", "token ghs_inst")
        .match_header("if-none-match", Matcher::Missing)
        .with_status(200)
        .with_header("etag", "\"w1\"")
        .with_body(r#"{"name":"widgets"}"#)
        .expect(1)
        .create_async()
        .await;
    let revalidate = server
        .mock("GET", "/repos/acme/widgets")
        .match_header("if-none-match", "\"w1\"")
        .with_status(304)
        .expect(1)
        .create_async()
        .await;

    let metrics = MetricsRegistry::new();
    let clients = clients_for(&server, &metrics);
    let client = clients.get(42).await.unwrap();
    assert_eq!(client.scope(), Scope::Installation(42));
    assert!(Arc::ptr_eq(&client, &clients.get(42).await.unwrap()));

    let live = client.get("repos/acme/widgets").await.unwrap();
    assert!(!live.is_from_cache());
    let cached = client
        .send(ApiRequest::get(client.endpoint("repos/acme/widgets").unwrap()))
        .await
        .unwrap();
    assert!(cached.is_from_cache());
    assert_eq!(&cached.body[..], br#"{"name":"widgets"}"#);

    mint.assert_async().await;
    first.assert_async().await;
    revalidate.assert_async().await;

    let m = &metrics.metrics;
    assert_eq!(m.client_cache_misses.get(), 1);
    assert_eq!(m.client_cache_hits.get(), 1);
    assert_eq!(m.http_cache_hits.get(), 1);

    clients.free(42);
    assert!(clients.is_empty());
}

#[tokio::test]
async fn unreadable_key_surfaces_key_unavailable() {
    let server = mockito::Server::new_async().await;
    let yaml = format!(
        "github:\n  app_id: 1234\n  api_url: {}\n  key_secret: file:///nonexistent/policybot/app.pem\n",
        server.url()
    );
    let registry = BackendRegistry::with_defaults();
    let config = parse_config(&yaml, &registry).unwrap();
    let clients = InstallationClients::from_config(&config.github, &registry, None).unwrap();

    let err = clients.get(7).await.unwrap_err();
    assert!(
        matches!(err, policybot_cache::CacheError::KeyUnavailable { .. }),
        "{err:?}"
    );
    assert!(clients.is_empty());
}
