use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, instrument};
use url::Url;

use crate::error::{display_chain, CacheError};

use super::client::{ApiClient, Installation};
use super::transport::ApiRequest;

#[derive(Debug, Deserialize)]
struct TokenBody {
    token: String,
}

/// Mint an installation access token for `org` using the app-scoped
/// `app_client`.
///
/// Looks up the org's installation, then POSTs to its `access_tokens_url`
/// through the app client's own JWT transport.  Nothing is cached; every call
/// mints a fresh token.
#[instrument(skip(app_client), fields(scope = %app_client.scope()))]
pub async fn installation_access_token(
    app_client: &ApiClient,
    org: &str,
) -> Result<String, CacheError> {
    let not_found = |detail: String| CacheError::InstallationNotFound {
        org: org.to_string(),
        detail,
    };

    let resp = app_client
        .find_org_installation(org)
        .await
        .map_err(|e| not_found(display_chain(&e)))?;
    if resp.status != StatusCode::OK {
        return Err(not_found(format!("unexpected status {}", resp.status)));
    }

    let installation: Installation = resp.json().map_err(|e| CacheError::MalformedInstallation {
        org: org.to_string(),
        url: String::new(),
        detail: format!("invalid installation record: {e}"),
    })?;
    let raw_url = installation.access_tokens_url.unwrap_or_default();
    if raw_url.is_empty() {
        return Err(CacheError::MalformedInstallation {
            org: org.to_string(),
            url: raw_url,
            detail: "missing access_tokens_url".to_string(),
        });
    }
    let tokens_url = Url::parse(&raw_url).map_err(|e| CacheError::MalformedInstallation {
        org: org.to_string(),
        url: raw_url.clone(),
        detail: e.to_string(),
    })?;
    debug!(installation_id = installation.id, %tokens_url, "found org installation");

    let exchange_failed = |detail: String| CacheError::TokenExchangeFailed {
        url: raw_url.clone(),
        detail,
    };
    let resp = app_client
        .send(ApiRequest::post(tokens_url))
        .await
        .map_err(|e| exchange_failed(display_chain(&e)))?;
    // GitHub answers 201 Created; some proxies and GHES versions answer 200.
    if resp.status != StatusCode::CREATED && resp.status != StatusCode::OK {
        return Err(exchange_failed(format!("unexpected status {}", resp.status)));
    }
    let body: TokenBody = resp
        .json()
        .map_err(|e| exchange_failed(format!("invalid token response: {e}")))?;
    if body.token.is_empty() {
        return Err(exchange_failed("empty token in response".to_string()));
    }

    Ok(body.token)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mockito::{Matcher, ServerGuard};

    use super::*;
    use crate::forge::transport::{HttpTransport, Transport};
    use crate::forge::Scope;

    /// App client without authentication; the token flow itself does not care
    /// what the transport attaches.
    fn app_client(server: &ServerGuard) -> ApiClient {
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new("policybot-test").unwrap());
        ApiClient::new(
            transport,
            Url::parse(&server.url()).unwrap(),
            Scope::Application,
        )
    }

    async fn mock_installation(server: &mut ServerGuard, body: String) -> mockito::Mock {
        server
            .mock("GET", "/orgs/acme/installation")
            .with_status(200)
            .with_body(body)
            .create_async()
            .await
    }

    #[tokio::test]
    async fn mints_token_for_org() {
        let mut server = mockito::Server::new_async().await;
        let tokens_url = format!("{}/app/installations/42/access_tokens", server.url());
        mock_installation(
            &mut server,
            format!(r#"{{"id":42,"access_tokens_url":"{tokens_url}","account":{{"login":"acme"}}}}"#),
        )
        .await;
        let mint = server
            .mock("POST", "/app/installations/42/access_tokens")
            .with_status(201)
            .with_body(r#"{"token":"ghs_minted","expires_at":"2030-01-01T00:00:00Z"}"#)
            .expect(2)
            .create_async()
            .await;

        let client = app_client(&server);
        assert_eq!(installation_access_token(&client, "acme").await.unwrap(), "ghs_minted");
        // Stateless: a second call mints again.
        assert_eq!(installation_access_token(&client, "acme").await.unwrap(), "ghs_minted");
        mint.assert_async().await;
    }

    #[tokio::test]
    async fn ok_status_from_token_endpoint_is_accepted() {
        let mut server = mockito::Server::new_async().await;
        let tokens_url = format!("{}/app/installations/42/access_tokens", server.url());
        mock_installation(
            &mut server,
            format!(r#"{{"id":42,"access_tokens_url":"{tokens_url}"}}"#),
        )
        .await;
        let mint = server
            .mock("POST", "/app/installations/42/access_tokens")
            .with_status(200)
            .with_body(r#"{"token":"ghs_via_proxy"}"#)
            .expect(1)
            .create_async()
            .await;

        let token = installation_access_token(&app_client(&server), "acme")
            .await
            .unwrap();
        assert_eq!(token, "ghs_via_proxy");
        mint.assert_async().await;
    }

    #[tokio::test]
    async fn other_success_statuses_are_token_exchange_failures() {
        let mut server = mockito::Server::new_async().await;
        let tokens_url = format!("{}/app/installations/42/access_tokens", server.url());
        mock_installation(
            &mut server,
            format!(r#"{{"id":42,"access_tokens_url":"{tokens_url}"}}"#),
        )
        .await;
        server
            .mock("POST", "/app/installations/42/access_tokens")
            .with_status(202)
            .with_body(r#"{"token":"ghs_accepted"}"#)
            .create_async()
            .await;

        let err = installation_access_token(&app_client(&server), "acme")
            .await
            .unwrap_err();
        match err {
            CacheError::TokenExchangeFailed { detail, .. } => assert!(detail.contains("202"), "{detail}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_installation_is_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/orgs/ghost/installation")
            .with_status(404)
            .with_body(r#"{"message":"Not Found"}"#)
            .create_async()
            .await;

        let err = installation_access_token(&app_client(&server), "ghost")
            .await
            .unwrap_err();
        match err {
            CacheError::InstallationNotFound { org, detail } => {
                assert_eq!(org, "ghost");
                assert!(detail.contains("404"), "{detail}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_or_invalid_tokens_url_is_malformed() {
        let mut server = mockito::Server::new_async().await;
        mock_installation(&mut server, r#"{"id":42}"#.to_string()).await;
        let err = installation_access_token(&app_client(&server), "acme")
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::MalformedInstallation { .. }));

        let mut server = mockito::Server::new_async().await;
        mock_installation(
            &mut server,
            r#"{"id":42,"access_tokens_url":"::not a url::"}"#.to_string(),
        )
        .await;
        let err = installation_access_token(&app_client(&server), "acme")
            .await
            .unwrap_err();
        match err {
            CacheError::MalformedInstallation { url, .. } => assert_eq!(url, "::not a url::"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejected_exchange_is_token_exchange_failure() {
        let mut server = mockito::Server::new_async().await;
        let tokens_url = format!("{}/app/installations/42/access_tokens", server.url());
        mock_installation(
            &mut server,
            format!(r#"{{"id":42,"access_tokens_url":"{tokens_url}"}}"#),
        )
        .await;
        server
            .mock("POST", "/app/installations/42/access_tokens")
            .with_status(403)
            .create_async()
            .await;

        let err = installation_access_token(&app_client(&server), "acme")
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::TokenExchangeFailed { .. }));
    }

    #[tokio::test]
    async fn unparseable_token_body_is_token_exchange_failure() {
        let mut server = mockito::Server::new_async().await;
        let tokens_url = format!("{}/app/installations/42/access_tokens", server.url());
        mock_installation(
            &mut server,
            format!(r#"{{"id":42,"access_tokens_url":"{tokens_url}"}}"#),
        )
        .await;
        server
            .mock("POST", Matcher::Exact("/app/installations/42/access_tokens".into()))
            .with_status(201)
            .with_body("<html>")
            .create_async()
            .await;

        let err = installation_access_token(&app_client(&server), "acme")
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::TokenExchangeFailed { .. }));
    }
}
