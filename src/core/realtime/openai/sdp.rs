//! SDP offer/answer exchange with the Realtime API over HTTP.

use async_trait::async_trait;
use reqwest::Client;

use super::config::{OPENAI_REALTIME_SDP_URL, RealtimeModel, sdp_exchange_url};
use crate::core::realtime::base::{VoiceError, VoiceResult};
use crate::core::realtime::token::SessionToken;

/// Trades a local SDP offer for the remote answer.
#[async_trait]
pub trait SdpExchange: Send + Sync {
    /// Send `offer_sdp` authorised by `token` and return the answer SDP.
    async fn exchange(&self, offer_sdp: &str, token: &SessionToken) -> VoiceResult<String>;
}

/// HTTP implementation against `POST {sdp_url}?model=<model>`.
#[derive(Debug, Clone)]
pub struct HttpSdpExchange {
    client: Client,
    url: String,
}

impl HttpSdpExchange {
    pub fn new(base_url: &str, model: RealtimeModel) -> Self {
        Self::with_client(Client::new(), base_url, model)
    }

    pub fn with_client(client: Client, base_url: &str, model: RealtimeModel) -> Self {
        Self {
            client,
            url: sdp_exchange_url(base_url, model),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Default for HttpSdpExchange {
    fn default() -> Self {
        Self::new(OPENAI_REALTIME_SDP_URL, RealtimeModel::default())
    }
}

#[async_trait]
impl SdpExchange for HttpSdpExchange {
    async fn exchange(&self, offer_sdp: &str, token: &SessionToken) -> VoiceResult<String> {
        tracing::debug!(url = %self.url, offer_bytes = offer_sdp.len(), "Exchanging SDP offer");

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(token.value())
            .header(reqwest::header::CONTENT_TYPE, "application/sdp")
            .body(offer_sdp.to_string())
            .send()
            .await
            .map_err(|e| VoiceError::Network(format!("SDP exchange request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(VoiceError::Service {
                status: status.as_u16(),
                message: format!("OpenAI SDP exchange failed: {}", status.as_u16()),
            });
        }

        let answer = response
            .text()
            .await
            .map_err(|e| VoiceError::Network(format!("Failed to read SDP answer: {e}")))?;

        if answer.trim().is_empty() {
            return Err(VoiceError::Protocol("SDP answer was empty".to_string()));
        }

        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{body_string, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn token() -> SessionToken {
        SessionToken::new("ek_test", Duration::from_secs(60), "rest-1", "user-1")
    }

    #[tokio::test]
    async fn test_exchange_returns_answer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/realtime"))
            .and(query_param("model", "gpt-4o-realtime-preview-2024-12-17"))
            .and(header("authorization", "Bearer ek_test"))
            .and(header("content-type", "application/sdp"))
            .and(body_string("v=0 offer"))
            .respond_with(ResponseTemplate::new(201).set_body_string("v=0 answer"))
            .expect(1)
            .mount(&server)
            .await;

        let exchange = HttpSdpExchange::new(
            &format!("{}/v1/realtime", server.uri()),
            RealtimeModel::default(),
        );
        let answer = exchange.exchange("v=0 offer", &token()).await.unwrap();
        assert_eq!(answer, "v=0 answer");
    }

    #[tokio::test]
    async fn test_non_success_keeps_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let exchange = HttpSdpExchange::new(&server.uri(), RealtimeModel::default());
        let err = exchange.exchange("v=0", &token()).await.unwrap_err();
        assert_eq!(err.status(), Some(503));
        assert_eq!(err.to_string(), "OpenAI SDP exchange failed: 503");
    }

    #[tokio::test]
    async fn test_transport_failure_is_network_error() {
        // Nothing listens on port 9 locally
        let exchange = HttpSdpExchange::new("http://127.0.0.1:9", RealtimeModel::default());
        let err = exchange.exchange("v=0", &token()).await.unwrap_err();
        assert!(matches!(err, VoiceError::Network(_)));
    }
}
