//! Token service and SDP signaling doubles

use super::MockStats;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use waav_voice::core::realtime::{
    SdpExchange, SessionToken, TokenScope, TokenSource, VoiceError, VoiceResult,
};

pub const MOCK_ANSWER_SDP: &str = "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\ns=answer\r\n";

// =============================================================================
// Token Source
// =============================================================================

pub struct MockTokenSource {
    ttl: Mutex<Duration>,
    fail: Mutex<Option<VoiceError>>,
    delay: Mutex<Option<Duration>>,
    menu_context: Mutex<Option<String>>,
    scopes: Mutex<Vec<TokenScope>>,
    credentials: Mutex<Vec<String>>,
    pub stats: MockStats,
}

impl Default for MockTokenSource {
    fn default() -> Self {
        Self {
            ttl: Mutex::new(Duration::from_secs(60)),
            fail: Mutex::new(None),
            delay: Mutex::new(None),
            menu_context: Mutex::new(None),
            scopes: Mutex::new(Vec::new()),
            credentials: Mutex::new(Vec::new()),
            stats: MockStats::default(),
        }
    }
}

impl MockTokenSource {
    pub fn fail_with(&self, error: VoiceError) {
        *self.fail.lock() = Some(error);
    }

    pub fn succeed(&self) {
        *self.fail.lock() = None;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn set_ttl(&self, ttl: Duration) {
        *self.ttl.lock() = ttl;
    }

    pub fn set_menu_context(&self, menu: impl Into<String>) {
        *self.menu_context.lock() = Some(menu.into());
    }

    pub fn calls(&self) -> u64 {
        self.stats.calls()
    }

    pub fn scopes(&self) -> Vec<TokenScope> {
        self.scopes.lock().clone()
    }

    pub fn credentials(&self) -> Vec<String> {
        self.credentials.lock().clone()
    }
}

#[async_trait]
impl TokenSource for MockTokenSource {
    async fn fetch_token(&self, auth_token: &str, scope: &TokenScope) -> VoiceResult<SessionToken> {
        self.scopes.lock().push(scope.clone());
        self.credentials.lock().push(auth_token.to_string());

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(err) = self.fail.lock().clone() {
            self.stats.record_failure();
            return Err(err);
        }
        self.stats.record_call();

        let n = self.stats.calls();
        let ttl = *self.ttl.lock();
        Ok(SessionToken::new(
            format!("ek_mock_{n}"),
            ttl,
            scope.restaurant_id.clone(),
            scope.client_id.clone(),
        )
        .with_menu_context(self.menu_context.lock().clone()))
    }
}

// =============================================================================
// SDP Exchange
// =============================================================================

#[derive(Debug, Clone)]
pub enum SdpMode {
    /// Answer immediately.
    Answer,
    /// Never respond.
    Hang,
    Fail(VoiceError),
    /// Signal `started`, wait for `release`, then fail as if the socket was reset.
    Gated,
}

pub struct MockSdpExchange {
    mode: Mutex<SdpMode>,
    offers: Mutex<Vec<String>>,
    tokens: Mutex<Vec<String>>,
    pub started: Arc<Notify>,
    pub release: Arc<Notify>,
    pub stats: MockStats,
}

impl Default for MockSdpExchange {
    fn default() -> Self {
        Self {
            mode: Mutex::new(SdpMode::Answer),
            offers: Mutex::new(Vec::new()),
            tokens: Mutex::new(Vec::new()),
            started: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
            stats: MockStats::default(),
        }
    }
}

impl MockSdpExchange {
    pub fn set_mode(&self, mode: SdpMode) {
        *self.mode.lock() = mode;
    }

    pub fn offers(&self) -> Vec<String> {
        self.offers.lock().clone()
    }

    /// Token values presented, in order.
    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().clone()
    }
}

#[async_trait]
impl SdpExchange for MockSdpExchange {
    async fn exchange(&self, offer_sdp: &str, token: &SessionToken) -> VoiceResult<String> {
        self.offers.lock().push(offer_sdp.to_string());
        self.tokens.lock().push(token.value().to_string());

        let mode = self.mode.lock().clone();
        match mode {
            SdpMode::Answer => {
                self.stats.record_call();
                Ok(MOCK_ANSWER_SDP.to_string())
            }
            SdpMode::Hang => {
                self.stats.record_timeout();
                std::future::pending::<VoiceResult<String>>().await
            }
            SdpMode::Fail(err) => {
                self.stats.record_failure();
                Err(err)
            }
            SdpMode::Gated => {
                self.started.notify_one();
                self.release.notified().await;
                self.stats.record_failure();
                Err(VoiceError::Network("connection reset by peer".to_string()))
            }
        }
    }
}
