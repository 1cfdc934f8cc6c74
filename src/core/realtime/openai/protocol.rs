//! Control channel protocol: wire JSON in, typed [`ControlEvent`]s out.
//!
//! The decoder is the only place that decides whether a piece of transcript
//! text is interim or final. Incremental fragments are buffered per item and a
//! single `TranscriptCompleted` carrying the full text is produced when the
//! server marks the item done.
//!
//! Function-call messages are forwarded verbatim as [`OrderPayload`]s. Menu
//! semantics belong to the order-processing collaborator; nothing here looks
//! inside the arguments.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use super::messages::{ApiError, ClientEvent, ServerEvent};
use crate::core::realtime::base::{VoiceError, VoiceResult};

/// Who produced a transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptRole {
    User,
    Assistant,
}

impl fmt::Display for TranscriptRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TranscriptRole::User => write!(f, "user"),
            TranscriptRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// Structured function call emitted by the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderPayload {
    pub call_id: String,
    /// Function name; empty when the server never announced it
    pub name: String,
    /// Raw JSON arguments exactly as received
    pub arguments: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
}

impl OrderPayload {
    /// Parse the raw arguments as JSON.
    pub fn arguments_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_str(&self.arguments)
    }
}

/// Typed events decoded from the control channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    SessionCreated {
        session_id: String,
    },
    SessionUpdated,
    SpeechStarted {
        audio_start_ms: u64,
    },
    SpeechStopped {
        audio_end_ms: u64,
    },
    AudioCommitted {
        item_id: String,
    },
    /// Interim text; `text` is everything accumulated so far for the item
    TranscriptDelta {
        role: TranscriptRole,
        item_id: String,
        text: String,
    },
    TranscriptCompleted {
        role: TranscriptRole,
        item_id: String,
        text: String,
    },
    OrderDetected(OrderPayload),
    ResponseStarted {
        response_id: String,
    },
    ResponseCompleted {
        response_id: String,
    },
    RateLimitExceeded {
        message: String,
        retry_after_ms: Option<u64>,
    },
    SessionExpired {
        message: String,
    },
    Error {
        code: Option<String>,
        message: String,
    },
}

/// Stateful decoder / stateless encoder for the control channel.
#[derive(Debug, Default)]
pub struct ControlChannelProtocol {
    /// Partial transcripts keyed by speaker and item
    transcripts: HashMap<(TranscriptRole, String), String>,
    /// call_id -> function name, announced before the arguments complete
    function_names: HashMap<String, String>,
    /// call_id -> partial arguments
    function_arguments: HashMap<String, String>,
    verbose: bool,
}

impl ControlChannelProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log every inbound message at debug level instead of trace.
    pub fn with_verbose_logging(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Drop all partial state. Called between connections.
    pub fn reset(&mut self) {
        self.transcripts.clear();
        self.function_names.clear();
        self.function_arguments.clear();
    }

    /// Whether any transcript fragment is waiting for its completion marker.
    pub fn has_pending_transcripts(&self) -> bool {
        !self.transcripts.is_empty()
    }

    /// Encode a client event for the data channel.
    pub fn encode(event: &ClientEvent) -> VoiceResult<String> {
        serde_json::to_string(event)
            .map_err(|e| VoiceError::Protocol(format!("Failed to encode {}: {e}", event.kind())))
    }

    /// Decode one inbound message.
    ///
    /// Returns `Ok(None)` for messages that carry nothing for consumers,
    /// including unknown message types. Malformed JSON yields
    /// `VoiceError::Protocol`; the caller logs it and keeps the channel open.
    pub fn decode(&mut self, raw: &str) -> VoiceResult<Option<ControlEvent>> {
        if self.verbose {
            tracing::debug!(message = raw, "control channel message");
        } else {
            tracing::trace!(message = raw, "control channel message");
        }

        let event: ServerEvent = serde_json::from_str(raw)
            .map_err(|e| VoiceError::Protocol(format!("Malformed server message: {e}")))?;

        Ok(self.translate(event))
    }

    fn translate(&mut self, event: ServerEvent) -> Option<ControlEvent> {
        match event {
            ServerEvent::SessionCreated { session } => {
                tracing::info!(session_id = %session.id, "Realtime session created");
                Some(ControlEvent::SessionCreated {
                    session_id: session.id,
                })
            }

            ServerEvent::SessionUpdated { session } => {
                tracing::debug!(session_id = %session.id, "Realtime session updated");
                Some(ControlEvent::SessionUpdated)
            }

            ServerEvent::SessionExpired { message } => Some(ControlEvent::SessionExpired {
                message: message.unwrap_or_else(|| "session expired".to_string()),
            }),

            ServerEvent::RateLimitExceeded {
                message,
                retry_after_ms,
            } => Some(ControlEvent::RateLimitExceeded {
                message: message.unwrap_or_else(|| "rate limit exceeded".to_string()),
                retry_after_ms,
            }),

            ServerEvent::RateLimitsUpdated { rate_limits } => {
                for limit in rate_limits.iter().filter(|l| l.remaining == 0) {
                    tracing::warn!(
                        name = %limit.name,
                        reset_seconds = limit.reset_seconds,
                        "Realtime rate limit bucket exhausted"
                    );
                }
                None
            }

            ServerEvent::Error { error } => Some(Self::translate_error(error)),

            ServerEvent::SpeechStarted { audio_start_ms, .. } => {
                Some(ControlEvent::SpeechStarted { audio_start_ms })
            }

            ServerEvent::SpeechStopped { audio_end_ms, .. } => {
                Some(ControlEvent::SpeechStopped { audio_end_ms })
            }

            ServerEvent::InputAudioBufferCommitted { item_id } => {
                Some(ControlEvent::AudioCommitted { item_id })
            }

            ServerEvent::ConversationItemCreated { item } | ServerEvent::OutputItemAdded { item } => {
                if item.is_function_call()
                    && let (Some(call_id), Some(name)) = (item.call_id, item.name)
                {
                    tracing::debug!(call_id = %call_id, name = %name, "Tracking function call");
                    self.function_names.insert(call_id, name);
                }
                None
            }

            ServerEvent::TranscriptionDelta { item_id, delta } => {
                Some(self.push_fragment(TranscriptRole::User, item_id, &delta))
            }

            ServerEvent::TranscriptionCompleted {
                item_id,
                transcript,
            } => Some(self.complete(TranscriptRole::User, item_id, transcript)),

            ServerEvent::TranscriptionFailed { item_id, error } => {
                self.transcripts.remove(&(TranscriptRole::User, item_id.clone()));
                tracing::warn!(item_id = %item_id, "Input transcription failed: {}", error.message);
                None
            }

            ServerEvent::AudioTranscriptDelta { item_id, delta }
            | ServerEvent::TextDelta { item_id, delta } => {
                Some(self.push_fragment(TranscriptRole::Assistant, item_id, &delta))
            }

            ServerEvent::AudioTranscriptDone {
                item_id,
                transcript: text,
            }
            | ServerEvent::TextDone { item_id, text } => {
                Some(self.complete(TranscriptRole::Assistant, item_id, text))
            }

            ServerEvent::FunctionCallArgumentsDelta { call_id, delta } => {
                self.function_arguments
                    .entry(call_id)
                    .or_default()
                    .push_str(&delta);
                None
            }

            ServerEvent::FunctionCallArgumentsDone {
                call_id,
                arguments,
                name,
                item_id,
            } => {
                let buffered = self.function_arguments.remove(&call_id);
                let tracked = self.function_names.remove(&call_id);
                let name = name.or(tracked).unwrap_or_else(|| {
                    tracing::warn!(call_id = %call_id, "Function name not announced for call");
                    String::new()
                });
                let arguments = if arguments.is_empty() {
                    buffered.unwrap_or_default()
                } else {
                    arguments
                };
                tracing::debug!(call_id = %call_id, name = %name, "Function call complete");
                Some(ControlEvent::OrderDetected(OrderPayload {
                    call_id,
                    name,
                    arguments,
                    item_id,
                }))
            }

            ServerEvent::ResponseCreated { response } => Some(ControlEvent::ResponseStarted {
                response_id: response.id,
            }),

            ServerEvent::ResponseDone { response } => Some(ControlEvent::ResponseCompleted {
                response_id: response.id,
            }),

            ServerEvent::Unknown => None,
        }
    }

    fn translate_error(error: ApiError) -> ControlEvent {
        if error.is_rate_limit() {
            ControlEvent::RateLimitExceeded {
                message: error.message,
                retry_after_ms: None,
            }
        } else if error.is_session_expired() {
            ControlEvent::SessionExpired {
                message: error.message,
            }
        } else {
            tracing::error!(
                error_type = %error.error_type,
                code = ?error.code,
                "Realtime API error: {}",
                error.message
            );
            ControlEvent::Error {
                code: error.code,
                message: error.message,
            }
        }
    }

    fn push_fragment(&mut self, role: TranscriptRole, item_id: String, delta: &str) -> ControlEvent {
        let buffer = self
            .transcripts
            .entry((role, item_id.clone()))
            .or_default();
        buffer.push_str(delta);
        ControlEvent::TranscriptDelta {
            role,
            item_id,
            text: buffer.clone(),
        }
    }

    fn complete(&mut self, role: TranscriptRole, item_id: String, text: String) -> ControlEvent {
        let buffered = self.transcripts.remove(&(role, item_id.clone()));
        // The completion marker normally repeats the full text; fall back to
        // the fragments when it does not.
        let text = if text.is_empty() {
            buffered.unwrap_or_default()
        } else {
            text
        };
        ControlEvent::TranscriptCompleted {
            role,
            item_id,
            text,
        }
    }
}
