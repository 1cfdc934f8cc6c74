//! Push-to-talk turn state machine.
//!
//! ```text
//! idle --start--> recording --stop--> committing --> waiting_user_final
//!   ^                                                      |
//!   |                                         transcript completed
//!   |                                                      v
//!   +------------------- response done ------------ waiting_response
//! ```
//!
//! Side effects (microphone gating, control messages) go through
//! [`TurnEffects`] so the machine itself stays synchronous and testable.

use std::time::Duration;

use tokio::time::Instant;

use super::base::{ConnectionState, TurnAction, TurnState, VoiceError, VoiceResult};
use super::openai::ClientEvent;

/// Repeated stop requests inside this window collapse into one commit.
pub const STOP_DEBOUNCE: Duration = Duration::from_millis(250);

/// Effects the coordinator needs from the transport.
pub trait TurnEffects {
    fn set_microphone(&self, enabled: bool);
    fn send(&self, event: ClientEvent) -> VoiceResult<()>;
}

/// Result of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Committed,
    /// A commit for this press already went out.
    Debounced,
}

#[derive(Debug)]
pub struct TurnCoordinator {
    state: TurnState,
    last_stop: Option<Instant>,
    debounce: Duration,
    /// Push-to-talk: the client commits audio and requests responses itself.
    manual_commit: bool,
}

impl Default for TurnCoordinator {
    fn default() -> Self {
        Self::new(true)
    }
}

impl TurnCoordinator {
    pub fn new(manual_commit: bool) -> Self {
        Self {
            state: TurnState::Idle,
            last_stop: None,
            debounce: STOP_DEBOUNCE,
            manual_commit,
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    fn reject(&self, action: TurnAction) -> VoiceError {
        tracing::debug!(state = %self.state, %action, "Rejected turn transition");
        VoiceError::InvalidTurnTransition {
            from: self.state,
            action,
        }
    }

    /// Open the microphone for a new user turn.
    pub fn start_recording(
        &mut self,
        connection: ConnectionState,
        effects: &dyn TurnEffects,
    ) -> VoiceResult<TurnState> {
        if connection != ConnectionState::Connected || self.state != TurnState::Idle {
            return Err(self.reject(TurnAction::StartRecording));
        }

        if self.manual_commit {
            // Drop anything captured since the last commit
            effects.send(ClientEvent::InputAudioBufferClear)?;
        }
        effects.set_microphone(true);
        self.state = TurnState::Recording;
        Ok(self.state)
    }

    /// Close the microphone and hand the buffered audio to the server.
    pub fn stop_recording(
        &mut self,
        now: Instant,
        effects: &dyn TurnEffects,
    ) -> VoiceResult<StopOutcome> {
        if self.state != TurnState::Recording {
            if let Some(last) = self.last_stop
                && now.saturating_duration_since(last) < self.debounce
            {
                tracing::trace!(state = %self.state, "Stop request debounced");
                return Ok(StopOutcome::Debounced);
            }
            return Err(self.reject(TurnAction::StopRecording));
        }

        self.last_stop = Some(now);
        effects.set_microphone(false);
        self.state = TurnState::Committing;

        if self.manual_commit {
            let sent = effects
                .send(ClientEvent::InputAudioBufferCommit)
                .and_then(|()| effects.send(ClientEvent::ResponseCreate));
            if let Err(e) = sent {
                tracing::warn!(error = %e, "Audio commit failed; turn abandoned");
                self.state = TurnState::Idle;
                return Err(e);
            }
        }

        self.state = TurnState::WaitingUserFinal;
        Ok(StopOutcome::Committed)
    }

    /// The final user transcript for the committed audio arrived.
    pub fn on_transcript_completed(&mut self) -> VoiceResult<TurnState> {
        if self.state != TurnState::WaitingUserFinal {
            return Err(self.reject(TurnAction::TranscriptCompleted));
        }
        self.state = TurnState::WaitingResponse;
        Ok(self.state)
    }

    /// The assistant finished responding.
    ///
    /// Also accepted while still waiting for the user transcript; transcription
    /// can fail or arrive after the response.
    pub fn on_response_completed(&mut self) -> VoiceResult<TurnState> {
        if !matches!(
            self.state,
            TurnState::WaitingResponse | TurnState::WaitingUserFinal
        ) {
            return Err(self.reject(TurnAction::ResponseCompleted));
        }
        self.state = TurnState::Idle;
        Ok(self.state)
    }

    /// Back to idle with the microphone closed.
    pub fn reset(&mut self, effects: &dyn TurnEffects) {
        effects.set_microphone(false);
        self.state = TurnState::Idle;
        self.last_stop = None;
    }
}
