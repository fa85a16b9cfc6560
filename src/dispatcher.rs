//! Orchestration: validate, rate-limit, send, and route executor events back
//! into the session store.

use thiserror::Error;

use crate::channel::{ChannelError, ChannelManager, Delivery, InboundMessage};
use crate::ratelimit::RateLimiter;
use crate::session::{Command, DiagnosticKind, Parameters, SessionStore};
use crate::validation::{Candidate, ValidationError, ValidationService};

/// Why a submission did not reach the executor.
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("{0}")]
    Invalid(#[from] ValidationError),
    #[error("rate limited, retry in {retry_in_ms}ms")]
    RateLimited { retry_in_ms: u64 },
    #[error("not connected")]
    NotConnected,
    #[error("send failed: {0}")]
    Send(ChannelError),
}

/// Owns every piece of client state; there is no shared global context.
pub struct Dispatcher {
    validator: ValidationService,
    limiter: RateLimiter,
    channel: ChannelManager,
    sessions: SessionStore,
}

impl Dispatcher {
    pub fn new(
        validator: ValidationService,
        limiter: RateLimiter,
        channel: ChannelManager,
        sessions: SessionStore,
    ) -> Self {
        Self {
            validator,
            limiter,
            channel,
            sessions,
        }
    }

    /// Validate and send a command for `kind`.
    pub async fn submit(
        &mut self,
        kind: DiagnosticKind,
        target: &str,
        parameters: &Parameters,
    ) -> Result<(), SubmitError> {
        let candidate = self.precheck(kind, target, parameters)?;
        let command = self.validator.resolve(candidate).await?;
        self.dispatch(command)
    }

    /// Precheck a repeat of a remembered dig query; `index` 0 is the newest.
    pub fn precheck_history(&mut self, index: usize) -> Option<Result<Candidate, SubmitError>> {
        let entry = self.sessions.history().get(index).cloned()?;
        Some(self.precheck(DiagnosticKind::Dig, &entry.target, &entry.parameters()))
    }

    /// Local checks plus the connection check. Never suspends.
    ///
    /// While the channel is down the run is recorded as failed right away and
    /// neither the resolvability check nor the rate limiter is consulted.
    pub fn precheck(
        &mut self,
        kind: DiagnosticKind,
        target: &str,
        parameters: &Parameters,
    ) -> Result<Candidate, SubmitError> {
        let candidate = self.validator.check_local(kind, target, parameters)?;

        if !self.channel.is_connected() {
            tracing::warn!("Dispatcher: {} {} not sent, channel is down", kind, candidate.target);
            self.sessions.begin_run(kind, &candidate.target, &candidate.parameters);
            self.sessions.apply_error(kind, "not connected");
            return Err(SubmitError::NotConnected);
        }
        Ok(candidate)
    }

    /// Rate-limit and send a fully validated command. A command whose kind
    /// has been re-checked since it was validated is dropped.
    pub fn dispatch(&mut self, command: Command) -> Result<(), SubmitError> {
        let kind = command.kind();

        if !self.validator.is_current(&command) {
            tracing::debug!("Dispatcher: dropped superseded {} {}", kind, command.target());
            return Err(ValidationError::Superseded.into());
        }
        if !self.limiter.admit() {
            let retry_in_ms = self.limiter.next_available_in_ms();
            tracing::info!("Dispatcher: {} rate limited, next slot in {}ms", kind, retry_in_ms);
            return Err(SubmitError::RateLimited { retry_in_ms });
        }

        self.sessions
            .begin_run(kind, command.target(), command.parameters());

        match self.channel.send(&command) {
            Ok(()) => {
                tracing::info!("Dispatcher: sent {} {}", kind, command.target());
                Ok(())
            }
            Err(ChannelError::NotConnected) => {
                self.sessions.apply_error(kind, "not connected");
                Err(SubmitError::NotConnected)
            }
            Err(e) => {
                tracing::error!("Dispatcher: failed to send {}: {}", kind, e);
                self.sessions.apply_error(kind, &e.to_string());
                Err(SubmitError::Send(e))
            }
        }
    }

    /// Apply one executor event. Returns false if it came from a superseded
    /// connection and was discarded.
    ///
    /// Events for a kind that is not running are still applied.
    pub fn route_inbound(&mut self, delivery: Delivery) -> bool {
        if !self.channel.is_current(delivery.connection) {
            tracing::debug!(
                "Dispatcher: discarded {} event from connection {}",
                delivery.message.kind(),
                delivery.connection
            );
            return false;
        }

        match delivery.message {
            InboundMessage::Fragment { kind, text, .. } => {
                self.sessions.apply_fragment(kind, &text);
            }
            InboundMessage::Error { kind, message } => {
                tracing::warn!("Dispatcher: executor reported {} failure: {}", kind, message);
                self.sessions.apply_error(kind, &message);
            }
            InboundMessage::Completion { kind, ended_at, .. } => {
                self.sessions.apply_completion(kind, ended_at);
            }
        }
        true
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn sessions_mut(&mut self) -> &mut SessionStore {
        &mut self.sessions
    }

    pub fn channel(&self) -> &ChannelManager {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut ChannelManager {
        &mut self.channel
    }

    pub fn validator(&self) -> &ValidationService {
        &self.validator
    }

    /// Commands still admissible in the current window.
    pub fn rate_remaining(&mut self) -> usize {
        self.limiter.remaining()
    }
}
