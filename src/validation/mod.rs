//! Command validation: target syntax, per-kind parameters and resolvability.

mod host;
mod resolver;

pub use host::*;
pub use resolver::*;

#[cfg(test)]
pub(crate) use resolver::test_server;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::watch;

use crate::session::{Command, DiagnosticKind, Parameters};

/// Validation error types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Invalid hostname or IP address")]
    InvalidHost,
    #[error("{0}")]
    InvalidParameters(String),
    #[error("Unable to resolve hostname")]
    UnresolvableHost,
    /// The target changed while its lookup was pending
    #[error("validation superseded by a newer target")]
    Superseded,
}

/// A command that passed the local checks and awaits the resolvability check.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub kind: DiagnosticKind,
    pub target: String,
    pub parameters: Parameters,
    pub form: HostForm,
    ticket: u64,
}

#[derive(Debug, Clone, Copy)]
struct CachedLookup {
    resolvable: bool,
    at: Instant,
}

struct Inner {
    resolver: DohResolver,
    cache_ttl: Duration,
    cache: Mutex<HashMap<String, CachedLookup>>,
    /// Bumped whenever the target of a kind changes
    tickets: [watch::Sender<u64>; 3],
}

/// Validates commands before dispatch. Cheap to clone; clones share the
/// lookup cache and pending-check state.
#[derive(Clone)]
pub struct ValidationService {
    inner: Arc<Inner>,
}

impl ValidationService {
    pub fn new(resolver: DohResolver, cache_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                resolver,
                cache_ttl,
                cache: Mutex::new(HashMap::new()),
                tickets: [watch::channel(0).0, watch::channel(0).0, watch::channel(0).0],
            }),
        }
    }

    /// Full validation: local checks, then resolvability for domain names.
    pub async fn validate(
        &self,
        kind: DiagnosticKind,
        target: &str,
        parameters: &Parameters,
    ) -> Result<Command, ValidationError> {
        let candidate = self.check_local(kind, target, parameters)?;
        self.resolve(candidate).await
    }

    /// Syntax and parameter checks only; never suspends.
    ///
    /// Starting a new check for `kind` supersedes any lookup still pending for it.
    pub fn check_local(
        &self,
        kind: DiagnosticKind,
        target: &str,
        parameters: &Parameters,
    ) -> Result<Candidate, ValidationError> {
        let ticket = self.bump(kind);
        let (target, form) = check_host(target)?;
        let parameters = check_parameters(kind, parameters)?;
        Ok(Candidate {
            kind,
            target,
            parameters,
            form,
            ticket,
        })
    }

    /// Discard any pending lookup for `kind`, e.g. because the user edited the target.
    pub fn invalidate(&self, kind: DiagnosticKind) {
        self.bump(kind);
    }

    /// Resolvability check. Literal addresses skip it; cached answers are reused.
    pub async fn resolve(&self, candidate: Candidate) -> Result<Command, ValidationError> {
        let Candidate {
            kind,
            target,
            parameters,
            form,
            ticket,
        } = candidate;

        if form == HostForm::Literal {
            return Ok(Command::new(kind, target, parameters).with_ticket(ticket));
        }

        let resolvable = match self.cached(&target) {
            Some(resolvable) => resolvable,
            None => {
                let mut ticket_rx = self.ticket_sender(kind).subscribe();
                let resolvable = tokio::select! {
                    resolvable = self.inner.resolver.is_resolvable(&target) => resolvable,
                    _ = superseded(&mut ticket_rx, ticket) => {
                        tracing::debug!("Validation: dropped stale lookup for {}", target);
                        return Err(ValidationError::Superseded);
                    }
                };
                self.remember(&target, resolvable);
                resolvable
            }
        };

        if *self.ticket_sender(kind).borrow() != ticket {
            return Err(ValidationError::Superseded);
        }
        if !resolvable {
            return Err(ValidationError::UnresolvableHost);
        }
        Ok(Command::new(kind, target, parameters).with_ticket(ticket))
    }

    /// Whether no newer check for the command's kind has started since it
    /// was validated.
    pub fn is_current(&self, command: &Command) -> bool {
        *self.ticket_sender(command.kind()).borrow() == command.ticket()
    }

    /// Cached resolvability of `target`, if still fresh.
    pub fn cached(&self, target: &str) -> Option<bool> {
        let mut cache = self.inner.cache.lock().unwrap_or_else(PoisonError::into_inner);
        match cache.get(target) {
            Some(entry) if entry.at.elapsed() < self.inner.cache_ttl => Some(entry.resolvable),
            Some(_) => {
                cache.remove(target);
                None
            }
            None => None,
        }
    }

    fn remember(&self, target: &str, resolvable: bool) {
        let mut cache = self.inner.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.insert(
            target.to_string(),
            CachedLookup {
                resolvable,
                at: Instant::now(),
            },
        );
    }

    fn ticket_sender(&self, kind: DiagnosticKind) -> &watch::Sender<u64> {
        let slot = match kind {
            DiagnosticKind::Ping => 0,
            DiagnosticKind::Dig => 1,
            DiagnosticKind::Traceroute => 2,
        };
        &self.inner.tickets[slot]
    }

    fn bump(&self, kind: DiagnosticKind) -> u64 {
        let sender = self.ticket_sender(kind);
        sender.send_modify(|t| *t += 1);
        let ticket = *sender.borrow();
        ticket
    }
}

/// Resolves once the ticket moves past `ticket`.
async fn superseded(rx: &mut watch::Receiver<u64>, ticket: u64) {
    loop {
        if *rx.borrow_and_update() != ticket {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
