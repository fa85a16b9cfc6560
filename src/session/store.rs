//! Session store: one session per diagnostic kind, persisted on every mutation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::{DbError, SnapshotWriter, Store};
use crate::parser;

use super::models::{DiagnosticKind, Parameters, QueryHistoryEntry, Session};

/// Fixed key the snapshot is stored under.
pub const SNAPSHOT_KEY: &str = "netdiag.sessions";

/// How many completed dig queries are remembered.
pub const HISTORY_LIMIT: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMap {
    pub ping: Session,
    pub dig: Session,
    pub traceroute: Session,
}

impl Default for SessionMap {
    fn default() -> Self {
        Self {
            ping: Session::empty(DiagnosticKind::Ping),
            dig: Session::empty(DiagnosticKind::Dig),
            traceroute: Session::empty(DiagnosticKind::Traceroute),
        }
    }
}

impl SessionMap {
    fn get(&self, kind: DiagnosticKind) -> &Session {
        match kind {
            DiagnosticKind::Ping => &self.ping,
            DiagnosticKind::Dig => &self.dig,
            DiagnosticKind::Traceroute => &self.traceroute,
        }
    }

    fn get_mut(&mut self, kind: DiagnosticKind) -> &mut Session {
        match kind {
            DiagnosticKind::Ping => &mut self.ping,
            DiagnosticKind::Dig => &mut self.dig,
            DiagnosticKind::Traceroute => &mut self.traceroute,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot {
    active_kind: DiagnosticKind,
    sessions: SessionMap,
    #[serde(default)]
    dig_history: Vec<QueryHistoryEntry>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotRef<'a> {
    active_kind: DiagnosticKind,
    sessions: &'a SessionMap,
    dig_history: &'a [QueryHistoryEntry],
}

/// Handle returned by [`SessionStore::on_change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type ChangeCallback = Box<dyn FnMut(DiagnosticKind, &Session) + Send>;

struct Observer {
    id: SubscriptionId,
    kind: Option<DiagnosticKind>,
    callback: ChangeCallback,
}

/// Holds the three sessions for the lifetime of the process.
pub struct SessionStore {
    sessions: SessionMap,
    active: DiagnosticKind,
    dig_history: Vec<QueryHistoryEntry>,
    writer: Option<SnapshotWriter>,
    observers: Vec<Observer>,
    next_subscription: u64,
}

impl SessionStore {
    /// A store with no backing snapshot.
    pub fn new() -> Self {
        Self {
            sessions: SessionMap::default(),
            active: DiagnosticKind::Ping,
            dig_history: Vec::new(),
            writer: None,
            observers: Vec::new(),
            next_subscription: 0,
        }
    }

    /// Restore from the snapshot in `store`, and write back to it from now on.
    /// Writes happen on a background thread; dropping the store flushes them.
    ///
    /// A missing or unreadable snapshot starts every session empty.
    pub fn open(store: Store) -> Result<Self, DbError> {
        let mut sessions = Self::new();

        match store.get(SNAPSHOT_KEY)? {
            Some(raw) => match serde_json::from_str::<Snapshot>(&raw) {
                Ok(snapshot) => {
                    sessions.sessions = snapshot.sessions;
                    sessions.active = snapshot.active_kind;
                    sessions.dig_history = snapshot.dig_history;
                    sessions.dig_history.truncate(HISTORY_LIMIT);
                    for kind in DiagnosticKind::ALL {
                        sessions.sessions.get_mut(kind).refresh_aggregates(kind);
                    }
                    tracing::info!("SessionStore: restored snapshot (active: {})", sessions.active);
                }
                Err(e) => {
                    tracing::warn!("SessionStore: ignoring unreadable snapshot: {}", e);
                }
            },
            None => tracing::info!("SessionStore: no snapshot found, starting empty"),
        }

        sessions.writer = Some(SnapshotWriter::spawn(store, SNAPSHOT_KEY)?);
        Ok(sessions)
    }

    pub fn get(&self, kind: DiagnosticKind) -> &Session {
        self.sessions.get(kind)
    }

    pub fn active_kind(&self) -> DiagnosticKind {
        self.active
    }

    /// Switch the active kind. Runs of other kinds keep accumulating.
    pub fn set_active(&mut self, kind: DiagnosticKind) {
        if self.active == kind {
            return;
        }
        self.active = kind;
        self.committed(kind);
    }

    /// Recent completed dig queries, newest first.
    pub fn history(&self) -> &[QueryHistoryEntry] {
        &self.dig_history
    }

    /// Reset `kind` for a new run of `target`.
    pub fn begin_run(&mut self, kind: DiagnosticKind, target: &str, parameters: &Parameters) {
        let session = self.sessions.get_mut(kind);
        *session = Session::empty(kind);
        session.target = target.to_string();
        session.parameters = parameters.clone();
        session.running = true;
        self.committed(kind);
    }

    /// Feed a fragment of tool output to the kind's parser.
    pub fn apply_fragment(&mut self, kind: DiagnosticKind, text: &str) -> usize {
        let produced = parser::consume(kind, self.sessions.get_mut(kind), text, Utc::now());
        self.committed(kind);
        produced
    }

    pub fn apply_completion(&mut self, kind: DiagnosticKind, ended_at: Option<DateTime<Utc>>) {
        let session = self.sessions.get_mut(kind);
        let was_running = session.running;
        session.running = false;

        if kind == DiagnosticKind::Dig && was_running && !session.records.is_empty() {
            let entry = QueryHistoryEntry {
                target: session.target.clone(),
                record_type: session
                    .parameters
                    .get(kind.parameter_name())
                    .cloned()
                    .unwrap_or_default(),
                completed_at: ended_at.unwrap_or_else(Utc::now),
                record_count: session.records.len(),
            };
            self.dig_history.insert(0, entry);
            self.dig_history.truncate(HISTORY_LIMIT);
        }
        self.committed(kind);
    }

    /// Record a failure into the output and end the run; records are kept.
    pub fn apply_error(&mut self, kind: DiagnosticKind, message: &str) {
        let session = self.sessions.get_mut(kind);
        session.raw_output.push(format!("Error: {}", message));
        session.running = false;
        self.committed(kind);
    }

    /// Subscribe to mutations of one kind, or of every kind with `None`.
    pub fn on_change<F>(&mut self, kind: Option<DiagnosticKind>, callback: F) -> SubscriptionId
    where
        F: FnMut(DiagnosticKind, &Session) + Send + 'static,
    {
        self.next_subscription += 1;
        let id = SubscriptionId(self.next_subscription);
        self.observers.push(Observer {
            id,
            kind,
            callback: Box::new(callback),
        });
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|o| o.id != id);
        self.observers.len() != before
    }

    /// Queue the full state for writing, then notify observers of `kind`.
    fn committed(&mut self, kind: DiagnosticKind) {
        if let Err(e) = self.persist() {
            tracing::error!("SessionStore: failed to encode snapshot: {}", e);
        }

        let session = self.sessions.get(kind);
        for observer in self.observers.iter_mut() {
            if observer.kind.map_or(true, |k| k == kind) {
                (observer.callback)(kind, session);
            }
        }
    }

    fn persist(&self) -> Result<(), DbError> {
        let Some(writer) = &self.writer else {
            return Ok(());
        };
        let snapshot = SnapshotRef {
            active_kind: self.active,
            sessions: &self.sessions,
            dig_history: &self.dig_history,
        };
        writer.submit(serde_json::to_string(&snapshot)?);
        Ok(())
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tempfile::NamedTempFile;

    fn params(kind: DiagnosticKind) -> Parameters {
        kind.default_parameters()
    }

    #[test]
    fn test_begin_run_resets_kind() {
        let mut store = SessionStore::new();
        store.begin_run(DiagnosticKind::Ping, "8.8.8.8", &params(DiagnosticKind::Ping));
        store.apply_fragment(DiagnosticKind::Ping, "PING 8.8.8.8");
        store.apply_fragment(DiagnosticKind::Ping, "64 bytes from 8.8.8.8: icmp_seq=1 time=4.0 ms");
        assert_eq!(store.get(DiagnosticKind::Ping).records.len(), 1);

        store.begin_run(DiagnosticKind::Ping, "1.1.1.1", &params(DiagnosticKind::Ping));
        let session = store.get(DiagnosticKind::Ping);
        assert!(session.running);
        assert_eq!(session.target, "1.1.1.1");
        assert!(session.raw_output.is_empty());
        assert!(session.records.is_empty());
    }

    #[test]
    fn test_error_keeps_partial_records() {
        let mut store = SessionStore::new();
        store.begin_run(DiagnosticKind::Traceroute, "example.com", &params(DiagnosticKind::Traceroute));
        store.apply_fragment(DiagnosticKind::Traceroute, "traceroute to example.com");
        store.apply_fragment(DiagnosticKind::Traceroute, "1 gw (10.0.0.1) 1.0 ms");
        store.apply_error(DiagnosticKind::Traceroute, "command timed out");

        let session = store.get(DiagnosticKind::Traceroute);
        assert!(!session.running);
        assert_eq!(session.records.len(), 1);
        assert_eq!(session.raw_output.last().unwrap(), "Error: command timed out");
    }

    #[test]
    fn test_dig_completion_records_history() {
        let mut store = SessionStore::new();
        for i in 0..7 {
            let target = format!("host{}.example.com", i);
            store.begin_run(DiagnosticKind::Dig, &target, &params(DiagnosticKind::Dig));
            store.apply_fragment(DiagnosticKind::Dig, "; <<>> DiG <<>>");
            store.apply_fragment(DiagnosticKind::Dig, "@ 60 IN A 10.0.0.1");
            store.apply_completion(DiagnosticKind::Dig, None);
        }
        // Empty answers are not remembered
        store.begin_run(DiagnosticKind::Dig, "empty.example.com", &params(DiagnosticKind::Dig));
        store.apply_completion(DiagnosticKind::Dig, None);

        let history = store.history();
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history[0].target, "host6.example.com");
        assert_eq!(history[0].record_type, "A");
        assert_eq!(history[0].record_count, 1);
    }

    #[test]
    fn test_observers_filter_by_kind() {
        let mut store = SessionStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let id = store.on_change(Some(DiagnosticKind::Dig), move |kind, session| {
            sink.lock().unwrap().push((kind, session.running));
        });
        let all = Arc::new(Mutex::new(0));
        let counter = all.clone();
        store.on_change(None, move |_, _| *counter.lock().unwrap() += 1);

        store.begin_run(DiagnosticKind::Ping, "8.8.8.8", &params(DiagnosticKind::Ping));
        store.begin_run(DiagnosticKind::Dig, "example.com", &params(DiagnosticKind::Dig));
        assert!(store.unsubscribe(id));
        store.apply_completion(DiagnosticKind::Dig, None);

        assert_eq!(*seen.lock().unwrap(), vec![(DiagnosticKind::Dig, true)]);
        assert_eq!(*all.lock().unwrap(), 3);
        assert!(!store.unsubscribe(id));
    }

    #[test]
    fn test_snapshot_reload_is_identical() {
        let tmp = NamedTempFile::new().unwrap();
        let before = {
            let mut store = SessionStore::open(Store::new(tmp.path()).unwrap()).unwrap();
            store.begin_run(DiagnosticKind::Ping, "8.8.8.8", &params(DiagnosticKind::Ping));
            store.apply_fragment(DiagnosticKind::Ping, "PING 8.8.8.8 (8.8.8.8) 56(84) bytes of data.");
            store.apply_fragment(DiagnosticKind::Ping, "64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.3 ms");
            store.apply_fragment(DiagnosticKind::Ping, "64 bytes from 8.8.8.8: icmp_seq=2 ttl=117 time=14.1 ms");
            store.apply_completion(DiagnosticKind::Ping, None);

            store.begin_run(DiagnosticKind::Dig, "example.com", &params(DiagnosticKind::Dig));
            store.apply_fragment(DiagnosticKind::Dig, "; <<>> DiG <<>>\n@ 300 IN A 93.184.216.34");

            store.begin_run(DiagnosticKind::Traceroute, "example.com", &params(DiagnosticKind::Traceroute));
            store.apply_fragment(DiagnosticKind::Traceroute, "traceroute to example.com\n1 *\n1 gw (10.0.0.1) 2.3 ms");
            store.set_active(DiagnosticKind::Dig);
            store.sessions.clone()
        };

        let restored = SessionStore::open(Store::new(tmp.path()).unwrap()).unwrap();
        assert_eq!(restored.active_kind(), DiagnosticKind::Dig);
        for kind in DiagnosticKind::ALL {
            assert_eq!(restored.get(kind), before.get(kind), "{} differs", kind);
        }
        // The dig run never completed, so it is restored as still running
        assert!(restored.get(DiagnosticKind::Dig).running);
    }

    #[test]
    fn test_missing_or_corrupt_snapshot_starts_empty() {
        let store = Store::in_memory().unwrap();
        store.put(SNAPSHOT_KEY, "{not json").unwrap();
        let sessions = SessionStore::open(store).unwrap();
        for kind in DiagnosticKind::ALL {
            assert_eq!(sessions.get(kind), &Session::empty(kind));
        }
        assert_eq!(sessions.active_kind(), DiagnosticKind::Ping);
    }
}
