//! netdiag - headless driver for the diagnostic session engine.
//!
//! Reads commands from stdin and prints tool output as it streams in.

use netdiag::channel::ChannelManager;
use netdiag::config::ClientConfig;
use netdiag::db::Store;
use netdiag::dispatcher::{Dispatcher, SubmitError};
use netdiag::ratelimit::RateLimiter;
use netdiag::session::{Command, DiagnosticKind, Session, SessionStore};
use netdiag::validation::{Candidate, DohResolver, ValidationError, ValidationService};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "commands: ping|dig|traceroute <target> [value], use <kind>, show [kind], history [n], status, quit";

#[derive(Debug, PartialEq)]
enum Input {
    Run {
        kind: DiagnosticKind,
        target: String,
        value: Option<String>,
    },
    Use(DiagnosticKind),
    Show(Option<DiagnosticKind>),
    History(Option<usize>),
    Status,
    Quit,
}

fn parse_input(line: &str) -> Result<Option<Input>, String> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some((first, rest)) = words.split_first() else {
        return Ok(None);
    };

    let input = match (*first, rest) {
        ("quit" | "exit", []) => Input::Quit,
        ("status", []) => Input::Status,
        ("use", [kind]) => Input::Use(kind.parse().map_err(|e| format!("{}", e))?),
        ("show", []) => Input::Show(None),
        ("show", [kind]) => Input::Show(Some(kind.parse().map_err(|e| format!("{}", e))?)),
        ("history", []) => Input::History(None),
        ("history", [n]) => Input::History(Some(
            n.parse().map_err(|_| format!("not a history index: {}", n))?,
        )),
        (tool, args) => {
            let kind: DiagnosticKind = tool.parse().map_err(|_| USAGE.to_string())?;
            match args {
                [target] => Input::Run {
                    kind,
                    target: target.to_string(),
                    value: None,
                },
                [target, value] => Input::Run {
                    kind,
                    target: target.to_string(),
                    value: Some(value.to_string()),
                },
                _ => return Err(format!("usage: {} <target> [{}]", kind, kind.parameter_name())),
            }
        }
    };
    Ok(Some(input))
}

/// Prints raw output lines as they arrive, and the statistics when a run ends.
fn printer() -> impl FnMut(DiagnosticKind, &Session) + Send + 'static {
    let mut printed = [0usize; 3];
    let mut running = [false; 3];

    move |kind, session| {
        let slot = kind as usize;
        if session.raw_output.len() < printed[slot] {
            printed[slot] = 0;
        }
        for line in &session.raw_output[printed[slot]..] {
            println!("[{}] {}", kind, line);
        }
        printed[slot] = session.raw_output.len();

        if running[slot] && !session.running {
            match serde_json::to_string(&session.aggregates) {
                Ok(stats) => println!("[{}] done: {}", kind, stats),
                Err(e) => tracing::warn!("Driver: cannot render stats: {}", e),
            }
        }
        running[slot] = session.running;
    }
}

fn show(sessions: &SessionStore, kind: DiagnosticKind) {
    let session = sessions.get(kind);
    println!(
        "{} {} {:?} running={} records={} complete={}",
        kind,
        session.target,
        session.parameters,
        session.running,
        session.records.len(),
        session.output_complete
    );
    match serde_json::to_string_pretty(&session.aggregates) {
        Ok(stats) => println!("{}", stats),
        Err(e) => tracing::warn!("Driver: cannot render stats: {}", e),
    }
}

/// Run the resolvability check for a prechecked command on a spawned task.
fn start_submission(
    dispatcher: &Dispatcher,
    kind: DiagnosticKind,
    prechecked: Result<Candidate, SubmitError>,
    checked: &mpsc::UnboundedSender<Result<Command, ValidationError>>,
) {
    match prechecked {
        Ok(candidate) => {
            let validator = dispatcher.validator().clone();
            let checked = checked.clone();
            tokio::spawn(async move {
                let _ = checked.send(validator.resolve(candidate).await);
            });
        }
        Err(e) => println!("{}: {}", kind, e),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Logs go to stderr so they don't interleave with tool output
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("netdiag=info".parse()?))
        .init();

    let cfg = ClientConfig::load();
    tracing::info!("Starting netdiag against {}", cfg.executor_url);
    tracing::info!("Using database at {}", cfg.db_path);

    let store = Store::new(&cfg.db_path)?;
    let mut sessions = SessionStore::open(store)?;
    sessions.on_change(None, printer());

    let (mut channel, mut deliveries) = ChannelManager::new(&cfg.executor_url, cfg.reconnect.clone());
    channel.start();
    let mut channel_state = channel.subscribe_state();

    let resolver = DohResolver::new(&cfg.doh_url, cfg.resolve_timeout)?;
    let validator = ValidationService::new(resolver, cfg.resolve_cache_ttl);
    let limiter = RateLimiter::new(cfg.rate_limit, cfg.rate_window);
    let mut dispatcher = Dispatcher::new(validator, limiter, channel, sessions);

    let (checked_tx, mut checked_rx) = mpsc::unbounded_channel();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{}", USAGE);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let input = match parse_input(&line) {
                    Ok(Some(input)) => input,
                    Ok(None) => continue,
                    Err(e) => {
                        println!("{}", e);
                        continue;
                    }
                };
                match input {
                    Input::Run { kind, target, value } => {
                        let mut parameters = kind.default_parameters();
                        if let Some(value) = value {
                            parameters.insert(kind.parameter_name().to_string(), value);
                        }
                        dispatcher.sessions_mut().set_active(kind);
                        let prechecked = dispatcher.precheck(kind, &target, &parameters);
                        start_submission(&dispatcher, kind, prechecked, &checked_tx);
                    }
                    Input::Use(kind) => dispatcher.sessions_mut().set_active(kind),
                    Input::Show(kind) => {
                        let kind = kind.unwrap_or_else(|| dispatcher.sessions().active_kind());
                        show(dispatcher.sessions(), kind);
                    }
                    Input::History(None) => {
                        for (i, entry) in dispatcher.sessions().history().iter().enumerate() {
                            println!(
                                "{}: {} {} ({} records, {})",
                                i,
                                entry.target,
                                entry.record_type,
                                entry.record_count,
                                entry.completed_at.format("%Y-%m-%d %H:%M:%S")
                            );
                        }
                    }
                    Input::History(Some(index)) => {
                        dispatcher.sessions_mut().set_active(DiagnosticKind::Dig);
                        match dispatcher.precheck_history(index) {
                            Some(prechecked) => {
                                start_submission(&dispatcher, DiagnosticKind::Dig, prechecked, &checked_tx);
                            }
                            None => println!("no history entry {}", index),
                        }
                    }
                    Input::Status => {
                        let active = dispatcher.sessions().active_kind();
                        let remaining = dispatcher.rate_remaining();
                        println!(
                            "channel={:?} connection={} active={} rate_remaining={}",
                            dispatcher.channel().state(),
                            dispatcher.channel().connection_id(),
                            active,
                            remaining
                        );
                    }
                    Input::Quit => break,
                }
            }
            Some(delivery) = deliveries.recv() => {
                dispatcher.route_inbound(delivery);
            }
            Some(checked) = checked_rx.recv() => match checked {
                Ok(command) => {
                    let kind = command.kind();
                    match dispatcher.dispatch(command) {
                        Ok(()) | Err(SubmitError::Invalid(ValidationError::Superseded)) => {}
                        Err(e) => println!("{}: {}", kind, e),
                    }
                }
                Err(ValidationError::Superseded) => {}
                Err(e) => println!("{}", e),
            },
            Ok(()) = channel_state.changed() => {
                let state = *channel_state.borrow_and_update();
                tracing::info!("Driver: channel {:?}", state);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    dispatcher.channel_mut().stop();
    tracing::info!("Shutting down");
    Ok(())
}
