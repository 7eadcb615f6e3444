// `cowrite join`: stay in a room, reporting status, roster and document
// changes. Lines read from stdin are appended to the document.

use anyhow::Context;
use clap::Args;
use cowrite_common::identity::resolve_color;
use cowrite_common::{ConnectionStatus, Participant, ProfilePatch, UserProfile};
use cowrite_session::{ClientConfig, UpdateSource};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::mpsc;
use tracing::debug;

use super::{block_on, document_binding, resolve_host, session_context};
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct JoinArgs {
    /// Room identifier.
    #[arg(long)]
    pub room: String,

    /// Relay host; defaults to `relay_host` from the config file.
    #[arg(long)]
    pub host: Option<String>,

    /// Display name for this session.
    #[arg(long)]
    pub name: Option<String>,

    /// Palette key (`blue`) or `#rrggbb`.
    #[arg(long)]
    pub color: Option<String>,

    /// Force JSON output.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JoinEvent {
    Joined { room: String, host: String, user: UserProfile },
    Status { status: ConnectionStatus },
    Roster { participants: Vec<Participant> },
    Text { text: String },
}

pub fn run(args: JoinArgs, config: &ClientConfig) -> anyhow::Result<()> {
    let format = OutputFormat::detect(args.json);
    let outcome = execute(args, config, format);
    if let Err(error) = &outcome {
        output::print_anyhow_error(format, error);
    }
    outcome
}

fn execute(args: JoinArgs, config: &ClientConfig, format: OutputFormat) -> anyhow::Result<()> {
    let host = resolve_host(args.host, config)?;
    let user = profile_for(config, args.name.as_deref(), args.color.as_deref())?;
    block_on(join(config, host, args.room, user, format))?
}

/// The configured profile with `--name` / `--color` applied on top.
pub(crate) fn profile_for(
    config: &ClientConfig,
    name: Option<&str>,
    color: Option<&str>,
) -> anyhow::Result<UserProfile> {
    let mut patch = ProfilePatch::default();
    if let Some(name) = name.map(str::trim).filter(|name| !name.is_empty()) {
        patch.name = Some(name.to_string());
    }
    if let Some(color) = color {
        let hex = resolve_color(color).with_context(|| {
            format!("unknown color `{color}` (use a palette key like `blue` or #rrggbb)")
        })?;
        patch.color = Some(hex);
    }
    Ok(config.profile().merged(&patch))
}

async fn join(
    config: &ClientConfig,
    host: String,
    room: String,
    user: UserProfile,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let context = session_context(config, host.clone(), user.clone());
    let session = context.open(&room);
    let binding = document_binding(&session)
        .with_context(|| format!("could not open a session for room `{room}` on {host}"))?;
    emit(format, &JoinEvent::Joined { room, host, user })?;

    let (remote_tx, mut remote_rx) = mpsc::unbounded_channel();
    let _subscription = binding.observe(move |source| {
        if source == UpdateSource::Remote {
            let _ = remote_tx.send(());
        }
    })?;

    let mut status = session.status();
    let mut roster = session.subscribe_roster();
    let mut stdin = Some(BufReader::new(tokio::io::stdin()).lines());
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let current = *status.borrow_and_update();
    emit(format, &JoinEvent::Status { status: current })?;

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                emit(format, &JoinEvent::Status { status: current })?;
            }
            changed = roster.changed() => {
                if changed.is_err() {
                    break;
                }
                let participants = roster.borrow_and_update().clone();
                emit(format, &JoinEvent::Roster { participants })?;
            }
            Some(()) = remote_rx.recv() => {
                while remote_rx.try_recv().is_ok() {}
                emit(format, &JoinEvent::Text { text: binding.text() })?;
            }
            line = next_line(&mut stdin) => match line.context("failed to read stdin")? {
                Some(line) => {
                    binding.insert(binding.len(), &format!("{line}\n"))?;
                    emit(format, &JoinEvent::Text { text: binding.text() })?;
                }
                None => {
                    debug!("stdin closed; staying in the room");
                    stdin = None;
                }
            },
        }
    }

    context.dispose();
    Ok(())
}

async fn next_line(lines: &mut Option<Lines<BufReader<Stdin>>>) -> std::io::Result<Option<String>> {
    match lines {
        Some(lines) => lines.next_line().await,
        None => std::future::pending().await,
    }
}

fn emit(format: OutputFormat, event: &JoinEvent) -> anyhow::Result<()> {
    output::print_output(format, event, format_event)?;
    Ok(())
}

fn format_event(event: &JoinEvent) -> String {
    match event {
        JoinEvent::Joined { room, host, user } => {
            format!("joined {room} on {host} as {} ({})", user.name, user.color)
        }
        JoinEvent::Status { status } => format!("status: {status}"),
        JoinEvent::Roster { participants } if participants.is_empty() => {
            "present: nobody".to_string()
        }
        JoinEvent::Roster { participants } => {
            let names: Vec<String> =
                participants.iter().map(|p| format!("{} ({})", p.name(), p.color())).collect();
            format!("present: {}", names.join(", "))
        }
        JoinEvent::Text { text } => format!("--- document ---\n{text}"),
    }
}
