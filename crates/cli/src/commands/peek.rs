// `cowrite peek`: connect, wait for the relay's copy, print it and leave.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Args;
use cowrite_common::Participant;
use cowrite_session::{ClientConfig, UpdateSource};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

use super::{block_on, document_binding, resolve_host, session_context};
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct PeekArgs {
    /// Room identifier.
    #[arg(long)]
    pub room: String,

    /// Relay host; defaults to `relay_host` from the config file.
    #[arg(long)]
    pub host: Option<String>,

    /// How long to wait for the connection and the initial sync.
    #[arg(long, default_value_t = 1500)]
    pub wait_ms: u64,

    /// Force JSON output.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeekResult {
    pub room: String,
    pub host: String,
    pub text: String,
    pub length: u32,
    pub synced: bool,
    pub participants: Vec<Participant>,
}

pub fn run(args: PeekArgs, config: &ClientConfig) -> anyhow::Result<()> {
    let format = OutputFormat::detect(args.json);
    let outcome = resolve_host(args.host.clone(), config).and_then(|host| {
        block_on(peek(config, host, args.room.clone(), Duration::from_millis(args.wait_ms)))?
    });

    match outcome {
        Ok(result) => {
            if !result.synced {
                output::print_warning(
                    format,
                    "NOT_SYNCED",
                    &format!("no document state arrived within {}ms", args.wait_ms),
                );
            }
            output::print_output(format, &result, format_human)?;
            Ok(())
        }
        Err(e) => {
            output::print_anyhow_error(format, &e);
            Err(e)
        }
    }
}

pub(crate) async fn peek(
    config: &ClientConfig,
    host: String,
    room: String,
    wait: Duration,
) -> anyhow::Result<PeekResult> {
    let context = session_context(config, host.clone(), config.profile());
    let session = context.open(&room);
    let binding = document_binding(&session)
        .with_context(|| format!("could not open a session for room `{room}` on {host}"))?;

    let synced = Arc::new(Notify::new());
    let notify = Arc::clone(&synced);
    let _subscription = binding.observe(move |source| {
        if source == UpdateSource::Remote {
            notify.notify_one();
        }
    })?;

    let deadline = Instant::now() + wait;
    let mut status = session.status();
    let connected = timeout_at(deadline, status.wait_for(|status| status.is_connected()))
        .await
        .map(|changed| changed.is_ok())
        .unwrap_or(false);
    if !connected {
        context.dispose();
        anyhow::bail!("could not reach relay {host} within {}ms", wait.as_millis());
    }

    // The relay's state arrives as a step-2 frame right after the handshake.
    let synced = timeout_at(deadline, synced.notified()).await.is_ok();
    let result = PeekResult {
        room,
        host,
        text: binding.text(),
        length: binding.len(),
        synced,
        participants: session.roster(),
    };
    context.dispose();
    Ok(result)
}

fn format_human(result: &PeekResult) -> String {
    let names: Vec<&str> = result.participants.iter().map(|p| p.name()).collect();
    let mut lines = vec![format!("{} @ {} ({} chars)", result.room, result.host, result.length)];
    if !names.is_empty() {
        lines.push(format!("present: {}", names.join(", ")));
    }
    lines.push(String::new());
    lines.push(result.text.clone());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use cowrite_common::UserProfile;
    use cowrite_relay::{build_router, serve, RelayState};
    use cowrite_session::{SessionConfig, SessionManager};
    use tokio::net::TcpListener;

    fn sample_result() -> PeekResult {
        PeekResult {
            room: "doc-1".into(),
            host: "relay.example".into(),
            text: "hello world".into(),
            length: 11,
            synced: true,
            participants: vec![Participant {
                id: 7,
                profile: UserProfile::new("Ben", "#34d399"),
                cursor: None,
            }],
        }
    }

    #[test]
    fn human_format_shows_header_presence_and_text() {
        let output = format_human(&sample_result());
        assert!(output.starts_with("doc-1 @ relay.example (11 chars)"));
        assert!(output.contains("present: Ben"));
        assert!(output.ends_with("hello world"));
    }

    #[test]
    fn json_carries_flattened_participants() {
        let value = serde_json::to_value(sample_result()).unwrap();
        assert_eq!(value["participants"][0]["name"], "Ben");
        assert_eq!(value["synced"], true);
    }

    #[tokio::test]
    async fn peek_reads_text_from_a_live_room() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = listener.local_addr().unwrap().to_string();
        let router = build_router(RelayState::default());
        let server = tokio::spawn(async move {
            serve(listener, router, std::future::pending()).await.unwrap();
        });

        let writer = SessionManager::websocket().start(SessionConfig::new(
            Some("doc-1".into()),
            Some(host.clone()),
            UserProfile::new("Ava", "#60a5fa"),
        ));
        let deadline = Instant::now() + Duration::from_secs(5);
        while !writer.is_connected() {
            assert!(Instant::now() < deadline, "writer should connect");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        document_binding(&writer).unwrap().insert(0, "seeded").unwrap();

        let mut result = None;
        while Instant::now() < deadline {
            let peeked = peek(
                &ClientConfig::default(),
                host.clone(),
                "doc-1".into(),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
            if peeked.text == "seeded" {
                result = Some(peeked);
                break;
            }
        }
        let result = result.expect("peek should see the seeded text");
        assert!(result.synced);
        assert_eq!(result.length, 6);

        writer.stop();
        server.abort();
    }

    #[tokio::test]
    async fn peek_reports_unreachable_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = peek(&ClientConfig::default(), host, "doc-1".into(), Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("could not reach relay"));
    }
}
