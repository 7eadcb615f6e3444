// CLI subcommand dispatch and the helpers the commands share.

use std::future::Future;
use std::path::Path;

use anyhow::Context;
use clap::Subcommand;
use cowrite_common::UserProfile;
use cowrite_session::{
    ClientConfig, CollabSession, DocumentBinding, EditorExtension, SessionContext,
    SessionManager, WsTransport,
};

pub mod join;
pub mod peek;
pub mod whoami;

#[derive(Subcommand)]
pub enum Command {
    /// Join a room: live status and roster, stdin lines appended to the document
    Join(join::JoinArgs),
    /// Print a room's document text and exit
    Peek(peek::PeekArgs),
    /// Show the identity used for sessions
    Whoami(whoami::WhoamiArgs),
}

pub fn run(cmd: Command, config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    match cmd {
        Command::Join(args) => join::run(args, &config),
        Command::Peek(args) => peek::run(args, &config),
        Command::Whoami(args) => whoami::run(args, &config),
    }
}

pub(crate) fn load_config(path: Option<&Path>) -> anyhow::Result<ClientConfig> {
    match path {
        Some(path) => ClientConfig::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => ClientConfig::load().context("failed to load ~/.cowrite/config.toml"),
    }
}

/// `--host` wins over the config file.
pub(crate) fn resolve_host(flag: Option<String>, config: &ClientConfig) -> anyhow::Result<String> {
    flag.or_else(|| config.relay_host.clone())
        .filter(|host| !host.trim().is_empty())
        .context("no relay host: pass --host or set relay_host in ~/.cowrite/config.toml")
}

pub(crate) fn block_on<F: Future>(future: F) -> anyhow::Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    Ok(runtime.block_on(future))
}

pub(crate) fn session_context(
    config: &ClientConfig,
    host: String,
    user: UserProfile,
) -> SessionContext {
    let manager = SessionManager::new(WsTransport::with_policy(config.reconnect_policy()))
        .with_throttle(config.throttle());
    SessionContext::new(manager, Some(host), user)
}

pub(crate) fn document_binding(session: &CollabSession) -> Option<DocumentBinding> {
    session.extensions().into_iter().find_map(|extension| match extension {
        EditorExtension::Document(binding) => Some(binding),
        EditorExtension::CursorPresence(_) => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn host_flag_overrides_config() {
        let config =
            ClientConfig { relay_host: Some("relay.example".into()), ..ClientConfig::default() };
        assert_eq!(resolve_host(Some("localhost:1999".into()), &config).unwrap(), "localhost:1999");
        assert_eq!(resolve_host(None, &config).unwrap(), "relay.example");
    }

    #[test]
    fn missing_host_is_an_error() {
        let err = resolve_host(Some("  ".into()), &ClientConfig::default()).unwrap_err();
        assert!(format!("{err:#}").contains("no relay host"));
    }

    #[test]
    fn explicit_config_path_is_loaded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "relay_host = \"relay.example\"\n").unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.relay_host.as_deref(), Some("relay.example"));

        std::fs::write(&path, "relay_host = [").unwrap();
        assert!(load_config(Some(&path)).is_err());
    }
}
