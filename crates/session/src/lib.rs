// cowrite-session: the collaboration core embedded by editors and the CLI.

pub mod binding;
pub mod config;
pub mod context;
pub mod engine;
pub mod manager;
pub mod transport;

pub use binding::{CursorBinding, DocumentBinding, EditorExtension, RemoteCursor};
pub use config::{ClientConfig, ConfigError};
pub use context::SessionContext;
pub use engine::awareness::{AwarenessChange, AwarenessChannel, AwarenessError, ChangeOrigin};
pub use engine::doc::{DocError, ReplicatedDoc, UpdateSource};
pub use engine::listeners::ListenerId;
pub use manager::{CollabSession, SessionConfig, SessionManager};
pub use transport::{MemoryRelay, Transport, TransportError, TransportHandle, WsTransport};
