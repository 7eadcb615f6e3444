use std::net::SocketAddr;
use std::time::Duration;

use cowrite_common::{ConnectionStatus, ProfilePatch, UserProfile};
use cowrite_relay::{build_router, serve, RelayState};
use cowrite_session::engine::doc::DEFAULT_FIELD;
use cowrite_session::transport::ReconnectPolicy;
use cowrite_session::{CollabSession, EditorExtension, SessionConfig, SessionManager, WsTransport};
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::time::Instant;

const WAIT: Duration = Duration::from_secs(5);

async fn start_relay() -> (String, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("test listener should bind");
    let addr = listener.local_addr().expect("listener should expose local address");
    let router = build_router(RelayState::default());
    let task = tokio::spawn(async move {
        serve(listener, router, std::future::pending()).await.expect("relay should run");
    });
    (addr.to_string(), task)
}

/// A relay on its own runtime. Shutting the runtime down drops every
/// connection task with it, which aborting the serve task alone would not.
fn start_isolated_relay(addr: SocketAddr) -> std::io::Result<Runtime> {
    let listener = std::net::TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    let runtime =
        tokio::runtime::Builder::new_multi_thread().worker_threads(1).enable_all().build()?;
    runtime.spawn(async move {
        let listener = TcpListener::from_std(listener).expect("listener should register");
        let router = build_router(RelayState::default());
        serve(listener, router, std::future::pending()).await.expect("relay should run");
    });
    Ok(runtime)
}

async fn restart_relay_on(addr: SocketAddr) -> Runtime {
    let deadline = Instant::now() + WAIT;
    loop {
        match start_isolated_relay(addr) {
            Ok(runtime) => return runtime,
            Err(error) => {
                assert!(Instant::now() < deadline, "could not rebind {addr}: {error}");
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn names(session: &CollabSession) -> Vec<String> {
    session.roster().iter().map(|p| p.name().to_string()).collect()
}

fn document_binding(session: &CollabSession) -> cowrite_session::DocumentBinding {
    match session.extensions().into_iter().next() {
        Some(EditorExtension::Document(binding)) => binding,
        _ => panic!("first extension should be the document binding"),
    }
}

#[tokio::test]
async fn websocket_sessions_share_presence_and_text() {
    let (host, server) = start_relay().await;
    let manager = SessionManager::websocket();
    let config = |user| SessionConfig::new(Some("doc-1".into()), Some(host.clone()), user);

    let a = manager.start(config(UserProfile::new("Ava", "#60a5fa")));
    let b = manager.start(config(UserProfile::new("Ben", "#34d399")));
    assert!(a.is_ready() && b.is_ready());

    eventually("both sessions connected", || a.is_connected() && b.is_connected()).await;
    eventually("rosters to include each other", || {
        names(&a).contains(&"Ben".to_string()) && names(&b).contains(&"Ava".to_string())
    })
    .await;

    a.update_local_user(&ProfilePatch::name("Ava R."));
    eventually("renamed profile to reach Ben", || names(&b).contains(&"Ava R.".to_string())).await;
    assert!(!names(&b).contains(&"Ava".to_string()));

    document_binding(&a).insert(0, "hello").unwrap();
    eventually("Ava's text to reach Ben", || document_binding(&b).text() == "hello").await;
    document_binding(&b).insert(5, " world").unwrap();
    eventually("text to converge", || {
        let on_a = a.document().unwrap().get_text_string(DEFAULT_FIELD);
        let on_b = b.document().unwrap().get_text_string(DEFAULT_FIELD);
        on_a == on_b && on_a == "hello world"
    })
    .await;

    a.stop();
    assert_eq!(a.connection_status(), ConnectionStatus::Disconnected);
    eventually("Ava to leave Ben's roster", || !names(&b).contains(&"Ava R.".to_string())).await;

    b.stop();
    server.abort();
}

#[tokio::test]
async fn unreachable_relay_reports_disconnected_without_erroring() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let host = listener.local_addr().unwrap().to_string();
    drop(listener);

    let session = SessionManager::websocket().start(SessionConfig::new(
        Some("doc-1".into()),
        Some(host),
        UserProfile::new("Ava", "#60a5fa"),
    ));
    assert!(session.enabled());
    assert!(session.is_ready());
    eventually("status to report the failed attempt", || {
        session.connection_status() == ConnectionStatus::Disconnected
    })
    .await;
    assert_eq!(names(&session), vec!["Ava".to_string()]);
    session.stop();
}

#[tokio::test]
async fn sessions_recover_after_relay_restart() {
    let addr: SocketAddr = {
        let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        reserved.local_addr().unwrap()
    };
    let relay = restart_relay_on(addr).await;

    let manager =
        SessionManager::new(WsTransport::with_policy(ReconnectPolicy::from_millis(20, 100)));
    let config = |user| SessionConfig::new(Some("doc-1".into()), Some(addr.to_string()), user);
    let a = manager.start(config(UserProfile::new("Ava", "#60a5fa")));
    let b = manager.start(config(UserProfile::new("Ben", "#34d399")));

    eventually("rosters to include each other", || {
        names(&a).contains(&"Ben".to_string()) && names(&b).contains(&"Ava".to_string())
    })
    .await;
    document_binding(&a).insert(0, "before").unwrap();
    eventually("text to reach Ben", || document_binding(&b).text() == "before").await;

    relay.shutdown_background();
    eventually("Ava to report the outage", || {
        a.connection_status() == ConnectionStatus::Disconnected
    })
    .await;
    eventually("Ben to leave Ava's roster", || !names(&a).contains(&"Ben".to_string())).await;
    assert_eq!(names(&a), vec!["Ava".to_string()]);

    let relay = restart_relay_on(addr).await;
    eventually("both sessions to reconnect", || a.is_connected() && b.is_connected()).await;
    eventually("rosters to recover", || {
        names(&a).contains(&"Ben".to_string()) && names(&b).contains(&"Ava".to_string())
    })
    .await;

    document_binding(&b).insert(6, " and after").unwrap();
    eventually("text to converge after reconnect", || {
        document_binding(&a).text() == "before and after"
            && document_binding(&b).text() == "before and after"
    })
    .await;

    a.stop();
    b.stop();
    relay.shutdown_background();
}

#[tokio::test]
async fn stopped_session_ignores_later_relay_frames() {
    let (host, server) = start_relay().await;
    let manager = SessionManager::websocket();
    let config = |user| SessionConfig::new(Some("doc-1".into()), Some(host.clone()), user);
    let a = manager.start(config(UserProfile::new("Ava", "#60a5fa")));
    let b = manager.start(config(UserProfile::new("Ben", "#34d399")));
    eventually("Ava to see Ben", || names(&a).contains(&"Ben".to_string())).await;

    let awareness = a.awareness().unwrap();
    let doc = a.document().unwrap();
    let ben_id = b.awareness().unwrap().client_id();
    a.stop();

    for i in 0..20 {
        document_binding(&b).insert(0, "x").unwrap();
        b.update_local_user(&ProfilePatch::name(format!("Ben {i}")));
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(!awareness.snapshot().contains_key(&ben_id));
    assert_eq!(doc.get_text_string(DEFAULT_FIELD), "");

    b.stop();
    server.abort();
}
