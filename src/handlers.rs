//! # Session Handlers
//!
//! Contains the core HTTP/WebSocket logic of the gateway:
//! - Establishing sessions (`POST /connect/...`) by spawning a connector
//!   and waiting on its handshake outcome
//! - Binding the primary WebSocket and running its reader/driver loops
//! - Attaching read-only monitors, lazily starting MONITOR-mode
//!   connectors where the session shape needs one
//! - Admin-initiated close and the shared offline teardown
//!
//! Every attached socket (primary or monitor) gets an outbound pump
//! draining an unbounded queue, so fan-out never blocks on a slow peer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::{Bytes, BytesMut};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::channels::{self, BridgeEnds};
use crate::error::{GatewayError, Result};
use crate::guac::{self, Instruction};
use crate::guacd::{self, GuacParams};
use crate::protocol::{
    RelayAction, RelayRequest, WindowSize, ADMIN_CLOSE_BANNER, FRAME_DATA, FRAME_HEARTBEAT,
    FRAME_WINDOW,
};
use crate::ssh;
use crate::state::{
    observer_key, AppState, ClientTx, MonitorEntry, Session, SessionStatus, SessionType,
};
use crate::storage;

/// Output coalescing granularity: upstream bytes are batched and drained
/// to the client on this boundary.
const FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Empty-frame keep-alive cadence on SSH sessions; doubles as a
/// liveness probe.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

// ─── Caller Identity ────────────────────────────────────────────

/// Identity injected by the fronting authentication layer.
///
/// The gateway does not authenticate; it trusts the `x-bastion-*`
/// headers the auth proxy stamps onto every forwarded request.
#[derive(Debug, Clone)]
pub struct Identity {
    pub uid: i64,
    pub username: String,
    pub is_admin: bool,
    pub cookie: String,
    pub accept_language: String,
    pub client_ip: String,
}

impl Identity {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let text = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string()
        };
        let client_ip = {
            let forwarded = text("x-forwarded-for");
            forwarded
                .split(',')
                .next()
                .unwrap_or("")
                .trim()
                .to_string()
        };
        Self {
            uid: text("x-bastion-uid").parse().unwrap_or(0),
            username: text("x-bastion-user"),
            is_admin: text("x-bastion-role") == "admin",
            cookie: text("cookie"),
            accept_language: text("accept-language"),
            client_ip,
        }
    }
}

// ─── Session Establishment ──────────────────────────────────────

/// `POST /connect/{asset_id}/{account_id}/{protocol}` — Establishes a
/// session by spawning the matching connector and waiting on its
/// handshake outcome. The WebSocket bind happens on a separate GET once
/// this returns the session record.
pub async fn create_session(
    State(state): State<AppState>,
    Path((asset_id, account_id, protocol)): Path<(i64, i64, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>> {
    let who = Identity::from_headers(&headers);
    let (bus, connector, bridge) = channels::make();
    let (result_tx, result_rx) = oneshot::channel();

    if protocol == "ssh" {
        let term = WindowSize::from_query(&query, 80, 24, 0);
        let request = RelayRequest {
            uid: who.uid,
            username: who.username.clone(),
            client_ip: who.client_ip.clone(),
            cookie: who.cookie.clone(),
            accept_language: who.accept_language.clone(),
            asset_id,
            account_id,
            protocol: protocol.clone(),
            action: RelayAction::New,
            session_id: String::new(),
        };
        tokio::spawn(ssh::run_session(
            state.clone(),
            request,
            term,
            bus,
            connector,
            bridge,
            result_tx,
        ));
    } else if guac::split_protocol(&protocol).is_some() {
        let size = WindowSize::from_query(&query, 1024, 768, 96);
        let params = GuacParams {
            uid: who.uid,
            username: who.username.clone(),
            client_ip: who.client_ip.clone(),
            asset_id,
            account_id,
            protocol: protocol.clone(),
        };
        tokio::spawn(guacd::run_session(
            state.clone(),
            params,
            size,
            bus,
            connector,
            bridge,
            result_tx,
        ));
    } else {
        return Err(GatewayError::InvalidArgument(format!("protocol {protocol}")));
    }

    let response = result_rx.await.map_err(|_| {
        GatewayError::ConnectServer("connector exited before the handshake".to_string())
    })??;

    // The connector inserted the session before resolving the outcome;
    // a miss here means we raced its teardown.
    let session = state
        .registry
        .load(&response.session_id)
        .map_err(|_| GatewayError::LoadSession(response.session_id.clone()))?;
    let record = storage::SessionRecord::of(&session, SessionStatus::Online, None);
    Ok(Json(serde_json::json!({ "code": 0, "data": record })))
}

// ─── Primary WebSocket ──────────────────────────────────────────

/// `GET /connect/{session_id}` — Upgrades and binds the primary client
/// to a just-created session. A session accepts exactly one primary
/// WebSocket for its whole life.
pub async fn bind_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let session = match state.registry.load(&session_id) {
        Ok(session) => session,
        Err(e) => return e.into_response(),
    };
    if !session.try_attach() {
        return GatewayError::InvalidSessionId(session_id).into_response();
    }
    let Some(bridge) = session.take_bridge() else {
        return GatewayError::LoadSession(session_id).into_response();
    };
    let term = WindowSize::from_query(&query, 80, 24, 0);
    ws.on_upgrade(move |socket| serve_primary(session, bridge, term, socket))
}

/// Runs the primary client's reader and driver until the session ends.
async fn serve_primary(
    session: Arc<Session>,
    bridge: BridgeEnds,
    term: WindowSize,
    socket: WebSocket,
) {
    let session_id = session.meta.session_id.clone();
    let Some(bus) = session.bus() else {
        // A WEB session always carries its bus; losing it means the
        // connector is already gone.
        return;
    };
    info!("Client bound to session {}", session_id);

    let (ws_sink, ws_stream) = socket.split();

    // ── Outbound Pump ──
    // Drains the message queue and sends each frame over the WebSocket.
    let (client_tx, client_rx) = mpsc::unbounded_channel::<Message>();
    let outbound = tokio::spawn(pump_outbound(ws_sink, client_rx));

    // Seed the upstream terminal geometry from the upgrade request.
    if session.is_ssh() {
        let _ = bus.window.send(term).await;
    }

    // ── Reader ──
    let reader = tokio::spawn(read_client_frames(session.clone(), ws_stream));

    // ── Driver ──
    drive_session(&session, bridge, &client_tx, bus.away.clone()).await;

    // Either loop ending tears the whole session down.
    session.shut_away();
    reader.abort();
    let _ = client_tx.send(Message::Close(None));
    drop(client_tx);
    let _ = outbound.await;
    info!("Client unbound from session {}", session_id);
}

/// Reads client frames onto the bus until the client disconnects.
///
/// SSH frames dispatch on their first byte; graphical frames are pushed
/// whole (the guacd connector filters them).
async fn read_client_frames(session: Arc<Session>, mut ws_stream: SplitStream<WebSocket>) {
    let Some(bus) = session.bus() else {
        return;
    };
    let is_ssh = session.is_ssh();
    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => {
                let raw = text.as_str();
                if is_ssh {
                    let bytes = raw.as_bytes();
                    if bytes.is_empty() {
                        continue;
                    }
                    match bytes[0] {
                        FRAME_DATA => {
                            if bus
                                .input
                                .send(Bytes::copy_from_slice(&bytes[1..]))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        FRAME_HEARTBEAT => {}
                        FRAME_WINDOW => {
                            // Malformed resize payloads are dropped.
                            if let Some(win) = WindowSize::parse(&raw[1..]) {
                                if bus.window.send(win).await.is_err() {
                                    break;
                                }
                            }
                        }
                        _ => {}
                    }
                } else if bus
                    .input
                    .send(Bytes::copy_from_slice(raw.as_bytes()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    // Client gone: unblock every other task of this session.
    session.shut_away();
}

/// The per-session driver: batches upstream output on the flush tick,
/// fans it out to monitors, emits keep-alives (SSH), and reacts to
/// admin close.
async fn drive_session(
    session: &Arc<Session>,
    mut bridge: BridgeEnds,
    client_tx: &ClientTx,
    away: CancellationToken,
) {
    let is_ssh = session.is_ssh();
    let mut buf = BytesMut::new();
    let mut flush = tokio::time::interval(FLUSH_INTERVAL);
    flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            chunk = bridge.output.recv() => match chunk {
                Some(bytes) => buf.extend_from_slice(&bytes),
                // Connector finished; the session is over.
                None => break,
            },
            closer = bridge.close.recv() => {
                if let Some(who) = closer {
                    flush_buffer(session, client_tx, &mut buf);
                    let notice = if is_ssh {
                        Message::Text(ADMIN_CLOSE_BANNER.into())
                    } else {
                        let disconnect =
                            Instruction::new("disconnect", vec!["closed by admin".to_string()]);
                        Message::Text(disconnect.encode().into())
                    };
                    let _ = client_tx.send(notice.clone());
                    session.fanout(&notice);
                    warn!(
                        "Session {} closed by admin {}",
                        session.meta.session_id, who
                    );
                }
                break;
            }
            _ = flush.tick() => flush_buffer(session, client_tx, &mut buf),
            _ = keepalive.tick(), if is_ssh => {
                let ping = Message::Text("".into());
                if client_tx.send(ping.clone()).is_err() {
                    break;
                }
                session.fanout(&ping);
            }
            _ = away.cancelled() => break,
        }
    }
    flush_buffer(session, client_tx, &mut buf);
}

/// Drains the coalescing buffer to the client and every monitor.
fn flush_buffer(session: &Session, client_tx: &ClientTx, buf: &mut BytesMut) {
    if buf.is_empty() {
        return;
    }
    let text = String::from_utf8_lossy(buf).into_owned();
    let msg = Message::Text(text.into());
    let _ = client_tx.send(msg.clone());
    session.fanout(&msg);
    buf.clear();
}

/// Serializes and sends queued messages until the socket or the queue
/// closes.
async fn pump_outbound(
    mut ws_sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        let is_close = matches!(msg, Message::Close(_));
        if ws_sink.send(msg).await.is_err() {
            break;
        }
        if is_close {
            break;
        }
    }
}

// ─── Monitor Attach ─────────────────────────────────────────────

/// `GET /connect/monitor/{session_id}` — Admin-only. Upgrades and
/// attaches a read-only observer to a live session.
pub async fn monitor_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let who = Identity::from_headers(&headers);
    if !who.is_admin {
        return GatewayError::NoPerm.into_response();
    }
    let session = match load_monitor_target(&state, &session_id).await {
        Ok(session) => session,
        Err(e) => return e.into_response(),
    };
    let lang = state.messages.resolve_lang(
        query.get("lang").map(String::as_str),
        Some(who.accept_language.as_str()),
    );
    let size = WindowSize::from_query(&query, 1024, 768, 96);
    ws.on_upgrade(move |socket| serve_monitor(state, session, who, lang, size, socket))
}

/// Resolves the session an observer wants to watch.
///
/// Gateway-originated sessions live in the registry. Client-originated
/// sessions are opened directly against the relay and reach this
/// gateway only through their durable record: the first observer
/// materializes the session into the registry, and later attachers
/// find it there.
async fn load_monitor_target(state: &AppState, session_id: &str) -> Result<Arc<Session>> {
    if let Ok(session) = state.registry.load(session_id) {
        return Ok(session);
    }
    match storage::get_online_session(&state.db, session_id).await? {
        Some(record) if record.session_type == SessionType::Client.as_str() => {
            let session = Session::from_record(&record);
            state.registry.store(session.clone());
            info!("Session {} materialized from storage for monitoring", session_id);
            Ok(session)
        }
        _ => Err(GatewayError::InvalidSessionId(session_id.to_string())),
    }
}

/// Wires one observer into a session and waits for its disconnect.
async fn serve_monitor(
    state: AppState,
    session: Arc<Session>,
    who: Identity,
    lang: String,
    size: WindowSize,
    socket: WebSocket,
) {
    let key = observer_key(who.uid, &session.meta.session_id);
    let (ws_sink, mut ws_stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();
    let outbound = tokio::spawn(pump_outbound(ws_sink, rx));

    // Register before wiring so no output emitted after this point can
    // miss the new observer.
    session.monitors.insert(
        key.clone(),
        MonitorEntry {
            tx: tx.clone(),
            lang: lang.clone(),
        },
    );
    info!(
        "Monitor {} attached to session {} (primary connected: {})",
        key,
        session.meta.session_id,
        session.is_connected()
    );

    // A bundle owned by this observer alone (graphical join); cancelled
    // on detach.
    let mut private_away: Option<CancellationToken> = None;

    let wired: Result<()> = match (session.meta.session_type, session.is_ssh()) {
        // The primary SSH driver already fans out to the monitor map.
        (SessionType::Web, true) => Ok(()),

        // Graphical sessions are joined with a private tunnel.
        (SessionType::Web, false) => {
            let (bus, connector, bridge) = channels::make();
            let (result_tx, result_rx) = oneshot::channel();
            tokio::spawn(guacd::run_monitor(
                state.clone(),
                session.clone(),
                size,
                connector,
                result_tx,
            ));
            match result_rx.await {
                Ok(Ok(_)) => {
                    private_away = Some(bus.away.clone());
                    tokio::spawn(drive_private(bridge, tx.clone(), bus.away.clone()));
                    Ok(())
                }
                Ok(Err(e)) => Err(e),
                Err(_) => Err(GatewayError::ConnectServer(
                    "monitor connector exited before the handshake".to_string(),
                )),
            }
        }

        // Client-originated shells get a shared MONITOR-mode connector,
        // started by the first attacher.
        (SessionType::Client, true) => attach_client_shell_monitor(&state, &session, &who).await,

        (SessionType::Client, false) => Err(GatewayError::InvalidArgument(
            "client graphical sessions cannot be monitored".to_string(),
        )),
    };

    if let Err(e) = wired {
        warn!(
            "Monitor {} failed to attach to session {}: {}",
            key, session.meta.session_id, e
        );
        session.monitors.remove(&key);
        let text = state.messages.lookup(&lang, e.message_key());
        let _ = tx.send(Message::Text(text.into()));
        let _ = tx.send(Message::Close(None));
        drop(tx);
        let _ = outbound.await;
        return;
    }

    // The read loop exists solely to detect the observer going away.
    while let Some(Ok(msg)) = ws_stream.next().await {
        if let Message::Close(_) = msg {
            break;
        }
    }

    detach_monitor(&session, &key, private_away);
    info!(
        "Monitor {} detached from session {}",
        key, session.meta.session_id
    );
    drop(tx);
    let _ = outbound.await;
}

/// Detach bookkeeping shared by every observer exit: drop the observer
/// key, cancel a private tunnel, and tear down the shared CLIENT/SSH
/// bundle when the last observer leaves.
fn detach_monitor(session: &Arc<Session>, key: &str, private_away: Option<CancellationToken>) {
    session.monitors.remove(key);
    if let Some(away) = private_away {
        away.cancel();
    }
    if session.meta.session_type == SessionType::Client
        && session.is_ssh()
        && session.monitors.is_empty()
    {
        // Last observer of a client shell: stop the shared connector so
        // the next attacher starts a fresh one.
        session.shut_away();
        session.clear_bus();
    }
}

/// First monitor of a CLIENT/SSH session: installs a shared bundle and
/// starts the MONITOR-mode relay connector plus the fan-out driver.
/// Later attachers find the bundle installed and share it.
async fn attach_client_shell_monitor(
    state: &AppState,
    session: &Arc<Session>,
    who: &Identity,
) -> Result<()> {
    if session.bus().is_some() {
        return Ok(());
    }

    let (bus, connector, bridge) = channels::make();
    session.install_bus(bus.clone());

    let request = RelayRequest {
        uid: who.uid,
        username: who.username.clone(),
        client_ip: who.client_ip.clone(),
        cookie: who.cookie.clone(),
        accept_language: who.accept_language.clone(),
        asset_id: session.meta.asset_id,
        account_id: session.meta.account_id,
        protocol: session.meta.protocol.clone(),
        action: RelayAction::Monitor,
        session_id: session.meta.session_id.clone(),
    };
    let (result_tx, result_rx) = oneshot::channel();
    tokio::spawn(ssh::run_monitor(
        state.clone(),
        request,
        WindowSize {
            width: 80,
            height: 24,
            dpi: 0,
        },
        connector,
        result_tx,
    ));
    match result_rx.await {
        Ok(Ok(_)) => {
            tokio::spawn(drive_monitors(
                session.clone(),
                bridge,
                bus.away.clone(),
            ));
            Ok(())
        }
        Ok(Err(e)) => {
            session.clear_bus();
            Err(e)
        }
        Err(_) => {
            session.clear_bus();
            Err(GatewayError::ConnectServer(
                "monitor connector exited before the handshake".to_string(),
            ))
        }
    }
}

/// Drains a monitor-owned tunnel into that monitor's socket only.
/// No keep-alive: graphical peers have their own liveness.
async fn drive_private(mut bridge: BridgeEnds, tx: ClientTx, away: CancellationToken) {
    let mut buf = BytesMut::new();
    let mut flush = tokio::time::interval(FLUSH_INTERVAL);
    flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            chunk = bridge.output.recv() => match chunk {
                Some(bytes) => buf.extend_from_slice(&bytes),
                None => break,
            },
            _ = flush.tick() => {
                if !buf.is_empty() {
                    let text = String::from_utf8_lossy(&buf).into_owned();
                    if tx.send(Message::Text(text.into())).is_err() {
                        break;
                    }
                    buf.clear();
                }
            }
            _ = away.cancelled() => break,
        }
    }
}

/// The fan-out driver of a CLIENT/SSH session: like the primary driver
/// but with no primary client, only the monitor map.
async fn drive_monitors(session: Arc<Session>, mut bridge: BridgeEnds, away: CancellationToken) {
    let mut buf = BytesMut::new();
    let mut flush = tokio::time::interval(FLUSH_INTERVAL);
    flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            chunk = bridge.output.recv() => match chunk {
                Some(bytes) => buf.extend_from_slice(&bytes),
                None => break,
            },
            closer = bridge.close.recv() => {
                if let Some(who) = closer {
                    session.fanout(&Message::Text(ADMIN_CLOSE_BANNER.into()));
                    warn!(
                        "Session {} closed by admin {}",
                        session.meta.session_id, who
                    );
                }
                break;
            }
            _ = flush.tick() => {
                if !buf.is_empty() {
                    let text = String::from_utf8_lossy(&buf).into_owned();
                    session.fanout(&Message::Text(text.into()));
                    buf.clear();
                }
            }
            _ = keepalive.tick() => session.fanout(&Message::Text("".into())),
            _ = away.cancelled() => break,
        }
    }
}

// ─── Admin Close ────────────────────────────────────────────────

/// `POST /connect/close/{session_id}` — Admin-only. Terminates an
/// ONLINE session through the relay and unwinds local state. A session
/// that is already gone is a success.
pub async fn close_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>> {
    let who = Identity::from_headers(&headers);
    if !who.is_admin {
        return Err(GatewayError::NoPerm);
    }

    let Some(record) = storage::get_online_session(&state.db, &session_id).await? else {
        return Ok(Json(serde_json::json!({ "code": 0 })));
    };

    let request = RelayRequest {
        uid: who.uid,
        username: who.username.clone(),
        client_ip: who.client_ip.clone(),
        cookie: who.cookie.clone(),
        accept_language: who.accept_language.clone(),
        asset_id: record.asset_id,
        account_id: record.account_id,
        protocol: record.protocol.clone(),
        action: RelayAction::Close,
        session_id: session_id.clone(),
    };
    let outcome = ssh::close_session(&state.config.relay, &request).await;

    // Local state is unwound whatever the relay said.
    if let Ok(session) = state.registry.load(&session_id) {
        state.offline_session(&session, Some(&who.username)).await;
    }

    let response = outcome?;
    if response.code != 0 {
        return Err(GatewayError::ConnectServer(format!(
            "relay close failed (code {}): {}",
            response.code, response.message
        )));
    }
    Ok(Json(serde_json::json!({ "code": 0 })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::i18n::Catalog;
    use crate::state::SessionMeta;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }
        map
    }

    #[test]
    fn identity_reads_gateway_headers() {
        let who = Identity::from_headers(&headers(&[
            ("x-bastion-uid", "916"),
            ("x-bastion-user", "ops"),
            ("x-bastion-role", "admin"),
            ("x-forwarded-for", "10.0.0.9, 172.16.0.1"),
            ("accept-language", "zh-CN,zh;q=0.9"),
        ]));
        assert_eq!(who.uid, 916);
        assert_eq!(who.username, "ops");
        assert!(who.is_admin);
        assert_eq!(who.client_ip, "10.0.0.9");
    }

    #[test]
    fn identity_defaults_when_headers_are_missing() {
        let who = Identity::from_headers(&HeaderMap::new());
        assert_eq!(who.uid, 0);
        assert!(!who.is_admin);
        assert_eq!(who.client_ip, "");
    }

    async fn test_state() -> AppState {
        AppState::new(
            Config::default(),
            storage::test_pool().await,
            Catalog::load(None, "en"),
        )
    }

    fn test_session(session_id: &str) -> Arc<Session> {
        let (bus, _connector, bridge) = channels::make();
        Session::new(
            SessionMeta {
                session_id: session_id.to_string(),
                session_type: SessionType::Web,
                protocol: "ssh".to_string(),
                uid: 916,
                username: "ops".to_string(),
                asset_id: 1,
                asset_name: "db-1".to_string(),
                account_id: 1,
                account_name: "root".to_string(),
                gateway_id: None,
                client_ip: "10.0.0.9".to_string(),
                connection_id: "s-off".to_string(),
            },
            Some(bus),
            Some(bridge),
        )
    }

    #[tokio::test]
    async fn offline_session_farewells_each_monitor_in_its_language() {
        let state = test_state().await;
        let session = test_session("s-off");
        state.registry.store(session.clone());

        let (en_tx, mut en_rx) = mpsc::unbounded_channel();
        let (zh_tx, mut zh_rx) = mpsc::unbounded_channel();
        session.monitors.insert(
            "k-en".to_string(),
            MonitorEntry {
                tx: en_tx,
                lang: "en".to_string(),
            },
        );
        session.monitors.insert(
            "k-zh".to_string(),
            MonitorEntry {
                tx: zh_tx,
                lang: "zh".to_string(),
            },
        );

        state.offline_session(&session, None).await;

        // Registry entry gone, monitors emptied.
        assert!(state.registry.load("s-off").is_err());
        assert!(session.monitors.is_empty());

        // Each observer got its localized farewell, then a close frame.
        assert!(matches!(
            en_rx.try_recv().unwrap(),
            Message::Text(t) if t.as_str() == "the session has ended"
        ));
        assert!(matches!(en_rx.try_recv().unwrap(), Message::Close(_)));
        assert!(matches!(
            zh_rx.try_recv().unwrap(),
            Message::Text(t) if t.as_str() == "会话已结束"
        ));

        // The durable record flipped to offline with a close stamp.
        let record = sqlx::query_as::<_, storage::SessionRecord>(
            "SELECT * FROM sessions WHERE session_id = 's-off'",
        )
        .fetch_one(&state.db)
        .await
        .unwrap();
        assert_eq!(record.status, "offline");
        assert!(record.closed_at.is_some());
    }

    fn client_session(session_id: &str) -> Arc<Session> {
        Session::new(
            SessionMeta {
                session_id: session_id.to_string(),
                session_type: SessionType::Client,
                protocol: "ssh".to_string(),
                uid: 916,
                username: "ops".to_string(),
                asset_id: 1,
                asset_name: "db-1".to_string(),
                account_id: 1,
                account_name: "root".to_string(),
                gateway_id: None,
                client_ip: "10.0.0.9".to_string(),
                connection_id: session_id.to_string(),
            },
            None,
            None,
        )
    }

    #[tokio::test]
    async fn monitor_target_materializes_client_sessions_from_storage() {
        let state = test_state().await;
        let record =
            storage::SessionRecord::of(&client_session("c-store"), SessionStatus::Online, None);
        storage::upsert_session(&state.db, &record).await.unwrap();

        assert!(state.registry.load("c-store").is_err());
        let session = load_monitor_target(&state, "c-store").await.unwrap();
        assert_eq!(session.meta.session_type, SessionType::Client);
        // Materialized into the registry; the next attacher shares it.
        let again = load_monitor_target(&state, "c-store").await.unwrap();
        assert!(Arc::ptr_eq(&session, &again));
    }

    #[tokio::test]
    async fn monitor_target_rejects_unknown_and_web_only_records() {
        let state = test_state().await;
        assert!(matches!(
            load_monitor_target(&state, "nope").await,
            Err(GatewayError::InvalidSessionId(_))
        ));

        // A web record whose registry entry is gone is stale, not a
        // session to revive.
        let record = storage::SessionRecord::of(&test_session("w-stale"), SessionStatus::Online, None);
        storage::upsert_session(&state.db, &record).await.unwrap();
        assert!(matches!(
            load_monitor_target(&state, "w-stale").await,
            Err(GatewayError::InvalidSessionId(_))
        ));
    }

    #[tokio::test]
    async fn first_client_monitor_attach_fails_cleanly_without_a_relay() {
        // Reserve a port that is certainly closed.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut config = Config::default();
        config.relay.host = "127.0.0.1".to_string();
        config.relay.port = port;
        let state = AppState::new(config, storage::test_pool().await, Catalog::load(None, "en"));

        let session = client_session("c-dial");
        let who = Identity::from_headers(&HeaderMap::new());
        let result = attach_client_shell_monitor(&state, &session, &who).await;
        assert!(result.is_err());
        // The failed attacher must not leave a half-installed bundle.
        assert!(session.bus().is_none());
    }

    #[tokio::test]
    async fn later_client_monitor_attachers_share_the_installed_bundle() {
        let state = test_state().await;
        let session = client_session("c-share");
        let (bus, _connector, _bridge) = channels::make();
        session.install_bus(bus);

        let who = Identity::from_headers(&HeaderMap::new());
        // The bundle exists, so no new connector is started.
        assert!(attach_client_shell_monitor(&state, &session, &who)
            .await
            .is_ok());
        assert!(session.bus().is_some());
    }

    #[tokio::test]
    async fn last_client_monitor_detach_tears_down_the_shared_bundle() {
        let session = client_session("c-detach");
        let (bus, connector, _bridge) = channels::make();
        session.install_bus(bus);

        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        session.monitors.insert(
            "k1".to_string(),
            MonitorEntry {
                tx: tx1,
                lang: "en".to_string(),
            },
        );
        session.monitors.insert(
            "k2".to_string(),
            MonitorEntry {
                tx: tx2,
                lang: "en".to_string(),
            },
        );

        detach_monitor(&session, "k1", None);
        // One observer remains; the shared connector keeps running.
        assert!(session.bus().is_some());
        assert!(!connector.away.is_cancelled());

        detach_monitor(&session, "k2", None);
        // Last observer gone: the connector is told to stop and the
        // bundle is dropped for the next attach cycle.
        connector.away.cancelled().await;
        assert!(session.bus().is_none());
    }

    #[tokio::test]
    async fn detach_cancels_a_private_graphical_tunnel() {
        let session = test_session("w-gfx");
        let (bus, connector, _bridge) = channels::make();
        let (tx, _rx) = mpsc::unbounded_channel();
        session.monitors.insert(
            "k1".to_string(),
            MonitorEntry {
                tx,
                lang: "en".to_string(),
            },
        );

        detach_monitor(&session, "k1", Some(bus.away.clone()));
        connector.away.cancelled().await;
        assert!(session.monitors.is_empty());
    }

    #[tokio::test]
    async fn offline_session_nudges_the_close_queue() {
        let state = test_state().await;
        let (bus, _connector, mut bridge) = channels::make();
        let session = Session::new(
            SessionMeta {
                session_id: "s-close".to_string(),
                session_type: SessionType::Web,
                protocol: "ssh".to_string(),
                uid: 916,
                username: "ops".to_string(),
                asset_id: 1,
                asset_name: String::new(),
                account_id: 1,
                account_name: String::new(),
                gateway_id: None,
                client_ip: String::new(),
                connection_id: "s-close".to_string(),
            },
            Some(bus),
            None,
        );
        state.registry.store(session.clone());

        state.offline_session(&session, Some("root")).await;
        assert_eq!(bridge.close.recv().await.unwrap(), "root");
    }
}
