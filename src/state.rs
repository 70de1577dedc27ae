//! # Gateway State
//!
//! Holds the shared application state for the gateway, including:
//! - **Session registry**: maps session ids to live sessions
//! - **Monitor registries**: per-session maps of observer WebSockets
//! - Shared handles: configuration, database pool, message catalog
//!
//! The registries use [`DashMap`] for lock-free concurrent access,
//! since sessions, monitors and admin actions run on independent tasks.
//! The registry is carried inside [`AppState`] rather than a global so
//! tests get isolated instances.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::channels::{BridgeEnds, SessionBus};
use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::i18n::{self, Catalog};
use crate::storage;

/// Type alias for the unbounded sender feeding one WebSocket's outbound
/// pump. Each attached socket (primary or monitor) gets one of these.
pub type ClientTx = mpsc::UnboundedSender<Message>;

/// How a session originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    /// Opened by a browser through this gateway.
    Web,
    /// Opened by a native client directly against the relay; the
    /// gateway only sees it when a monitor attaches.
    Client,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Client => "client",
        }
    }

    /// Decodes the durable form; anything unrecognized is treated as a
    /// gateway-originated session.
    pub fn parse(s: &str) -> Self {
        if s == "client" {
            Self::Client
        } else {
            Self::Web
        }
    }
}

/// Durable session status. A session is ONLINE exactly while its
/// registry entry exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Online,
    Offline,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

/// One read-only observer attached to a session.
#[derive(Debug, Clone)]
pub struct MonitorEntry {
    pub tx: ClientTx,
    /// Resolved at attach time; the farewell on teardown is localized
    /// per monitor.
    pub lang: String,
}

/// Immutable descriptive fields of a session, fixed at handshake time.
#[derive(Debug, Clone)]
pub struct SessionMeta {
    /// Opaque id assigned by the upstream (relay or Guacamole tunnel).
    pub session_id: String,
    pub session_type: SessionType,
    /// `ssh`, `rdp:<port>` or `vnc:<port>`.
    pub protocol: String,
    pub uid: i64,
    pub username: String,
    pub asset_id: i64,
    pub asset_name: String,
    pub account_id: i64,
    pub account_name: String,
    pub gateway_id: Option<i64>,
    pub client_ip: String,
    /// Upstream-assigned connection id, used to rejoin for monitoring.
    pub connection_id: String,
}

/// A live session.
pub struct Session {
    pub meta: SessionMeta,
    pub created_at: DateTime<Utc>,
    /// Set once on the first successful primary WebSocket attach and
    /// never reset.
    connected: AtomicBool,
    /// Producer half of the bus. Absent for CLIENT sessions until the
    /// first monitor attaches.
    bus: Mutex<Option<SessionBus>>,
    /// Driver ends, handed out exactly once to the primary WebSocket.
    bridge: Mutex<Option<BridgeEnds>>,
    /// Observer key → monitor socket.
    pub monitors: DashMap<String, MonitorEntry>,
}

impl Session {
    pub fn new(
        meta: SessionMeta,
        bus: Option<SessionBus>,
        bridge: Option<BridgeEnds>,
    ) -> Arc<Self> {
        Arc::new(Self {
            meta,
            created_at: Utc::now(),
            connected: AtomicBool::new(false),
            bus: Mutex::new(bus),
            bridge: Mutex::new(bridge),
            monitors: DashMap::new(),
        })
    }

    /// Materializes a live handle from a durable record.
    ///
    /// Client-originated sessions are opened directly against the relay
    /// and exist only in storage until an observer first touches them
    /// through this gateway; they carry no bus and no bridge ends until
    /// monitor attach installs a bundle.
    pub fn from_record(record: &storage::SessionRecord) -> Arc<Self> {
        Arc::new(Self {
            meta: SessionMeta {
                session_id: record.session_id.clone(),
                session_type: SessionType::parse(&record.session_type),
                protocol: record.protocol.clone(),
                uid: record.uid,
                username: record.username.clone(),
                asset_id: record.asset_id,
                asset_name: record.asset_name.clone(),
                account_id: record.account_id,
                account_name: record.account_name.clone(),
                gateway_id: record.gateway_id,
                client_ip: record.client_ip.clone(),
                connection_id: record.connection_id.clone(),
            },
            created_at: record.created_at,
            connected: AtomicBool::new(false),
            bus: Mutex::new(None),
            bridge: Mutex::new(None),
            monitors: DashMap::new(),
        })
    }

    /// Claims the primary attachment. Succeeds at most once per session.
    pub fn try_attach(&self) -> bool {
        self.connected
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn bus(&self) -> Option<SessionBus> {
        self.bus.lock().ok().and_then(|guard| guard.clone())
    }

    /// Installs a bus on a CLIENT session when its first monitor
    /// attaches.
    pub fn install_bus(&self, bus: SessionBus) {
        if let Ok(mut guard) = self.bus.lock() {
            *guard = Some(bus);
        }
    }

    /// Drops the shared bus when the last monitor of a CLIENT session
    /// detaches, so the next attacher starts a fresh connector.
    pub fn clear_bus(&self) {
        if let Ok(mut guard) = self.bus.lock() {
            *guard = None;
        }
    }

    /// Takes the driver ends; the second caller gets `None`.
    pub fn take_bridge(&self) -> Option<BridgeEnds> {
        self.bridge.lock().ok().and_then(|mut guard| guard.take())
    }

    /// Signals shutdown to the session's tasks.
    pub fn shut_away(&self) {
        if let Some(bus) = self.bus() {
            bus.shut_away();
        }
    }

    pub fn is_ssh(&self) -> bool {
        self.meta.protocol == "ssh"
    }

    /// Sends one message to every monitor, dropping observers whose
    /// socket pump has gone away.
    pub fn fanout(&self, msg: &Message) {
        self.monitors
            .retain(|_, entry| entry.tx.send(msg.clone()).is_ok());
    }
}

/// Builds the unique key of one observer attachment.
pub fn observer_key(uid: i64, session_id: &str) -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("{uid}-{session_id}-{nanos}")
}

// ─── Session Registry ───────────────────────────────────────────

/// Registry of live sessions, keyed by session id.
#[derive(Default)]
pub struct Registry {
    sessions: DashMap<String, Arc<Session>>,
}

impl Registry {
    pub fn store(&self, session: Arc<Session>) {
        self.sessions
            .insert(session.meta.session_id.clone(), session);
    }

    /// Looks up a live session; absent ids are a client error.
    pub fn load(&self, session_id: &str) -> Result<Arc<Session>> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| GatewayError::InvalidSessionId(session_id.to_string()))
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.remove(session_id).map(|(_, s)| s)
    }

    pub fn list(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }
}

// ─── Shared Application State ───────────────────────────────────

/// Shared application state, cloned and passed to each request handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: SqlitePool,
    pub registry: Arc<Registry>,
    pub messages: Arc<Catalog>,
}

impl AppState {
    pub fn new(config: Config, db: SqlitePool, messages: Catalog) -> Self {
        Self {
            config: Arc::new(config),
            db,
            registry: Arc::new(Registry::default()),
            messages: Arc::new(messages),
        }
    }

    /// Takes a session offline: removes it from the registry, nudges a
    /// live bridge via the `close` queue, stamps and upserts the OFFLINE
    /// record, then says goodbye to every monitor in its own language.
    ///
    /// Called by every teardown path, so each step tolerates the others
    /// having run already.
    pub async fn offline_session(&self, session: &Arc<Session>, closer: Option<&str>) {
        let session_id = &session.meta.session_id;
        if self.registry.remove(session_id).is_some() {
            info!("Session {} offline", session_id);
        }

        if let (Some(bus), Some(who)) = (session.bus(), closer) {
            // Bounded nudge: a stuck driver must not wedge admin close.
            if bus
                .close
                .send_timeout(who.to_string(), Duration::from_secs(1))
                .await
                .is_err()
            {
                warn!("Session {} close notification dropped", session_id);
            }
        }

        let record = storage::SessionRecord::of(session, SessionStatus::Offline, Some(Utc::now()));
        if let Err(e) = storage::upsert_session(&self.db, &record).await {
            warn!("Session {} offline upsert failed: {}", session_id, e);
        }

        // Farewell and disconnect every observer; the map must be empty
        // once the session is OFFLINE.
        session.monitors.retain(|_, entry| {
            let farewell = self.messages.lookup(&entry.lang, i18n::MSG_SESSION_END);
            let _ = entry.tx.send(Message::Text(farewell.into()));
            let _ = entry.tx.send(Message::Close(None));
            false
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels;

    fn meta(session_id: &str) -> SessionMeta {
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
            connection_id: "c-1".to_string(),
        }
    }

    #[test]
    fn registry_load_after_store_then_remove() {
        let registry = Registry::default();
        let (bus, _connector, bridge) = channels::make();
        let session = Session::new(meta("s1"), Some(bus), Some(bridge));
        registry.store(session);

        assert!(registry.load("s1").is_ok());
        assert_eq!(registry.list().len(), 1);

        registry.remove("s1");
        assert!(matches!(
            registry.load("s1"),
            Err(GatewayError::InvalidSessionId(_))
        ));
    }

    #[test]
    fn primary_attach_succeeds_at_most_once() {
        let (bus, _connector, bridge) = channels::make();
        let session = Session::new(meta("s2"), Some(bus), Some(bridge));
        assert!(!session.is_connected());
        assert!(session.try_attach());
        assert!(session.is_connected());
        // A second WebSocket bind must be rejected.
        assert!(!session.try_attach());
    }

    #[test]
    fn bridge_ends_are_handed_out_once() {
        let (bus, _connector, bridge) = channels::make();
        let session = Session::new(meta("s3"), Some(bus), Some(bridge));
        assert!(session.take_bridge().is_some());
        assert!(session.take_bridge().is_none());
    }

    #[test]
    fn fanout_drops_dead_monitors() {
        let (bus, _connector, bridge) = channels::make();
        let session = Session::new(meta("s4"), Some(bus), Some(bridge));

        let (alive_tx, mut alive_rx) = mpsc::unbounded_channel();
        let (dead_tx, dead_rx) = mpsc::unbounded_channel();
        drop(dead_rx);
        session.monitors.insert(
            "k1".to_string(),
            MonitorEntry {
                tx: alive_tx,
                lang: "en".to_string(),
            },
        );
        session.monitors.insert(
            "k2".to_string(),
            MonitorEntry {
                tx: dead_tx,
                lang: "en".to_string(),
            },
        );

        session.fanout(&Message::Text("hi".into()));
        assert_eq!(session.monitors.len(), 1);
        assert!(matches!(
            alive_rx.try_recv().unwrap(),
            Message::Text(t) if t.as_str() == "hi"
        ));
    }

    #[test]
    fn observer_keys_embed_uid_and_session() {
        let key = observer_key(7, "s9");
        assert!(key.starts_with("7-s9-"));
    }

    #[test]
    fn from_record_revives_a_client_session_without_a_bus() {
        let mut record = storage::SessionRecord::of(
            &Session::new(meta("c1"), None, None),
            SessionStatus::Online,
            None,
        );
        record.session_type = "client".to_string();

        let session = Session::from_record(&record);
        assert_eq!(session.meta.session_type, SessionType::Client);
        assert_eq!(session.meta.session_id, "c1");
        assert_eq!(session.created_at, record.created_at);
        assert!(session.bus().is_none());
        assert!(session.take_bridge().is_none());
        assert!(!session.is_connected());
    }

    #[test]
    fn session_type_round_trips_its_durable_form() {
        assert_eq!(SessionType::parse("client"), SessionType::Client);
        assert_eq!(SessionType::parse("web"), SessionType::Web);
        assert_eq!(SessionType::parse("junk"), SessionType::Web);
    }
}
