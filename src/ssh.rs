//! # SSH Relay Connector
//!
//! Shell sessions go through a configured upstream relay: the gateway
//! dials it over SSH, requests an `xterm` PTY, and speaks a one-line
//! JSON handshake (terminated by `\r`) on the shell's stdin/stdout. The
//! relay answers with a [`RelayResponse`] naming the session, then the
//! PTY carries raw terminal traffic which this connector pumps onto the
//! session bus.
//!
//! ## Actions
//! - **New**: open a session to the target asset, then pump until exit
//! - **Monitor**: attach read-only to an existing session, then pump
//! - **Close**: handshake round-trip only; the relay terminates the
//!   target session

use std::sync::Arc;

use russh::client::{self, Msg};
use russh::keys::{HashAlg, PublicKey};
use russh::{Channel, ChannelMsg, Disconnect, Pty};
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::channels::{BridgeEnds, ConnectorEnds, SessionBus};
use crate::config::RelayConfig;
use crate::error::{GatewayError, Result};
use crate::protocol::{RelayRequest, RelayResponse, Utf8Carry, WindowSize};
use crate::state::{AppState, Session, SessionMeta, SessionStatus, SessionType};
use crate::storage;

// ─── Host Key Verification ──────────────────────────────────────

struct RelayHandler {
    /// Pinned SHA-256 fingerprint from the configuration, when set.
    pinned: Option<String>,
}

impl client::Handler for RelayHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        match &self.pinned {
            Some(want) if *want == fingerprint => Ok(true),
            Some(want) => {
                warn!("Relay host key {} does not match pin {}", fingerprint, want);
                Ok(false)
            }
            None => {
                warn!("Relay host key not pinned; trusting {}", fingerprint);
                Ok(true)
            }
        }
    }
}

// ─── Handshake ──────────────────────────────────────────────────

/// A relay connection that has completed the JSON handshake.
pub struct RelayShell {
    handle: client::Handle<RelayHandler>,
    channel: Channel<Msg>,
    pub response: RelayResponse,
}

/// Dials the relay, starts the PTY shell, and runs the handshake.
///
/// Everything up to and including the parsed reply is fatal for the
/// connection attempt; callers deliver the error through the handshake
/// oneshot rather than returning it to the HTTP layer directly.
pub async fn open(
    cfg: &RelayConfig,
    request: &RelayRequest,
    term: WindowSize,
) -> Result<RelayShell> {
    let config = Arc::new(client::Config::default());
    let handler = RelayHandler {
        pinned: cfg.host_key.clone(),
    };
    let mut handle = client::connect(config, (cfg.host.as_str(), cfg.port), handler).await?;

    let auth = handle
        .authenticate_password(cfg.account.as_str(), cfg.password.as_str())
        .await?;
    if !auth.success() {
        return Err(GatewayError::ConnectServer(
            "relay rejected the configured credentials".to_string(),
        ));
    }

    let mut channel = handle.channel_open_session().await?;
    channel
        .request_pty(
            false,
            "xterm",
            term.width,
            term.height,
            0,
            0,
            &[
                (Pty::ECHO, 0),
                (Pty::TTY_OP_ISPEED, 14400),
                (Pty::TTY_OP_OSPEED, 14400),
            ],
        )
        .await?;
    channel.request_shell(true).await?;

    let mut line = serde_json::to_string(request)
        .map_err(|e| GatewayError::ConnectServer(format!("handshake encode: {e}")))?;
    line.push('\r');
    channel.data(line.as_bytes()).await?;

    let reply = read_reply_line(&mut channel).await?;
    let response: RelayResponse = serde_json::from_str(reply.trim())
        .map_err(|e| GatewayError::ConnectServer(format!("unparsable relay reply: {e}")))?;
    Ok(RelayShell {
        handle,
        channel,
        response,
    })
}

/// Reads shell output up to the next `\r` and strips it.
async fn read_reply_line(channel: &mut Channel<Msg>) -> Result<String> {
    let mut buf: Vec<u8> = Vec::new();
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                buf.extend_from_slice(&data);
                if let Some(pos) = buf.iter().position(|&b| b == b'\r') {
                    return Ok(String::from_utf8_lossy(&buf[..pos]).into_owned());
                }
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => {
                return Err(GatewayError::ConnectServer(format!(
                    "relay exited with status {exit_status} during handshake"
                )));
            }
            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                return Err(GatewayError::ConnectServer(
                    "relay closed during handshake".to_string(),
                ));
            }
            Some(_) => {}
        }
    }
}

// ─── Connector Entrypoints ──────────────────────────────────────

/// Opens a new web session through the relay and pumps it until exit.
///
/// On handshake success the Session is created, persisted and stored in
/// the registry before the outcome is resolved, so the HTTP handler can
/// load it immediately after.
pub async fn run_session(
    state: AppState,
    request: RelayRequest,
    term: WindowSize,
    bus: SessionBus,
    ends: ConnectorEnds,
    bridge: BridgeEnds,
    result_tx: oneshot::Sender<Result<RelayResponse>>,
) {
    let shell = match open(&state.config.relay, &request, term).await {
        Ok(shell) => shell,
        Err(e) => {
            let _ = result_tx.send(Err(e));
            return;
        }
    };
    if shell.response.code != 0 || shell.response.session_id.is_empty() {
        let _ = result_tx.send(Err(GatewayError::ConnectServer(format!(
            "relay refused the session (code {}): {}",
            shell.response.code, shell.response.message
        ))));
        return;
    }
    let response = shell.response.clone();

    // Human-readable descriptors for the session record; the relay owns
    // target resolution, so a miss here is not fatal.
    let asset_name = storage::get_asset(&state.db, request.asset_id)
        .await
        .ok()
        .flatten()
        .map(|a| a.name)
        .unwrap_or_default();
    let account_name = storage::get_account(&state.db, request.account_id)
        .await
        .ok()
        .flatten()
        .map(|a| a.name)
        .unwrap_or_default();

    let session = Session::new(
        SessionMeta {
            session_id: response.session_id.clone(),
            session_type: SessionType::Web,
            protocol: request.protocol.clone(),
            uid: request.uid,
            username: request.username.clone(),
            asset_id: request.asset_id,
            asset_name,
            account_id: request.account_id,
            account_name,
            gateway_id: None,
            client_ip: request.client_ip.clone(),
            connection_id: response.session_id.clone(),
        },
        Some(bus),
        Some(bridge),
    );

    let record = storage::SessionRecord::of(&session, SessionStatus::Online, None);
    if let Err(e) = storage::upsert_session(&state.db, &record).await {
        let _ = result_tx.send(Err(e.into()));
        let _ = shell.handle.disconnect(Disconnect::ByApplication, "", "en").await;
        return;
    }
    state.registry.store(session.clone());
    info!(
        "Session {} online (ssh, uid={})",
        session.meta.session_id, session.meta.uid
    );
    let _ = result_tx.send(Ok(response));

    if let Err(e) = pump(shell.channel, ends).await {
        warn!("Session {} relay pump ended: {}", session.meta.session_id, e);
    }
    let _ = shell.handle.disconnect(Disconnect::ByApplication, "", "en").await;
    state.offline_session(&session, None).await;
}

/// Attaches to an existing relay session as a read-only observer and
/// pumps its output until shutdown.
pub async fn run_monitor(
    state: AppState,
    request: RelayRequest,
    term: WindowSize,
    ends: ConnectorEnds,
    result_tx: oneshot::Sender<Result<RelayResponse>>,
) {
    let shell = match open(&state.config.relay, &request, term).await {
        Ok(shell) => shell,
        Err(e) => {
            let _ = result_tx.send(Err(e));
            return;
        }
    };
    if shell.response.code != 0 {
        let _ = result_tx.send(Err(GatewayError::ConnectServer(format!(
            "relay refused the monitor (code {}): {}",
            shell.response.code, shell.response.message
        ))));
        return;
    }
    let session_id = request.session_id.clone();
    let _ = result_tx.send(Ok(shell.response.clone()));

    if let Err(e) = pump(shell.channel, ends).await {
        warn!("Monitor of session {} ended: {}", session_id, e);
    }
    let _ = shell.handle.disconnect(Disconnect::ByApplication, "", "en").await;
}

/// Asks the relay to terminate a session. Handshake round-trip only.
pub async fn close_session(cfg: &RelayConfig, request: &RelayRequest) -> Result<RelayResponse> {
    let shell = open(
        cfg,
        request,
        WindowSize {
            width: 80,
            height: 24,
            dpi: 0,
        },
    )
    .await?;
    let response = shell.response.clone();
    let _ = shell.handle.disconnect(Disconnect::ByApplication, "", "en").await;
    Ok(response)
}

// ─── Pump ───────────────────────────────────────────────────────

/// Bridges the PTY and the session bus until either side ends:
/// upstream bytes become UTF-8 frames on `out`, `in` frames go to the
/// shell's stdin, window messages become SSH window-change requests,
/// and `away` shuts everything down.
async fn pump(mut channel: Channel<Msg>, mut ends: ConnectorEnds) -> Result<()> {
    let mut carry = Utf8Carry::default();
    loop {
        tokio::select! {
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                    if let Some(text) = carry.push(&data) {
                        if ends.output.send(text.into_bytes().into()).await.is_err() {
                            // Driver gone; the session is over.
                            return Ok(());
                        }
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    info!("Relay shell exited with status {}", exit_status);
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => return Ok(()),
                Some(_) => {}
            },
            frame = ends.input.recv() => match frame {
                Some(data) => channel.data(&data[..]).await?,
                None => return Ok(()),
            },
            resize = ends.window.recv() => match resize {
                Some(win) => {
                    if win.width > 0 && win.height > 0 {
                        channel.window_change(win.width, win.height, 0, 0).await?;
                    }
                }
                // Sender side of the bus is gone; a closed receiver
                // resolves immediately on every poll, so stop cleanly
                // instead of spinning on this arm.
                None => return Ok(()),
            },
            _ = ends.away.cancelled() => return Ok(()),
        }
    }
}
