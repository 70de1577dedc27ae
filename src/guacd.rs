//! # Guacd Connector
//!
//! Graphical sessions (RDP, VNC) are tunneled through a Guacamole
//! daemon. The connector resolves the target from storage, checks the
//! asset's access-time schedule, opens the tunnel (a new connection, or
//! a join on an existing connection id for monitor mode) and relays
//! framed instructions between the tunnel and the session bus,
//! filtering broker-internal opcodes in both directions.

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channels::{BridgeEnds, ConnectorEnds, SessionBus};
use crate::error::{GatewayError, Result};
use crate::guac::{self, ConnectParams, GuacTunnel};
use crate::policy;
use crate::protocol::{RelayResponse, WindowSize};
use crate::state::{AppState, Session, SessionMeta, SessionStatus, SessionType};
use crate::storage;

/// Who is connecting where, as resolved by the connect endpoint.
#[derive(Debug, Clone)]
pub struct GuacParams {
    pub uid: i64,
    pub username: String,
    pub client_ip: String,
    pub asset_id: i64,
    pub account_id: i64,
    /// `rdp:<port>` or `vnc:<port>` as requested by the client.
    pub protocol: String,
}

/// Opens a new graphical session and pumps it until either side ends.
///
/// Storage lookups and the access-time policy run before the tunnel is
/// dialed; every failure up to the registry insert resolves the
/// handshake oneshot instead of reaching the HTTP layer directly.
pub async fn run_session(
    state: AppState,
    params: GuacParams,
    size: WindowSize,
    bus: SessionBus,
    ends: ConnectorEnds,
    bridge: BridgeEnds,
    result_tx: oneshot::Sender<Result<RelayResponse>>,
) {
    let prepared = prepare(&state, &params, size).await;
    let (tunnel, meta) = match prepared {
        Ok(ok) => ok,
        Err(e) => {
            let _ = result_tx.send(Err(e));
            return;
        }
    };

    let session = Session::new(meta, Some(bus), Some(bridge));
    let record = storage::SessionRecord::of(&session, SessionStatus::Online, None);
    if let Err(e) = storage::upsert_session(&state.db, &record).await {
        let _ = result_tx.send(Err(e.into()));
        return;
    }
    state.registry.store(session.clone());
    info!(
        "Session {} online ({}, uid={})",
        session.meta.session_id, session.meta.protocol, session.meta.uid
    );
    let _ = result_tx.send(Ok(RelayResponse {
        code: 0,
        message: String::new(),
        session_id: session.meta.session_id.clone(),
        uid: session.meta.uid,
        username: session.meta.username.clone(),
    }));

    if let Err(e) = pump(tunnel, ends).await {
        warn!("Session {} tunnel ended: {}", session.meta.session_id, e);
    }
    state.offline_session(&session, None).await;
}

/// Joins an existing connection read-only and pumps its output until
/// shutdown. Used by graphical monitor attach.
pub async fn run_monitor(
    state: AppState,
    session: std::sync::Arc<Session>,
    size: WindowSize,
    ends: ConnectorEnds,
    result_tx: oneshot::Sender<Result<RelayResponse>>,
) {
    let (name, port) = match guac::split_protocol(&session.meta.protocol) {
        Some(parts) => parts,
        None => {
            let _ = result_tx.send(Err(GatewayError::InvalidArgument(format!(
                "not a graphical session: {}",
                session.meta.protocol
            ))));
            return;
        }
    };
    let connect = ConnectParams {
        protocol: name,
        hostname: String::new(),
        port,
        username: String::new(),
        password: String::new(),
        size,
        join: Some(session.meta.connection_id.clone()),
    };
    let tunnel = match GuacTunnel::open(&state.config.guacd_addr(), &connect).await {
        Ok(tunnel) => tunnel,
        Err(e) => {
            let _ = result_tx.send(Err(e));
            return;
        }
    };
    let _ = result_tx.send(Ok(RelayResponse {
        code: 0,
        message: String::new(),
        session_id: session.meta.session_id.clone(),
        uid: session.meta.uid,
        username: session.meta.username.clone(),
    }));

    if let Err(e) = pump(tunnel, ends).await {
        warn!(
            "Monitor tunnel of session {} ended: {}",
            session.meta.session_id, e
        );
    }
}

/// Resolves storage records, evaluates policy, and opens the tunnel.
async fn prepare(
    state: &AppState,
    params: &GuacParams,
    size: WindowSize,
) -> Result<(GuacTunnel, SessionMeta)> {
    let (name, port) = guac::split_protocol(&params.protocol)
        .ok_or_else(|| GatewayError::InvalidArgument(format!("protocol {}", params.protocol)))?;

    let asset = storage::get_asset(&state.db, params.asset_id)
        .await?
        .ok_or_else(|| {
            GatewayError::ConnectServer(format!("asset {} not found", params.asset_id))
        })?;
    let account = storage::get_account(&state.db, params.account_id)
        .await?
        .ok_or_else(|| {
            GatewayError::ConnectServer(format!("account {} not found", params.account_id))
        })?;
    let gateway = match asset.gateway_id {
        Some(id) => Some(storage::get_gateway(&state.db, id).await?.ok_or_else(|| {
            GatewayError::ConnectServer(format!("gateway {id} not found"))
        })?),
        None => None,
    };
    if let Some(gateway) = &gateway {
        debug!("Asset {} reached via gateway {}", asset.id, gateway.name);
    }

    if !policy::allowed(Utc::now(), &asset.access_auth()) {
        return Err(GatewayError::ConnectServer("invalid access time".to_string()));
    }

    let connect = ConnectParams {
        protocol: name,
        hostname: asset.ip.clone(),
        port,
        username: account.username.clone(),
        password: account.password.clone(),
        size,
        join: None,
    };
    let tunnel = GuacTunnel::open(&state.config.guacd_addr(), &connect).await?;

    // The tunnel assigns the opaque session handle; a broker that hands
    // back nothing still gets a usable id.
    let session_id = if tunnel.connection_id.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        tunnel.connection_id.trim_start_matches('$').to_string()
    };
    let meta = SessionMeta {
        session_id,
        session_type: SessionType::Web,
        protocol: params.protocol.clone(),
        uid: params.uid,
        username: params.username.clone(),
        asset_id: asset.id,
        asset_name: asset.name.clone(),
        account_id: account.id,
        account_name: account.name.clone(),
        gateway_id: asset.gateway_id,
        client_ip: params.client_ip.clone(),
        connection_id: tunnel.connection_id.clone(),
    };
    Ok((tunnel, meta))
}

/// Relays instructions until either side ends, dropping empty frames
/// and broker-internal opcodes in both directions.
async fn pump(mut tunnel: GuacTunnel, mut ends: ConnectorEnds) -> std::io::Result<()> {
    loop {
        tokio::select! {
            frame = tunnel.read_frame() => match frame? {
                Some(frame) => {
                    if frame.is_empty() || guac::is_internal(&frame) {
                        continue;
                    }
                    if ends.output.send(Bytes::from(frame.into_bytes())).await.is_err() {
                        return Ok(());
                    }
                }
                None => return Ok(()),
            },
            frame = ends.input.recv() => match frame {
                Some(data) => {
                    let Ok(text) = std::str::from_utf8(&data) else {
                        continue;
                    };
                    if guac::is_internal(text) {
                        continue;
                    }
                    tunnel.write_frame(text).await?;
                }
                None => return Ok(()),
            },
            _ = ends.away.cancelled() => return Ok(()),
        }
    }
}
