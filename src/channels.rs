//! # Session Channels
//!
//! The internal bus of one session: a bundle of typed queues wiring the
//! WebSocket bridge to the upstream connector. Queues are bounded at
//! capacity one so stalls propagate end-to-end exactly like the
//! rendezvous channels they model; `away` is a one-shot broadcast that
//! tells every party the session is shutting down.
//!
//! Each queue is point-to-point: the bridge produces on `in`/`window`,
//! the connector consumes them; the connector produces on `out`, the
//! bridge's driver consumes it; admin close produces on `close`, the
//! driver consumes it. The handshake outcome travels on a separate
//! oneshot created per connector run.

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol::WindowSize;

/// Rendezvous capacity: a producer blocks until the consumer takes the
/// frame, matching the unbuffered semantics the design relies on.
const QUEUE_CAPACITY: usize = 1;

/// Producer half of the bus, held by the Session.
///
/// Cloneable so the ws-reader, admin close and monitor attach can all
/// reach their queues through the registry entry.
#[derive(Debug, Clone)]
pub struct SessionBus {
    /// Client → upstream byte frames.
    pub input: mpsc::Sender<Bytes>,
    /// Client window-resize messages (SSH only).
    pub window: mpsc::Sender<WindowSize>,
    /// Username of the administrator closing the session.
    pub close: mpsc::Sender<String>,
    /// One-shot shutdown broadcast.
    pub away: CancellationToken,
}

impl SessionBus {
    /// Signals shutdown to every task of the session. Idempotent.
    pub fn shut_away(&self) {
        self.away.cancel();
    }
}

/// Consumer ends owned by the upstream connector.
#[derive(Debug)]
pub struct ConnectorEnds {
    pub input: mpsc::Receiver<Bytes>,
    pub window: mpsc::Receiver<WindowSize>,
    /// Upstream → client byte frames.
    pub output: mpsc::Sender<Bytes>,
    pub away: CancellationToken,
}

/// Consumer ends owned by the WebSocket driver.
///
/// Handed out exactly once per session; taking them is what binds the
/// primary client.
#[derive(Debug)]
pub struct BridgeEnds {
    pub output: mpsc::Receiver<Bytes>,
    pub close: mpsc::Receiver<String>,
}

/// Allocates a fresh bundle for one session.
pub fn make() -> (SessionBus, ConnectorEnds, BridgeEnds) {
    let (input_tx, input_rx) = mpsc::channel(QUEUE_CAPACITY);
    let (window_tx, window_rx) = mpsc::channel(QUEUE_CAPACITY);
    let (output_tx, output_rx) = mpsc::channel(QUEUE_CAPACITY);
    let (close_tx, close_rx) = mpsc::channel(QUEUE_CAPACITY);
    let away = CancellationToken::new();

    let bus = SessionBus {
        input: input_tx,
        window: window_tx,
        close: close_tx,
        away: away.clone(),
    };
    let connector = ConnectorEnds {
        input: input_rx,
        window: window_rx,
        output: output_tx,
        away,
    };
    let bridge = BridgeEnds {
        output: output_rx,
        close: close_rx,
    };
    (bus, connector, bridge)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn frames_flow_bridge_to_connector() {
        let (bus, mut connector, _bridge) = make();
        bus.input.send(Bytes::from_static(b"ls\n")).await.unwrap();
        assert_eq!(connector.input.recv().await.unwrap(), Bytes::from_static(b"ls\n"));
    }

    #[tokio::test]
    async fn away_is_broadcast_and_idempotent() {
        let (bus, connector, _bridge) = make();
        bus.shut_away();
        bus.shut_away();
        connector.away.cancelled().await;
    }

    #[tokio::test]
    async fn close_send_times_out_when_nobody_drains() {
        let (bus, _connector, _bridge) = make();
        // Fill the single slot, then the bounded send must give up.
        bus.close.send("admin".to_string()).await.unwrap();
        let second = bus
            .close
            .send_timeout("admin".to_string(), Duration::from_millis(20))
            .await;
        assert!(second.is_err());
    }
}
