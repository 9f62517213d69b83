//! Per-connection event loop shared by client and server sockets.
//!
//! One call to [`drive`] owns a connected [`ManagedSocket`] for its whole
//! life: it runs the listen loop, ticks the connection monitor, answers and
//! swallows ping/pong markers, and fans received payloads out to the
//! application event channel.

use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::managed::{
    CloseStatus, ManagedSocket, SocketCloseResult, SocketEvent, SocketMode, SocketOptions,
};
use crate::monitor::{ConnectionMonitor, MonitorOptions, PING_MARKER, PONG_MARKER};

const RECEIVE_CHANNEL_CAPACITY: usize = 64;

/// Reject option combinations that cannot work before any I/O happens.
pub(crate) fn validate_options(
    socket: &SocketOptions,
    monitor: Option<&MonitorOptions>,
) -> anyhow::Result<()> {
    if socket.buffer_size == 0 {
        anyhow::bail!("buffer_size must be positive");
    }
    if socket.extreme_message_size == 0 {
        anyhow::bail!("extreme_message_size must be positive");
    }
    if monitor.is_some() && socket.mode == SocketMode::Raw {
        anyhow::bail!("connection monitor requires messaging mode");
    }
    Ok(())
}

/// Drive one connection until it closes.
///
/// Returns the close result; the caller emits the `Disconnected` event and
/// decides whether to reconnect. Cancellation of `cancel` closes the link
/// with `ClosedLocal` and stops the monitor, so no dead-link verdict can
/// fire after an intentional stop.
pub(crate) async fn drive(
    socket: Arc<ManagedSocket>,
    monitor: Option<MonitorOptions>,
    events: &mpsc::Sender<SocketEvent>,
    cancel: &CancellationToken,
) -> SocketCloseResult {
    let messaging = socket.options().mode == SocketMode::Messaging;

    let (received_tx, mut received_rx) = mpsc::channel(RECEIVE_CHANNEL_CAPACITY);
    let mut listen_task = tokio::spawn({
        let socket = socket.clone();
        let cancel = cancel.clone();
        async move { socket.listen(received_tx, cancel).await }
    });

    let mut monitor_state = monitor.map(ConnectionMonitor::new);
    let mut ping_timer = monitor_state.as_ref().map(|mon| {
        let mut interval = tokio::time::interval(mon.ping_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval
    });
    // Internal control sends are bounded by socket closure, not by a token.
    let control_cancel = CancellationToken::new();

    loop {
        tokio::select! {
            biased;

            result = &mut listen_task => {
                return result.unwrap_or_else(|e| SocketCloseResult {
                    status: CloseStatus::Error,
                    error: Some(anyhow!(e).context("listen task failed")),
                });
            }

            _ = tick(&mut ping_timer) => {
                if let Some(mon) = monitor_state.as_mut() {
                    if mon.is_dead(Instant::now()) {
                        warn!("no pong within the deadline; declaring connection lost");
                        socket.close_with(CloseStatus::ClosedRemote);
                    } else {
                        let status = socket.send(PING_MARKER, &control_cancel).await;
                        trace!(?status, "sent ping");
                    }
                }
            }

            maybe = received_rx.recv() => {
                let Some(payload) = maybe else { continue };

                if messaging && payload.as_ref() == PING_MARKER {
                    // Always answer pings so a one-sided monitor works.
                    let status = socket.send(PONG_MARKER, &control_cancel).await;
                    trace!(?status, "answered ping");
                } else if messaging && payload.as_ref() == PONG_MARKER {
                    if let Some(mon) = monitor_state.as_mut() {
                        mon.record_pong();
                    }
                    trace!("observed pong");
                } else if events.send(SocketEvent::Received(payload)).await.is_err() {
                    // The application dropped its receiver; nobody is left
                    // to observe this connection.
                    socket.disconnect().await;
                }
            }
        }
    }
}

async fn tick(timer: &mut Option<tokio::time::Interval>) {
    match timer {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
