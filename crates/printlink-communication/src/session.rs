//! Print session: a connection plus the ticker that drives it
//!
//! The engine does not schedule its own housekeeping. A [`PrintSession`]
//! owns a [`PrinterConnection`] and a tokio task calling
//! [`PrinterConnection::on_idle`] at the configured interval, which drains
//! the command queue and polls temperatures.

use crate::printer::{PrinterConnection, PrinterConnectionBuilder};
use printlink_core::event_bus::ConnectionEvent;
use printlink_core::{AppEvent, CommunicationState, ConnectionError, EventBus, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::debug;

/// A running printer connection
pub struct PrintSession {
    connection: Arc<PrinterConnection>,
    ticker: JoinHandle<()>,
}

impl PrintSession {
    /// Start the idle ticker for `connection`
    pub fn start(connection: Arc<PrinterConnection>) -> Self {
        let link = Arc::clone(&connection);
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(link.config().idle_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                link.on_idle();
            }
        });
        Self { connection, ticker }
    }

    /// Build a connection from `builder` and start it
    pub fn build(builder: PrinterConnectionBuilder) -> Self {
        Self::start(builder.build())
    }

    pub fn connection(&self) -> &Arc<PrinterConnection> {
        &self.connection
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        self.connection.bus()
    }

    /// Connect and wait for the handshake to finish
    ///
    /// On timeout the attempt is cancelled and its failure awaited.
    pub async fn connect_and_wait(
        &self,
        port: &str,
        baud_rate: u32,
        timeout: Duration,
    ) -> Result<()> {
        let mut events = self.bus().receiver();
        self.connection.connect(port, baud_rate).await?;

        let outcome = tokio::time::timeout(timeout, wait_for_handshake(&mut events)).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                debug!("Handshake on {} timed out", port);
                self.connection.cancel_connect();
                let grace = self.connection.config().join_timeout;
                match tokio::time::timeout(grace, wait_for_handshake(&mut events)).await {
                    Ok(Err(e)) => Err(e),
                    _ => Err(ConnectionError::Cancelled.into()),
                }
            }
        }
    }

    /// Wait until the connection reaches `state`
    pub async fn wait_for_state(&self, state: CommunicationState, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.connection.state() == state {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.connection.config().idle_interval).await;
        }
    }

    /// Stop the ticker and release the port without touching the printer
    pub async fn shutdown(self) {
        self.ticker.abort();
        self.connection.shutdown().await;
    }
}

impl Drop for PrintSession {
    fn drop(&mut self) {
        self.ticker.abort();
        self.connection.release();
    }
}

async fn wait_for_handshake(events: &mut tokio::sync::broadcast::Receiver<AppEvent>) -> Result<()> {
    loop {
        match events.recv().await {
            Ok(AppEvent::Connection(ConnectionEvent::ConnectionSucceeded { .. })) => return Ok(()),
            Ok(AppEvent::Connection(ConnectionEvent::ConnectionFailed { port, reason })) => {
                return Err(ConnectionError::HandshakeFailed {
                    port: port.unwrap_or_default(),
                    reason,
                }
                .into());
            }
            Ok(_) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return Err(ConnectionError::NotConnected.into()),
        }
    }
}
