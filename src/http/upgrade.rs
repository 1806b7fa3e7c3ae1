//! Connection take-over: `101 Switching Protocols` upgrades and streamed relays.
//!
//! The server owns the TCP stream while a handler runs. A handler that wants
//! to take the connection over sends a first response through an
//! [`OnUpgrade`] handle; the connection task writes that response, then hands
//! the raw stream back as an [`Upgraded`] value and stops treating the
//! connection as HTTP. Websocket endpoints send their switching response this
//! way, and the fallback proxy sends the upstream response head before
//! streaming the body itself.

use std::fmt;

use bytes::Bytes;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use super::Response;

/// Failure to take over the underlying connection.
#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("connection closed before the upgrade completed")]
    ConnectionClosed,
}

/// A connection handed over after a successful upgrade.
pub struct Upgraded {
    stream: TcpStream,
    read_buf: Bytes,
}

impl Upgraded {
    /// Splits into the raw stream and any bytes the server had already read
    /// past the end of the upgrade request.
    pub fn into_parts(self) -> (TcpStream, Bytes) {
        (self.stream, self.read_buf)
    }
}

impl fmt::Debug for Upgraded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upgraded")
            .field("peer", &self.stream.peer_addr().ok())
            .field("buffered", &self.read_buf.len())
            .finish()
    }
}

// Sent from the handler side to the connection task.
pub(crate) struct UpgradeRequest {
    pub(crate) response: Response,
    pub(crate) reply: oneshot::Sender<Upgraded>,
}

/// Handler-side half of an upgrade: consumed by [`OnUpgrade::upgrade`].
pub struct OnUpgrade {
    tx: oneshot::Sender<UpgradeRequest>,
}

impl OnUpgrade {
    /// Asks the connection task to write `switching` and surrender the stream.
    ///
    /// The connection is closed once the new owner drops the stream.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::ConnectionClosed`] if the connection task is
    /// gone or dropped the request.
    pub async fn upgrade(self, switching: Response) -> Result<Upgraded, UpgradeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(UpgradeRequest {
                response: switching,
                reply,
            })
            .map_err(|_| UpgradeError::ConnectionClosed)?;
        rx.await.map_err(|_| UpgradeError::ConnectionClosed)
    }
}

impl fmt::Debug for OnUpgrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnUpgrade")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// Connection-side half of an upgrade.
pub(crate) type PendingUpgrade = oneshot::Receiver<UpgradeRequest>;

/// Creates a linked handle pair for one request.
pub(crate) fn pair() -> (OnUpgrade, PendingUpgrade) {
    let (tx, rx) = oneshot::channel();
    (OnUpgrade { tx }, rx)
}

/// Builds an [`Upgraded`] from the pieces the connection task still owns.
pub(crate) fn upgraded(stream: TcpStream, read_buf: Bytes) -> Upgraded {
    Upgraded { stream, read_buf }
}
