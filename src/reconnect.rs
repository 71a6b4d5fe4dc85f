//! Pluggable reconnection strategies.
//!
//! When a connection fails, the endpoint invokes its policy's error hook
//! exactly once for that failure, on a task of its own. The policy decides
//! whether and how to restore a connected state, re-attaching via
//! [`Endpoint::attach_connection`]. The contract: eventually restore a
//! connected state while outbound demand exists, without ever creating a
//! second simultaneous connection.
use std::time::Duration;

use async_trait::async_trait;
use tokio::{
    net::TcpStream,
    time::{sleep, timeout},
};
use tracing::{info, trace, warn};

use crate::{endpoint::Endpoint, error::RpcError};

/// Strategy invoked when the active connection fails.
///
/// Use the `#[async_trait]` attribute from the `async_trait` crate when
/// implementing this trait.
#[async_trait]
pub trait ReconnectPolicy: Send + Sync + 'static {
    /// Called exactly once per connection failure, after the failed
    /// connection has been detached. `endpoint` is a handle for
    /// re-attachment; `cause` is the failure that tore the connection down.
    async fn on_connection_error(&self, endpoint: Endpoint, cause: RpcError);
}

/// Leaves the endpoint disconnected. Suitable for server-accepted
/// connections, where the peer is expected to dial back in.
pub struct NoReconnect;

#[async_trait]
impl ReconnectPolicy for NoReconnect {
    async fn on_connection_error(&self, _endpoint: Endpoint, cause: RpcError) {
        trace!(%cause, "connection lost, reconnection disabled");
    }
}

/// Reconnects to a fixed TCP address, retrying on a fixed interval until the
/// endpoint is closed or a connection is attached.
pub struct Reconnect {
    addr: String,
    connect_timeout: Duration,
    retry_interval: Duration,
}

impl Reconnect {
    pub fn new(addr: impl Into<String>) -> Self {
        Self::with_intervals(addr, Duration::from_secs(5), Duration::from_secs(2))
    }

    pub fn with_intervals(
        addr: impl Into<String>,
        connect_timeout: Duration,
        retry_interval: Duration,
    ) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
            retry_interval,
        }
    }
}

#[async_trait]
impl ReconnectPolicy for Reconnect {
    async fn on_connection_error(&self, endpoint: Endpoint, cause: RpcError) {
        warn!(addr = %self.addr, %cause, "connection lost, reconnecting");
        while !endpoint.is_closed() {
            let stream = match timeout(self.connect_timeout, TcpStream::connect(&self.addr)).await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(error)) => {
                    warn!(addr = %self.addr, %error, "reconnect attempt failed");
                    sleep(self.retry_interval).await;
                    continue;
                }
                Err(_) => {
                    warn!(addr = %self.addr, "reconnect attempt timed out");
                    sleep(self.retry_interval).await;
                    continue;
                }
            };
            if endpoint.attach_connection(stream) {
                info!(addr = %self.addr, "reconnected");
            } else {
                // Another connection was attached while we were dialing; let
                // it stand rather than racing a second one in.
                trace!(addr = %self.addr, "connection already restored");
            }
            return;
        }
    }
}

/// Demand-driven variant of [`Reconnect`]: polls on a fixed interval and only
/// dials when the endpoint is disconnected and has queued outbound work, so
/// an idle client is not reconnected needlessly.
pub struct Watchdog {
    addr: String,
    poll_interval: Duration,
    connect_timeout: Duration,
}

impl Watchdog {
    pub fn new(addr: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            addr: addr.into(),
            poll_interval,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl ReconnectPolicy for Watchdog {
    async fn on_connection_error(&self, endpoint: Endpoint, cause: RpcError) {
        warn!(addr = %self.addr, %cause, "connection lost, watching for outbound demand");
        loop {
            sleep(self.poll_interval).await;
            if endpoint.is_closed() || endpoint.is_connected() {
                return;
            }
            if endpoint.queued_outbound() == 0 {
                continue;
            }
            match timeout(self.connect_timeout, TcpStream::connect(&self.addr)).await {
                Ok(Ok(stream)) => {
                    if endpoint.attach_connection(stream) {
                        info!(addr = %self.addr, "reconnected");
                        return;
                    }
                }
                Ok(Err(error)) => warn!(addr = %self.addr, %error, "reconnect attempt failed"),
                Err(_) => warn!(addr = %self.addr, "reconnect attempt timed out"),
            }
        }
    }
}
