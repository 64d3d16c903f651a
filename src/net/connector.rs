//! # Two-way connector
//!
//! The RPC framework this crate targets only dials client-to-server;
//! both peers need to act as client toward the other. `connect` dials
//! out and then asks the peer to dial back via `ConnectToMe`, caching
//! the resulting reverse channel behind one mutex and condvar.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::net::rpc::{Dispatcher, RequestHandler, RpcChannel, RpcError, RpcRequest, RpcResponse, RpcServer, StatusCode};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

struct ReverseSlot {
    channel: Option<Arc<RpcChannel>>,
}

/// Establishes bidirectional RPC between two peers from a one-sided
/// dial.
pub struct TwoWayConnector {
    my_address: Mutex<String>,
    server: RpcServer,
    forward: Mutex<Option<Arc<RpcChannel>>>,
    reverse: Mutex<ReverseSlot>,
    reverse_ready: Condvar,
    /// Guards against `ConnectToMe` recursing into `connect`.
    connecting: AtomicBool,
}

impl TwoWayConnector {
    /// Bind the local RPC server (used to serve `ConnectToMe` among
    /// other endpoints) and record the externally-reachable address this
    /// peer advertises to others.
    pub fn bind(bind_addr: &str, advertise_addr: impl Into<String>, dispatcher: Dispatcher) -> Result<Arc<TwoWayConnector>> {
        let server = RpcServer::bind(bind_addr, dispatcher)?;
        Ok(Arc::new(TwoWayConnector {
            my_address: Mutex::new(advertise_addr.into()),
            server,
            forward: Mutex::new(None),
            reverse: Mutex::new(ReverseSlot { channel: None }),
            reverse_ready: Condvar::new(),
            connecting: AtomicBool::new(false),
        }))
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.server.local_addr()
    }

    /// Override the address this peer advertises to others via
    /// `ConnectToMe`. Useful when the bind address used an ephemeral
    /// port (`:0`) and the real port is only known after binding.
    pub fn set_advertised_address(&self, addr: impl Into<String>) {
        *self.my_address.lock().unwrap() = addr.into();
    }

    /// Dial `peer_addr`, wait for the connection to be ready, then ask
    /// the peer to dial us back so both directions have a channel.
    pub fn connect(self: &Arc<Self>, peer_addr: &str) -> Result<Arc<RpcChannel>> {
        self.connect_with_timeout(peer_addr, DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn connect_with_timeout(self: &Arc<Self>, peer_addr: &str, timeout: Duration) -> Result<Arc<RpcChannel>> {
        if self.connecting.swap(true, Ordering::AcqRel) {
            return Err(Error::Internal("connect() called reentrantly".into()));
        }
        let result = self.do_connect(peer_addr, timeout);
        self.connecting.store(false, Ordering::Release);
        result
    }

    fn do_connect(self: &Arc<Self>, peer_addr: &str, timeout: Duration) -> Result<Arc<RpcChannel>> {
        let channel = RpcChannel::connect(peer_addr, timeout)
            .map_err(|e| Error::PeerUnreachable(format!("dial {} failed: {}", peer_addr, e)))?;

        let my_address = self.my_address.lock().unwrap().clone();
        let response = channel
            .call(RpcRequest::ConnectToMe { my_address }, timeout)
            .map_err(|e: RpcError| Error::PeerUnreachable(format!("ConnectToMe rejected: {}", e)))?;
        if !matches!(response, RpcResponse::Empty) {
            return Err(Error::ProtocolMismatch("unexpected ConnectToMe response".into()));
        }

        // `ConnectToMeHandler::handle` dials us back and registers the
        // resulting channel in the peer's own `reverse` slot before it
        // replies here, so by the time `call` returns both sides already
        // have a channel to use. Nothing on this side to wait for: this
        // connector's own `reverse` slot is populated only when *we*
        // answer someone else's `ConnectToMe`, not as part of dialing out.
        *self.forward.lock().unwrap() = Some(Arc::clone(&channel));
        Ok(channel)
    }

    /// Called by the `ConnectToMe` RPC handler when the peer dials back.
    pub fn on_reverse_connected(&self, channel: Arc<RpcChannel>) {
        let mut slot = self.reverse.lock().unwrap();
        slot.channel = Some(channel);
        self.reverse_ready.notify_all();
    }

    /// Block until the reverse connection is observed, or time out.
    pub fn wait_for_client(&self, timeout: Duration) -> Result<Arc<RpcChannel>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.reverse.lock().unwrap();
        loop {
            if let Some(channel) = &slot.channel {
                return Ok(Arc::clone(channel));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::PeerUnreachable("peer did not dial back in time".into()));
            }
            let (guard, timeout_result) = self
                .reverse_ready
                .wait_timeout(slot, deadline - now)
                .unwrap();
            slot = guard;
            if timeout_result.timed_out() && slot.channel.is_none() {
                return Err(Error::PeerUnreachable("peer did not dial back in time".into()));
            }
        }
    }

    /// The channel used to call out to the peer (the connection we
    /// dialed).
    pub fn forward_channel(&self) -> Option<Arc<RpcChannel>> {
        self.forward.lock().unwrap().clone()
    }

    /// Drop both directions and clear the reentrancy guard.
    pub fn disconnect(&self) {
        *self.forward.lock().unwrap() = None;
        self.reverse.lock().unwrap().channel = None;
        self.connecting.store(false, Ordering::Release);
    }
}

/// Serves the `ConnectToMe` endpoint: dials the caller back and stashes
/// the resulting channel in the connector's reverse slot.
pub struct ConnectToMeHandler {
    connector: Arc<TwoWayConnector>,
    timeout: Duration,
}

impl ConnectToMeHandler {
    pub fn new(connector: Arc<TwoWayConnector>, timeout: Duration) -> ConnectToMeHandler {
        ConnectToMeHandler { connector, timeout }
    }
}

impl RequestHandler for ConnectToMeHandler {
    fn handle(&self, request: RpcRequest) -> std::result::Result<RpcResponse, RpcError> {
        match request {
            RpcRequest::ConnectToMe { my_address } => {
                match RpcChannel::connect(&my_address, self.timeout) {
                    Ok(channel) => {
                        self.connector.on_reverse_connected(channel);
                        Ok(RpcResponse::Empty)
                    }
                    Err(e) => Err(RpcError::new(StatusCode::Unavailable, format!("dial-back failed: {}", e))),
                }
            }
            _ => Err(RpcError::new(StatusCode::NotFound, "not a ConnectToMe request")),
        }
    }
}
