//! # Session controller
//!
//! Drives both peers through the two-way connection, key-agreement
//! bootstrap, and the symmetric session lifecycle:
//!
//! ```text
//! Idle -> Listening -> Connected -> SessionStarted -> Ending -> Connected
//! ```
//!
//! with `Faulted` reachable from any state on an unrecoverable error.
//! One concrete type is shared by both a transmitter and a detector
//! process rather than splitting them into separate subclasses — which
//! side drives session start is a runtime config bit
//! (`detector_goes_first`), not a distinct type.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::{Side, SessionConfig};
use crate::error::{Error, Result};
use crate::net::connector::{ConnectToMeHandler, TwoWayConnector};
use crate::net::keyagreement::{KeyAgreement, SharedKeyAgreementHandler};
use crate::net::rpc::{Dispatcher, RequestHandler, RpcChannel, RpcError, RpcRequest, RpcResponse, StatusCode};
use crate::reports::SystemParameters;

/// The controller's current place in the session lifecycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Listening,
    Connected,
    SessionStarted,
    Ending,
    Faulted,
}

struct Inner {
    state: SessionState,
    connector: Option<Arc<TwoWayConnector>>,
    session_token: Option<String>,
    parameters: Option<SystemParameters>,
    fault_reason: Option<String>,
}

/// Coordinates one peer's side of a session. Construct one per process;
/// register any pipeline-stage `RequestHandler`s on `dispatcher()`
/// before calling `listen`.
pub struct SessionController {
    config: SessionConfig,
    dispatcher: Dispatcher,
    key_agreement: Arc<KeyAgreement>,
    rpc_timeout: Duration,
    inner: Mutex<Inner>,
}

impl SessionController {
    pub fn new(config: SessionConfig) -> Arc<SessionController> {
        let dispatcher = Dispatcher::new();
        let key_agreement = Arc::new(KeyAgreement::new());
        dispatcher.register(Arc::new(SharedKeyAgreementHandler::new(Arc::clone(&key_agreement))));

        let rpc_timeout = Duration::from_millis(config.connect_timeout_ms);
        let controller = Arc::new(SessionController {
            config,
            dispatcher,
            key_agreement,
            rpc_timeout,
            inner: Mutex::new(Inner {
                state: SessionState::Idle,
                connector: None,
                session_token: None,
                parameters: None,
                fault_reason: None,
            }),
        });

        controller
            .dispatcher
            .register(Arc::new(SessionEndpointHandler { controller: Arc::downgrade(&controller) }));
        controller
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().unwrap().state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The dispatcher pipeline stages should register their
    /// `RequestHandler`s on before `listen` is called.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn key_agreement(&self) -> &Arc<KeyAgreement> {
        &self.key_agreement
    }

    pub fn session_token(&self) -> Option<String> {
        self.inner.lock().unwrap().session_token.clone()
    }

    /// Whether this peer should be the one to call `start_session`
    ///. Both peers must
    /// be configured with the same `detector_goes_first` bit; the
    /// controller does not negotiate it.
    pub fn should_start_session(&self) -> bool {
        match self.config.side {
            Side::Detector => self.config.detector_goes_first,
            Side::Transmitter => !self.config.detector_goes_first,
        }
    }

    /// Idle -> Listening: bind the local RPC server and register the
    /// `ConnectToMe` endpoint.
    pub fn listen(self: &Arc<Self>, bind_addr: &str, advertise_addr: impl Into<String>) -> Result<Arc<TwoWayConnector>> {
        let mut inner = self.inner.lock().unwrap();
        self.require(&inner, SessionState::Idle)?;

        let connector = TwoWayConnector::bind(bind_addr, advertise_addr, self.dispatcher.clone())?;
        self.dispatcher
            .register(Arc::new(ConnectToMeHandler::new(Arc::clone(&connector), self.rpc_timeout)));

        inner.connector = Some(Arc::clone(&connector));
        inner.state = SessionState::Listening;
        Ok(connector)
    }

    /// Listening -> Connected, as the dialing side.
    pub fn connect_to_peer(self: &Arc<Self>, peer_addr: &str) -> Result<Arc<RpcChannel>> {
        let connector = {
            let inner = self.inner.lock().unwrap();
            self.require(&inner, SessionState::Listening)?;
            inner.connector.clone().ok_or_else(|| Error::Internal("listening with no connector bound".into()))?
        };

        let channel = connector.connect_with_timeout(peer_addr, self.rpc_timeout)?;
        self.inner.lock().unwrap().state = SessionState::Connected;
        Ok(channel)
    }

    /// Listening -> Connected, as the side waiting to be dialed.
    pub fn await_peer(self: &Arc<Self>, timeout: Duration) -> Result<Arc<RpcChannel>> {
        let connector = {
            let inner = self.inner.lock().unwrap();
            self.require(&inner, SessionState::Listening)?;
            inner.connector.clone().ok_or_else(|| Error::Internal("listening with no connector bound".into()))?
        };

        let channel = connector.wait_for_client(timeout)?;
        self.inner.lock().unwrap().state = SessionState::Connected;
        Ok(channel)
    }

    /// Connected -> SessionStarted, as the initiator: runs the
    /// key-agreement bootstrap then announces the session.
    pub fn start_session(self: &Arc<Self>, channel: &RpcChannel, parameters: SystemParameters, my_address: &str) -> Result<String> {
        {
            let inner = self.inner.lock().unwrap();
            self.require(&inner, SessionState::Connected)?;
        }

        let token = self.key_agreement.initiate(channel, self.rpc_timeout)?;

        let response = channel
            .call(
                RpcRequest::SessionStarting { parameters, initiator_addr: my_address.to_string() },
                self.rpc_timeout,
            )
            .map_err(Error::from)?;
        if !matches!(response, RpcResponse::Empty) {
            return Err(Error::ProtocolMismatch("unexpected response to SessionStarting".into()));
        }

        let mut inner = self.inner.lock().unwrap();
        inner.state = SessionState::SessionStarted;
        inner.session_token = Some(token.clone());
        inner.parameters = Some(parameters);
        log::info!("session {} started ({:?})", token, self.config.side);
        Ok(token)
    }

    /// SessionStarted -> Ending, as the side that decides to end the
    /// session.
    pub fn end_session(self: &Arc<Self>, channel: &RpcChannel) -> Result<()> {
        {
            let inner = self.inner.lock().unwrap();
            self.require(&inner, SessionState::SessionStarted)?;
        }
        channel.call(RpcRequest::SessionEnding, self.rpc_timeout).map_err(Error::from)?;
        self.inner.lock().unwrap().state = SessionState::Ending;
        Ok(())
    }

    /// Ending -> Connected: call once local pipeline stages have
    /// drained and this side is ready for another `start_session`.
    pub fn finish_teardown(self: &Arc<Self>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        self.require(&inner, SessionState::Ending)?;
        inner.state = SessionState::Connected;
        inner.session_token = None;
        inner.parameters = None;
        Ok(())
    }

    /// Force a transition to `Faulted` from any state.
    pub fn fault(&self, reason: impl Into<String>) {
        let reason = reason.into();
        log::error!("session faulted: {}", reason);
        let mut inner = self.inner.lock().unwrap();
        inner.state = SessionState::Faulted;
        inner.fault_reason = Some(reason);
    }

    pub fn fault_reason(&self) -> Option<String> {
        self.inner.lock().unwrap().fault_reason.clone()
    }

    /// Drop the connector and return to `Idle`, from `Faulted` or
    /// `Connected`.
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            SessionState::Faulted | SessionState::Connected | SessionState::Listening => {}
            other => return Err(Error::SessionFaulted(format!("cannot reset from state {:?}", other))),
        }
        if let Some(connector) = &inner.connector {
            connector.disconnect();
        }
        inner.state = SessionState::Idle;
        inner.connector = None;
        inner.session_token = None;
        inner.parameters = None;
        inner.fault_reason = None;
        Ok(())
    }

    fn require(&self, inner: &Inner, expected: SessionState) -> Result<()> {
        if inner.state == expected {
            Ok(())
        } else {
            Err(Error::SessionFaulted(format!(
                "expected state {:?}, found {:?}",
                expected, inner.state
            )))
        }
    }

    fn handle_session_starting(&self, parameters: SystemParameters, _initiator_addr: String) -> std::result::Result<RpcResponse, RpcError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != SessionState::Connected {
            return Err(RpcError::new(
                StatusCode::FailedPrecondition,
                format!("SessionStarting received while in state {:?}", inner.state),
            ));
        }
        inner.state = SessionState::SessionStarted;
        inner.parameters = Some(parameters);
        // The token was already recorded by `SharedKeyAgreementHandler`
        // answering the initiator's `SharePublicKey` call, which always
        // precedes `SessionStarting` on the wire.
        Ok(RpcResponse::Empty)
    }

    fn handle_session_ending(&self) -> std::result::Result<RpcResponse, RpcError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != SessionState::SessionStarted {
            return Err(RpcError::new(
                StatusCode::FailedPrecondition,
                format!("SessionEnding received while in state {:?}", inner.state),
            ));
        }
        inner.state = SessionState::Ending;
        Ok(RpcResponse::Empty)
    }
}

/// Serves `SessionStarting`/`SessionEnding` on behalf of a
/// `SessionController`. Holds a `Weak` reference since the controller
/// owns the dispatcher this handler is registered on.
struct SessionEndpointHandler {
    controller: std::sync::Weak<SessionController>,
}

impl RequestHandler for SessionEndpointHandler {
    fn handle(&self, request: RpcRequest) -> std::result::Result<RpcResponse, RpcError> {
        let controller = self
            .controller
            .upgrade()
            .ok_or_else(|| RpcError::new(StatusCode::Aborted, "session controller dropped"))?;
        match request {
            RpcRequest::SessionStarting { parameters, initiator_addr } => controller.handle_session_starting(parameters, initiator_addr),
            RpcRequest::SessionEnding => controller.handle_session_ending(),
            _ => Err(RpcError::new(StatusCode::NotFound, "not a session-lifecycle request")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Side;

    fn params() -> SystemParameters {
        SystemParameters {
            frame_width_ps: 1024 * 100_000,
            slot_width_ps: 100_000,
            pulse_width_ps: 1_000,
            max_drift_ps_per_second: 1_000_000,
            acceptance_ratio: 0.9,
            frame_slot_count: 1024,
        }
    }

    fn config(side: Side) -> SessionConfig {
        SessionConfig {
            side,
            connect_timeout_ms: 1_000,
            ..SessionConfig::default()
        }
    }

    #[test]
    fn full_lifecycle_reaches_session_started_on_both_sides() {
        let transmitter = SessionController::new(config(Side::Transmitter));
        let detector = SessionController::new(config(Side::Detector));

        let t_connector = transmitter.listen("127.0.0.1:0", "placeholder").unwrap();
        let t_addr = format!("127.0.0.1:{}", t_connector.local_addr().port());
        t_connector.set_advertised_address(t_addr.clone());

        let d_connector = detector.listen("127.0.0.1:0", "placeholder").unwrap();
        let d_addr = format!("127.0.0.1:{}", d_connector.local_addr().port());
        d_connector.set_advertised_address(d_addr.clone());

        assert_eq!(transmitter.state(), SessionState::Listening);
        assert_eq!(detector.state(), SessionState::Listening);

        let detector_clone = Arc::clone(&detector);
        let waiter = std::thread::spawn(move || detector_clone.await_peer(Duration::from_secs(2)));

        let channel = transmitter.connect_to_peer(&d_addr).unwrap();
        waiter.join().unwrap().unwrap();

        assert_eq!(transmitter.state(), SessionState::Connected);
        assert_eq!(detector.state(), SessionState::Connected);

        assert!(transmitter.should_start_session());
        assert!(!detector.should_start_session());

        let token = transmitter.start_session(&channel, params(), &t_addr).unwrap();
        assert_eq!(transmitter.state(), SessionState::SessionStarted);
        assert_eq!(detector.state(), SessionState::SessionStarted);
        assert!(!token.is_empty());

        transmitter.end_session(&channel).unwrap();
        assert_eq!(transmitter.state(), SessionState::Ending);
        assert_eq!(detector.state(), SessionState::Ending);

        transmitter.finish_teardown().unwrap();
        detector.finish_teardown().unwrap();
        assert_eq!(transmitter.state(), SessionState::Connected);
        assert_eq!(detector.state(), SessionState::Connected);
    }

    #[test]
    fn start_session_requires_connected_state() {
        let controller = SessionController::new(config(Side::Transmitter));
        let connector = controller.listen("127.0.0.1:0", "placeholder").unwrap();
        assert_eq!(controller.state(), SessionState::Listening);

        // A loopback channel is enough to exercise the state guard in
        // `start_session` without another peer to answer it.
        let addr = format!("127.0.0.1:{}", connector.local_addr().port());
        let channel = RpcChannel::connect(&addr, Duration::from_secs(1)).unwrap();
        let err = controller.start_session(&channel, params(), &addr);
        assert!(matches!(err, Err(Error::SessionFaulted(_))));

        controller.reset().unwrap();
        assert_eq!(controller.state(), SessionState::Idle);
    }

    #[test]
    fn fault_is_reachable_from_any_state() {
        let controller = SessionController::new(config(Side::Transmitter));
        controller.fault("simulated unrecoverable error");
        assert_eq!(controller.state(), SessionState::Faulted);
        assert_eq!(controller.fault_reason().unwrap(), "simulated unrecoverable error");
        controller.reset().unwrap();
        assert_eq!(controller.state(), SessionState::Idle);
    }

    #[test]
    fn should_start_session_follows_detector_goes_first() {
        let mut cfg = config(Side::Transmitter);
        cfg.detector_goes_first = true;
        let transmitter = SessionController::new(cfg);
        assert!(!transmitter.should_start_session());

        let mut cfg = config(Side::Detector);
        cfg.detector_goes_first = true;
        let detector = SessionController::new(cfg);
        assert!(detector.should_start_session());
    }
}
