//! # Key-agreement bootstrap
//!
//! Before stages exchange any protected data, each side generates a
//! per-process ephemeral elliptic-curve keypair on Curve25519, exchanges
//! public keys over the session's RPC, derives a shared secret via ECDH,
//! and stores it under a session token.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use hkdf::Hkdf;
use sha2::Sha256;
use uuid::Uuid;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{Error, Result};
use crate::net::rpc::{RequestHandler, RpcChannel, RpcError, RpcRequest, RpcResponse, StatusCode};

/// Algorithm identifier for X25519 over the wire. Any other value in a
/// peer's request is a `ProtocolMismatch`.
pub const ALGORITHM_X25519: u8 = 1;

/// Generates an ephemeral keypair, runs `SharePublicKey` against a peer,
/// and stores the resulting shared secrets by session token.
pub struct KeyAgreement {
    secret: StaticSecret,
    public: PublicKey,
    sessions: Mutex<HashMap<String, Vec<u8>>>,
}

impl KeyAgreement {
    pub fn new() -> KeyAgreement {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        KeyAgreement {
            secret,
            public,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Act as the initiator: call `SharePublicKey` on `channel`, derive
    /// the shared secret from the peer's reply, and return the
    /// negotiated session token.
    pub fn initiate(&self, channel: &RpcChannel, timeout: Duration) -> Result<String> {
        let request = RpcRequest::SharePublicKey {
            algorithm_id: ALGORITHM_X25519,
            public_key_bytes: self.public_key_bytes().to_vec(),
            token: None,
        };
        let response = channel.call(request, timeout).map_err(Error::from)?;

        match response {
            RpcResponse::PublicKey { algorithm_id, public_key_bytes, token } => {
                if algorithm_id != ALGORITHM_X25519 {
                    return Err(Error::ProtocolMismatch(format!(
                        "peer replied with algorithm id {}, expected {}",
                        algorithm_id, ALGORITHM_X25519
                    )));
                }
                let peer_public = parse_public_key(&public_key_bytes)?;
                let shared = self.secret.diffie_hellman(&peer_public);
                self.sessions.lock().unwrap().insert(token.clone(), shared.as_bytes().to_vec());
                Ok(token)
            }
            _ => Err(Error::ProtocolMismatch("unexpected response to SharePublicKey".into())),
        }
    }

    /// Act as the responder to an incoming `SharePublicKey` call.
    fn handle_share_public_key(&self, algorithm_id: u8, public_key_bytes: Vec<u8>, token: Option<String>) -> std::result::Result<RpcResponse, RpcError> {
        if algorithm_id != ALGORITHM_X25519 {
            return Err(RpcError::new(
                StatusCode::InvalidArgument,
                format!("unsupported algorithm id {}", algorithm_id),
            ));
        }
        let peer_public = parse_public_key(&public_key_bytes)
            .map_err(|e| RpcError::new(StatusCode::InvalidArgument, format!("{}", e)))?;
        let shared = self.secret.diffie_hellman(&peer_public);

        let token = match token {
            Some(t) if !t.is_empty() => t,
            _ => Uuid::new_v4().to_string(),
        };
        self.sessions.lock().unwrap().insert(token.clone(), shared.as_bytes().to_vec());

        Ok(RpcResponse::PublicKey {
            algorithm_id: ALGORITHM_X25519,
            public_key_bytes: self.public_key_bytes().to_vec(),
            token,
        })
    }

    /// Expand the shared secret for `token` into `out_len` bytes of seed
    /// material tagged with `info` (e.g. a stage name), via HKDF-SHA256.
    /// Deterministic and identical on both sides given the same shared
    /// secret.
    pub fn derive_seed(&self, token: &str, info: &[u8], out_len: usize) -> Result<Vec<u8>> {
        let sessions = self.sessions.lock().unwrap();
        let secret = sessions
            .get(token)
            .ok_or_else(|| Error::Internal(format!("no shared secret for token {}", token)))?;
        let hk = Hkdf::<Sha256>::new(None, secret);
        let mut okm = vec![0u8; out_len];
        hk.expand(info, &mut okm)
            .map_err(|_| Error::Internal("HKDF output length invalid".into()))?;
        Ok(okm)
    }

    pub fn shared_secret(&self, token: &str) -> Option<Vec<u8>> {
        self.sessions.lock().unwrap().get(token).cloned()
    }
}

impl Default for KeyAgreement {
    fn default() -> Self {
        KeyAgreement::new()
    }
}

fn parse_public_key(bytes: &[u8]) -> Result<PublicKey> {
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::ProtocolMismatch(format!("public key must be 32 bytes, got {}", bytes.len())))?;
    Ok(PublicKey::from(array))
}

/// An owned, `Arc`-friendly handler used by the session controller,
/// which needs `'static` handlers to register with a `Dispatcher`.
pub struct SharedKeyAgreementHandler {
    inner: std::sync::Arc<KeyAgreement>,
}

impl SharedKeyAgreementHandler {
    pub fn new(inner: std::sync::Arc<KeyAgreement>) -> SharedKeyAgreementHandler {
        SharedKeyAgreementHandler { inner }
    }
}

impl RequestHandler for SharedKeyAgreementHandler {
    fn handle(&self, request: RpcRequest) -> std::result::Result<RpcResponse, RpcError> {
        match request {
            RpcRequest::SharePublicKey { algorithm_id, public_key_bytes, token } => {
                self.inner.handle_share_public_key(algorithm_id, public_key_bytes, token)
            }
            _ => Err(RpcError::new(StatusCode::NotFound, "not a SharePublicKey request")),
        }
    }
}
