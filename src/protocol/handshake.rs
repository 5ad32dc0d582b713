//! Server side of the obfuscated handshake.
//!
//! One round trip: the client sends a 64-byte preamble, the server derives the
//! session key material, picks an endpoint and replies with 32 bytes of
//! AES-CTR ciphertext. There is no keyed validation of the preamble; any 64
//! bytes are accepted.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::{
    encrypt_ctr, md5, sha256, CryptoEngine, SecureRandom, AUTH_KEY_SIZE, CTR_IV_SIZE, NONCE_SIZE,
    SECRET_SIZE,
};
use crate::endpoint::{DcId, EndpointRegistry, FALLBACK_DC};
use crate::error::{Error, Result};
use crate::protocol::{
    CLIENT_NONCE_OFFSET, DEFAULT_HANDSHAKE_TIMEOUT, PREAMBLE_SIZE, RESPONSE_SIZE, SELECTOR_SIZE,
};

/// The fixed-size opening message of a client.
#[derive(Clone)]
pub struct HandshakePreamble([u8; PREAMBLE_SIZE]);

impl HandshakePreamble {
    /// Wrap a full preamble.
    pub fn new(bytes: [u8; PREAMBLE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Validate and copy a preamble from a byte slice.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        if data.len() != PREAMBLE_SIZE {
            return Err(Error::protocol(format!(
                "invalid preamble length: {} bytes, expected {}",
                data.len(),
                PREAMBLE_SIZE
            )));
        }
        let mut bytes = [0u8; PREAMBLE_SIZE];
        bytes.copy_from_slice(data);
        Ok(Self(bytes))
    }

    /// Client nonce, `preamble[8..24]`.
    pub fn client_nonce(&self) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&self.0[CLIENT_NONCE_OFFSET..CLIENT_NONCE_OFFSET + NONCE_SIZE]);
        nonce
    }

    /// Endpoint selector, `preamble[0..16]`.
    pub fn selector(&self) -> &[u8] {
        &self.0[..SELECTOR_SIZE]
    }

    /// Raw preamble bytes.
    pub fn as_bytes(&self) -> &[u8; PREAMBLE_SIZE] {
        &self.0
    }
}

impl fmt::Debug for HandshakePreamble {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandshakePreamble({}…)", hex::encode(self.selector()))
    }
}

/// Key material established by a successful handshake.
///
/// Owned by a single connection and wiped when dropped.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct AuthSession {
    client_nonce: [u8; NONCE_SIZE],
    server_nonce: [u8; NONCE_SIZE],
    auth_key: [u8; AUTH_KEY_SIZE],
    comm_iv: [u8; CTR_IV_SIZE],
    #[zeroize(skip)]
    endpoint_id: DcId,
}

impl AuthSession {
    /// Nonce taken from the client preamble.
    pub fn client_nonce(&self) -> &[u8; NONCE_SIZE] {
        &self.client_nonce
    }

    /// Nonce generated by the server.
    pub fn server_nonce(&self) -> &[u8; NONCE_SIZE] {
        &self.server_nonce
    }

    /// Session auth key.
    pub fn auth_key(&self) -> &[u8; AUTH_KEY_SIZE] {
        &self.auth_key
    }

    /// Session communication IV.
    pub fn comm_iv(&self) -> &[u8; CTR_IV_SIZE] {
        &self.comm_iv
    }

    /// Endpoint chosen for this session.
    pub fn endpoint_id(&self) -> DcId {
        self.endpoint_id
    }
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSession")
            .field("client_nonce", &hex::encode(self.client_nonce))
            .field("endpoint_id", &self.endpoint_id)
            .finish_non_exhaustive()
    }
}

/// Handshake progress, reported when a handshake fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStage {
    /// Waiting for the 64-byte preamble
    AwaitPreamble,
    /// Checking the preamble
    Validate,
    /// Deriving keys and building the response
    DeriveResponse,
    /// Choosing the remote endpoint
    SelectEndpoint,
    /// Writing the response
    Respond,
    /// Handshake complete
    Established,
    /// Handshake failed
    Rejected,
}

impl fmt::Display for HandshakeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeStage::AwaitPreamble => "await-preamble",
            HandshakeStage::Validate => "validate",
            HandshakeStage::DeriveResponse => "derive-response",
            HandshakeStage::SelectEndpoint => "select-endpoint",
            HandshakeStage::Respond => "respond",
            HandshakeStage::Established => "established",
            HandshakeStage::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

/// Map an endpoint selector to a DC id in `1..=count`.
///
/// `MD5(selector)[0] mod count + 1`. An empty table maps to the fallback DC.
pub fn select_endpoint(selector: &[u8], count: usize) -> DcId {
    if count == 0 {
        return FALLBACK_DC;
    }
    let digest = md5(selector);
    (digest[0] as usize % count + 1) as DcId
}

/// Performs the server half of the handshake.
#[derive(Clone)]
pub struct ServerHandshake {
    engine: Arc<CryptoEngine>,
    endpoints: Arc<EndpointRegistry>,
    timeout: Duration,
}

impl ServerHandshake {
    /// Create a handshake driver with the default preamble timeout.
    pub fn new(engine: Arc<CryptoEngine>, endpoints: Arc<EndpointRegistry>) -> Self {
        Self {
            engine,
            endpoints,
            timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Override the preamble timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Preamble timeout in effect.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Process a preamble with a fresh random server nonce.
    pub fn process(
        &self,
        preamble: &HandshakePreamble,
    ) -> Result<(AuthSession, [u8; RESPONSE_SIZE])> {
        self.respond_with_nonce(preamble, SecureRandom::bytes())
    }

    /// Process a preamble with a caller-supplied server nonce.
    pub fn respond_with_nonce(
        &self,
        preamble: &HandshakePreamble,
        server_nonce: [u8; NONCE_SIZE],
    ) -> Result<(AuthSession, [u8; RESPONSE_SIZE])> {
        let (mut session, response) = self.derive_response(preamble, server_nonce)?;
        self.select(preamble, &mut session);
        Ok((session, response))
    }

    /// Build the response and session keys. The endpoint is left at the
    /// fallback until [`ServerHandshake::select`] runs.
    fn derive_response(
        &self,
        preamble: &HandshakePreamble,
        server_nonce: [u8; NONCE_SIZE],
    ) -> Result<(AuthSession, [u8; RESPONSE_SIZE])> {
        let secret = self.engine.secret().as_bytes();

        let mut payload = Zeroizing::new([0u8; NONCE_SIZE + SECRET_SIZE]);
        payload[..NONCE_SIZE].copy_from_slice(&server_nonce);
        payload[NONCE_SIZE..].copy_from_slice(secret);

        let key = Zeroizing::new(sha256(&payload[..]));
        let iv = sha256(&payload[NONCE_SIZE..]);
        let ciphertext = encrypt_ctr(&payload[..], &key[..], &iv[..CTR_IV_SIZE])?;

        let mut response = [0u8; RESPONSE_SIZE];
        response.copy_from_slice(&ciphertext);

        let client_nonce = preamble.client_nonce();
        let (auth_key, comm_iv) = self.engine.derive_auth_key(&client_nonce, &server_nonce)?;

        let session = AuthSession {
            client_nonce,
            server_nonce,
            auth_key,
            comm_iv,
            endpoint_id: FALLBACK_DC,
        };
        Ok((session, response))
    }

    /// Map the preamble selector onto the selectable ids of the current
    /// endpoint table.
    fn select(&self, preamble: &HandshakePreamble, session: &mut AuthSession) {
        let table = self.endpoints.snapshot();
        session.endpoint_id = select_endpoint(preamble.selector(), table.selectable_count());
        if table.get(session.endpoint_id).is_none() {
            tracing::debug!(
                "selected endpoint {} not in table, falling back to {}",
                session.endpoint_id,
                FALLBACK_DC
            );
        }
    }

    /// Run the handshake on `stream`.
    ///
    /// Nothing is written unless a full preamble arrives within the timeout.
    pub async fn perform<S>(&self, stream: &mut S) -> Result<AuthSession>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stage = HandshakeStage::AwaitPreamble;
        match self.drive(stream, &mut stage).await {
            Ok(session) => {
                tracing::debug!(
                    "handshake {} with endpoint {}",
                    HandshakeStage::Established,
                    session.endpoint_id
                );
                Ok(session)
            }
            Err(e) => {
                tracing::debug!("handshake {} at stage {}: {}", HandshakeStage::Rejected, stage, e);
                Err(e)
            }
        }
    }

    async fn drive<S>(&self, stream: &mut S, stage: &mut HandshakeStage) -> Result<AuthSession>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = [0u8; PREAMBLE_SIZE];
        match tokio::time::timeout(self.timeout, stream.read_exact(&mut buf)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(Error::protocol("connection closed before full preamble"));
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(Error::timeout(self.timeout)),
        }

        *stage = HandshakeStage::Validate;
        let preamble = HandshakePreamble::from_slice(&buf)?;

        *stage = HandshakeStage::DeriveResponse;
        let (mut session, response) = self.derive_response(&preamble, SecureRandom::bytes())?;

        *stage = HandshakeStage::SelectEndpoint;
        self.select(&preamble, &mut session);

        *stage = HandshakeStage::Respond;
        stream.write_all(&response).await?;
        stream.flush().await?;

        Ok(session)
    }
}
