//! Encrypted tunnel channel.
//!
//! Handshake (after the `LGTUNNEL` preamble):
//!
//! ```text
//! initiator                                   responder
//!    │ ── ephemeral X25519 public (32) ──────────▶ │
//!    │ ◀────────── ephemeral X25519 public (32) ── │
//!    │   keys = HKDF-SHA256(dh || pairing secret)  │
//!    │ ── seal(client confirm) ──────────────────▶ │  wrong secret: close
//!    │ ◀──────────────────── seal(server confirm) ─ │
//! ```
//!
//! Frames are `u32` big-endian length + ChaCha20-Poly1305 ciphertext. Each
//! direction has its own key and a 64-bit counter nonce.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use curve25519_dalek::montgomery::MontgomeryPoint;
use hkdf::Hkdf;
use rand::RngExt;
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::TUNNEL_PREAMBLE;
use crate::{Error, Result};

/// Largest plaintext accepted in one frame.
pub const MAX_PLAINTEXT_LEN: usize = 4 * 1024 * 1024;

const TAG_LEN: usize = 16;
const KDF_INFO: &[u8] = b"lightgate tunnel v1";
const CLIENT_CONFIRM: &[u8] = b"lightgate tunnel client confirm";
const SERVER_CONFIRM: &[u8] = b"lightgate tunnel server confirm";

struct CipherState {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl CipherState {
    fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            counter: 0,
        }
    }

    fn next_nonce(&mut self) -> Result<[u8; 12]> {
        let counter = self.counter;
        self.counter = counter
            .checked_add(1)
            .ok_or_else(|| Error::Framing("tunnel nonce space exhausted".into()))?;
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&counter.to_be_bytes());
        Ok(nonce)
    }

    fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.next_nonce()?;
        self.cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| Error::Framing("tunnel frame encryption failed".into()))
    }

    fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.next_nonce()?;
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| Error::Framing("tunnel frame failed authentication".into()))
    }
}

/// An authenticated, encrypted message channel.
pub struct SecureChannel<S> {
    stream: S,
    send: CipherState,
    recv: CipherState,
}

impl<S> std::fmt::Debug for SecureChannel<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("sent", &self.send.counter)
            .field("received", &self.recv.counter)
            .finish_non_exhaustive()
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> SecureChannel<S> {
    /// Initiator side: writes the preamble and runs the handshake.
    ///
    /// # Errors
    ///
    /// `Error::TunnelHandshake` if the responder does not prove knowledge
    /// of the pairing secret or closes the connection.
    pub async fn connect(mut stream: S, pairing_secret: &[u8]) -> Result<Self> {
        let secret: [u8; 32] = rand::rng().random();
        let public = MontgomeryPoint::mul_base_clamped(secret);

        let mut hello = Vec::with_capacity(TUNNEL_PREAMBLE.len() + 32);
        hello.extend_from_slice(TUNNEL_PREAMBLE);
        hello.extend_from_slice(public.as_bytes());
        stream.write_all(&hello).await.map_err(handshake_io)?;
        stream.flush().await.map_err(handshake_io)?;

        let peer = read_public(&mut stream).await?;
        let (c2s, s2c) = derive_keys(secret, &public, &peer, pairing_secret, true)?;
        let mut channel = Self {
            stream,
            send: CipherState::new(&c2s),
            recv: CipherState::new(&s2c),
        };

        channel.send(CLIENT_CONFIRM).await.map_err(into_handshake)?;
        match channel.recv().await {
            Ok(Some(confirm)) if confirm == SERVER_CONFIRM => Ok(channel),
            Ok(_) | Err(_) => Err(Error::TunnelHandshake(
                "responder rejected the pairing secret".into(),
            )),
        }
    }

    /// Responder side; the preamble has already been consumed.
    ///
    /// # Errors
    ///
    /// `Error::TunnelHandshake` if the initiator does not prove knowledge of
    /// the pairing secret.
    pub async fn accept(mut stream: S, pairing_secret: &[u8]) -> Result<Self> {
        let peer = read_public(&mut stream).await?;

        let secret: [u8; 32] = rand::rng().random();
        let public = MontgomeryPoint::mul_base_clamped(secret);
        stream
            .write_all(public.as_bytes())
            .await
            .map_err(handshake_io)?;
        stream.flush().await.map_err(handshake_io)?;

        let (c2s, s2c) = derive_keys(secret, &peer, &public, pairing_secret, false)?;
        let mut channel = Self {
            stream,
            send: CipherState::new(&s2c),
            recv: CipherState::new(&c2s),
        };

        match channel.recv().await {
            Ok(Some(confirm)) if confirm == CLIENT_CONFIRM => {}
            Ok(_) | Err(_) => {
                return Err(Error::TunnelHandshake(
                    "initiator failed key confirmation".into(),
                ));
            }
        }
        channel.send(SERVER_CONFIRM).await.map_err(into_handshake)?;
        Ok(channel)
    }

    /// Encrypt and send one message.
    ///
    /// # Errors
    ///
    /// `Error::Framing` for an oversized message, `Error::Io` on write
    /// failure.
    pub async fn send(&mut self, plaintext: &[u8]) -> Result<()> {
        if plaintext.len() > MAX_PLAINTEXT_LEN {
            return Err(Error::Framing(format!(
                "tunnel message of {} bytes exceeds {MAX_PLAINTEXT_LEN}",
                plaintext.len()
            )));
        }
        let ciphertext = self.send.seal(plaintext)?;
        let len = u32::try_from(ciphertext.len())
            .map_err(|_| Error::Framing("tunnel frame too large".into()))?;
        self.stream.write_u32(len).await?;
        self.stream.write_all(&ciphertext).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Receive and decrypt one message; `None` on a clean close.
    ///
    /// # Errors
    ///
    /// `Error::Framing` for a bad length or failed authentication,
    /// `Error::Io` on read failure.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        let len = match self.stream.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if !(TAG_LEN..=MAX_PLAINTEXT_LEN + TAG_LEN).contains(&len) {
            return Err(Error::Framing(format!("invalid tunnel frame length {len}")));
        }
        let mut ciphertext = vec![0u8; len];
        self.stream.read_exact(&mut ciphertext).await?;
        self.recv.open(&ciphertext).map(Some)
    }

    /// Close the write half.
    ///
    /// # Errors
    ///
    /// `Error::Io` if shutdown fails.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

async fn read_public<S: AsyncRead + Unpin>(stream: &mut S) -> Result<MontgomeryPoint> {
    let mut bytes = [0u8; 32];
    stream.read_exact(&mut bytes).await.map_err(handshake_io)?;
    Ok(MontgomeryPoint(bytes))
}

/// Returns `(initiator→responder, responder→initiator)` keys.
fn derive_keys(
    own_secret: [u8; 32],
    initiator_public: &MontgomeryPoint,
    responder_public: &MontgomeryPoint,
    pairing_secret: &[u8],
    is_initiator: bool,
) -> Result<([u8; 32], [u8; 32])> {
    let peer = if is_initiator {
        responder_public
    } else {
        initiator_public
    };
    let shared = peer.mul_clamped(own_secret);
    if shared.as_bytes().iter().all(|b| *b == 0) {
        return Err(Error::TunnelHandshake("low-order public key".into()));
    }

    let mut ikm = Vec::with_capacity(32 + pairing_secret.len());
    ikm.extend_from_slice(shared.as_bytes());
    ikm.extend_from_slice(pairing_secret);

    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(initiator_public.as_bytes());
    salt[32..].copy_from_slice(responder_public.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(&salt), &ikm);
    let mut okm = [0u8; 64];
    hk.expand(KDF_INFO, &mut okm)
        .map_err(|_| Error::TunnelHandshake("key derivation failed".into()))?;

    let mut c2s = [0u8; 32];
    let mut s2c = [0u8; 32];
    c2s.copy_from_slice(&okm[..32]);
    s2c.copy_from_slice(&okm[32..]);
    Ok((c2s, s2c))
}

#[allow(clippy::needless_pass_by_value)]
fn handshake_io(e: std::io::Error) -> Error {
    Error::TunnelHandshake(format!("connection failed during handshake: {e}"))
}

fn into_handshake(e: Error) -> Error {
    match e {
        Error::TunnelHandshake(_) => e,
        other => Error::TunnelHandshake(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn responder_side(
        mut stream: tokio::io::DuplexStream,
        secret: &'static [u8],
    ) -> Result<SecureChannel<tokio::io::DuplexStream>> {
        let mut preamble = [0u8; 8];
        stream.read_exact(&mut preamble).await?;
        assert_eq!(&preamble, TUNNEL_PREAMBLE);
        SecureChannel::accept(stream, secret).await
    }

    #[tokio::test]
    async fn matching_secrets_exchange_messages() {
        let (a, b) = tokio::io::duplex(1 << 16);
        let server = tokio::spawn(async move {
            let mut ch = responder_side(b, b"pairing").await.unwrap();
            let msg = ch.recv().await.unwrap().unwrap();
            ch.send(&msg).await.unwrap();
            assert!(ch.recv().await.unwrap().is_none());
        });

        let mut client = SecureChannel::connect(a, b"pairing").await.unwrap();
        client.send(b"ping").await.unwrap();
        assert_eq!(client.recv().await.unwrap().unwrap(), b"ping");
        client.shutdown().await.unwrap();
        drop(client);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn wrong_secret_aborts_both_sides() {
        let (a, b) = tokio::io::duplex(1 << 16);
        let server = tokio::spawn(async move { responder_side(b, b"right").await.map(|_| ()) });

        let client = SecureChannel::connect(a, b"wrong").await;
        assert!(matches!(client, Err(Error::TunnelHandshake(_))));
        assert!(matches!(server.await.unwrap(), Err(Error::TunnelHandshake(_))));
    }

    #[tokio::test]
    async fn low_order_point_is_refused() {
        let (mut a, b) = tokio::io::duplex(1 << 16);
        let server = tokio::spawn(async move { responder_side(b, b"pairing").await.map(|_| ()) });
        a.write_all(TUNNEL_PREAMBLE).await.unwrap();
        a.write_all(&[0u8; 32]).await.unwrap();
        let err = server.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::TunnelHandshake(_)));
    }

    #[test]
    fn nonces_are_unique_per_direction() {
        let mut state = CipherState::new(&[7u8; 32]);
        let a = state.next_nonce().unwrap();
        let b = state.next_nonce().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn replayed_frame_fails_authentication() {
        let key = [9u8; 32];
        let mut sender = CipherState::new(&key);
        let mut receiver = CipherState::new(&key);
        let frame = sender.seal(b"once").unwrap();
        assert_eq!(receiver.open(&frame).unwrap(), b"once");
        assert!(receiver.open(&frame).is_err());
    }
}
