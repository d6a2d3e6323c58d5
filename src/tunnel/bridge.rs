//! Server side of the tunnel: decrypt calls, admit, forward, reply.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{SecureChannel, TunnelCall, TunnelReply};
use crate::auth::{GRPC_STATUS_UNAUTHENTICATED, REJECTION_MESSAGE, extract_from_tunnel};
use crate::backend::PayloadEncoding;
use crate::credentials::VerifyContext;
use crate::gateway::GatewayState;
use crate::permissions::Transport;
use crate::{Error, Result};

/// Serves one tunnel session.
#[derive(Debug, Clone)]
pub struct TunnelBridge {
    state: Arc<GatewayState>,
}

impl TunnelBridge {
    /// Bridge calls into `state`.
    #[must_use]
    pub fn new(state: Arc<GatewayState>) -> Self {
        Self { state }
    }

    /// Run the handshake and then serve calls until the peer closes.
    ///
    /// The preamble must already have been consumed from `stream`. Calls are
    /// answered in arrival order.
    ///
    /// # Errors
    ///
    /// `Error::TunnelHandshake` if the tunnel is disabled, the handshake
    /// times out or the peer does not hold the pairing secret.
    /// `Error::Framing` for a frame or call that cannot be decoded; the
    /// session is closed.
    pub async fn run<S>(&self, stream: S, peer: Option<SocketAddr>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let secret = self
            .state
            .settings
            .tunnel_secret
            .as_deref()
            .ok_or_else(|| Error::TunnelHandshake("tunnel transport disabled".into()))?;

        let limit = self.state.settings.handshake_timeout;
        let mut channel = match timeout(limit, SecureChannel::accept(stream, secret.as_bytes())).await
        {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => {
                warn!(peer = ?peer, error = %e, "Tunnel handshake failed");
                return Err(e);
            }
            Err(_) => return Err(Error::TunnelHandshake("handshake timed out".into())),
        };

        let session_id = Uuid::new_v4().to_string();
        info!(session = %session_id, peer = ?peer, "Tunnel session established");

        let mut served = 0u64;
        while let Some(message) = channel.recv().await? {
            let call: TunnelCall = serde_json::from_slice(&message)
                .map_err(|e| Error::Framing(format!("malformed tunnel call: {e}")))?;
            let reply = self.dispatch(call, &session_id, peer).await;
            channel.send(&serde_json::to_vec(&reply)?).await?;
            served += 1;
        }

        info!(session = %session_id, calls = served, "Tunnel session closed");
        Ok(())
    }

    async fn dispatch(
        &self,
        call: TunnelCall,
        session_id: &str,
        peer: Option<SocketAddr>,
    ) -> TunnelReply {
        let credential = match extract_from_tunnel(&call.metadata, session_id) {
            Ok(credential) => credential,
            Err(e) => {
                debug!(session = %session_id, method = %call.method, reason = e.reason(), "Tunnel call carried unusable credential");
                return TunnelReply {
                    id: call.id,
                    status: GRPC_STATUS_UNAUTHENTICATED,
                    message: REJECTION_MESSAGE.to_string(),
                    payload: bytes::Bytes::new(),
                };
            }
        };

        let ctx = VerifyContext::now(peer.map(|p| p.ip()));
        match self
            .state
            .call(
                &call.method,
                Transport::Tunnel,
                Some(&credential),
                &ctx,
                PayloadEncoding::Protobuf,
                call.payload,
            )
            .await
        {
            Ok(payload) => TunnelReply {
                id: call.id,
                status: 0,
                message: String::new(),
                payload,
            },
            Err(e) => TunnelReply {
                id: call.id,
                status: e.grpc_status(),
                message: e.external_message(),
                payload: bytes::Bytes::new(),
            },
        }
    }
}
