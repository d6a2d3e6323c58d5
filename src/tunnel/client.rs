//! Client side of the tunnel.

use std::collections::BTreeMap;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use super::{SecureChannel, TunnelCall, TunnelReply};
use crate::{Error, Result};

/// Issues calls over an established tunnel, one at a time.
#[derive(Debug)]
pub struct TunnelClient<S> {
    channel: SecureChannel<S>,
    next_id: u64,
}

impl<S: AsyncRead + AsyncWrite + Unpin> TunnelClient<S> {
    /// Write the preamble and complete the handshake over `stream`.
    ///
    /// # Errors
    ///
    /// `Error::TunnelHandshake` if the gateway does not accept the pairing
    /// secret.
    pub async fn connect(stream: S, pairing_secret: &str) -> Result<Self> {
        let channel = SecureChannel::connect(stream, pairing_secret.as_bytes()).await?;
        Ok(Self {
            channel,
            next_id: 1,
        })
    }

    /// Call `method` and wait for its reply.
    ///
    /// # Errors
    ///
    /// `Error::Framing` if the gateway closes the session or answers a
    /// different call. A rejected or failed call is an `Ok` reply with a
    /// non-zero status.
    pub async fn call(
        &mut self,
        method: &str,
        metadata: BTreeMap<String, String>,
        payload: Bytes,
    ) -> Result<TunnelReply> {
        let id = self.next_id;
        self.next_id += 1;
        let call = TunnelCall {
            id,
            method: method.to_string(),
            metadata,
            payload,
        };
        self.channel.send(&serde_json::to_vec(&call)?).await?;

        let raw = self
            .channel
            .recv()
            .await?
            .ok_or_else(|| Error::Framing("tunnel closed before reply".into()))?;
        let reply: TunnelReply = serde_json::from_slice(&raw)?;
        if reply.id != id {
            return Err(Error::Framing(format!(
                "reply for call {} while waiting for {id}",
                reply.id
            )));
        }
        Ok(reply)
    }

    /// Close the session.
    ///
    /// # Errors
    ///
    /// `Error::Io` if shutdown fails.
    pub async fn close(mut self) -> Result<()> {
        self.channel.shutdown().await
    }
}
