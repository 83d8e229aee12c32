//! A scriptable remote peer.
//!
//! [`PeerHarness`] speaks the wire protocol by hand, so a test decides
//! exactly which Roots are advertised, which object requests are answered
//! and when the peer goes away.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use cxo_core::{Hash, Keypair, PublicKey, Root};
use cxo_node::{
    decode_frame, encode_frame, Envelope, Link, Msg, NodeError, Result, Transport,
    PROTOCOL_VERSION,
};

/// How long `recv` waits before failing.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// One end of a connection driven by the test.
pub struct PeerHarness {
    link: Link,
    keypair: Keypair,
    remote_id: PublicKey,
    requested: Vec<Hash>,
}

impl PeerHarness {
    /// Dial `addr` and complete the handshake.
    pub async fn connect(transport: &dyn Transport, addr: &str) -> Result<Self> {
        let link = transport.dial(addr).await?;
        Self::handshake(link, Keypair::generate()).await
    }

    /// Run the dialer's side of the handshake over an existing link.
    pub async fn handshake(link: Link, keypair: Keypair) -> Result<Self> {
        let mut peer = Self {
            link,
            keypair,
            remote_id: PublicKey([0; 32]),
            requested: Vec::new(),
        };
        let node_id = peer.id();
        let hello = peer
            .send(Msg::Hello {
                version: PROTOCOL_VERSION,
                node_id,
            })
            .await?;
        let env = peer.recv().await?;
        match env.msg {
            Msg::Accept { node_id } if env.reply_to == Some(hello) => {
                peer.remote_id = node_id;
                Ok(peer)
            }
            Msg::Reject { reason } => Err(NodeError::Rejected(reason)),
            other => Err(NodeError::UnexpectedMessage(other.name().to_string())),
        }
    }

    /// Our node id.
    pub fn id(&self) -> PublicKey {
        self.keypair.public_key()
    }

    /// The node id the remote presented.
    pub fn remote_id(&self) -> PublicKey {
        self.remote_id
    }

    /// Hashes requested from us so far, in order.
    pub fn requested(&self) -> &[Hash] {
        &self.requested
    }

    /// Send a message; returns its envelope id.
    pub async fn send(&mut self, msg: Msg) -> Result<u64> {
        let env = Envelope::new(msg);
        self.write(&env).await?;
        Ok(env.id)
    }

    /// Answer the request with id `to`.
    pub async fn reply(&mut self, to: u64, msg: Msg) -> Result<()> {
        self.write(&Envelope::reply(to, msg)).await
    }

    /// Subscribe to `feed` and wait for the answer. Messages arriving
    /// before it are dropped.
    pub async fn subscribe(&mut self, feed: PublicKey) -> Result<()> {
        let id = self.send(Msg::Subscribe { feed }).await?;
        loop {
            let env = self.recv().await?;
            if env.reply_to != Some(id) {
                continue;
            }
            return match env.msg {
                Msg::AcceptSubscription { .. } => Ok(()),
                Msg::RejectSubscription { feed } => Err(NodeError::SubscriptionRejected(feed)),
                other => Err(NodeError::InvalidResponse(other.name().to_string())),
            };
        }
    }

    /// Advertise a Root.
    pub async fn announce(&mut self, root: &Root) -> Result<()> {
        self.send(Msg::Root(root.clone())).await.map(|_| ())
    }

    async fn write(&mut self, env: &Envelope) -> Result<()> {
        self.link
            .tx
            .send(encode_frame(env)?)
            .await
            .map_err(|_| NodeError::ConnectionClosed)
    }

    /// Next message other than a keepalive; pings are answered.
    pub async fn recv(&mut self) -> Result<Envelope> {
        loop {
            let frame = match tokio::time::timeout(RECV_TIMEOUT, self.link.rx.recv()).await {
                Err(_) => return Err(NodeError::Timeout("peer harness recv".into())),
                Ok(None) => return Err(NodeError::ConnectionClosed),
                Ok(Some(frame)) => frame,
            };
            let env = decode_frame(&frame)?;
            match env.msg {
                Msg::Ping => {
                    self.send(Msg::Pong).await?;
                }
                Msg::Pong => {}
                _ => return Ok(env),
            }
        }
    }

    /// Next object request, skipping anything else. Returns the request id
    /// and the hash asked for.
    pub async fn recv_request(&mut self) -> Result<(u64, Hash)> {
        loop {
            let env = self.recv().await?;
            if let Msg::RequestObject { hash } = env.msg {
                self.requested.push(hash);
                return Ok((env.id, hash));
            }
        }
    }

    /// Answer `count` object requests from `objects`; unknown hashes get
    /// `NotFound`.
    pub async fn serve(&mut self, objects: &HashMap<Hash, Bytes>, count: usize) -> Result<()> {
        for _ in 0..count {
            let (id, hash) = self.recv_request().await?;
            let msg = match objects.get(&hash) {
                Some(value) => Msg::Object {
                    value: value.clone(),
                },
                None => Msg::NotFound { hash },
            };
            self.reply(id, msg).await?;
        }
        Ok(())
    }

    /// Ask the remote for its feed list and wait for the answer. The remote
    /// handles a connection's messages in order, so everything sent before
    /// has been processed once this returns.
    pub async fn round_trip(&mut self) -> Result<()> {
        let id = self.send(Msg::RequestListOfFeeds).await?;
        loop {
            let env = self.recv().await?;
            if env.reply_to == Some(id) {
                return Ok(());
            }
        }
    }

    /// Drop the link; the remote sees the connection close.
    pub fn disconnect(self) {
        drop(self.link);
    }
}
