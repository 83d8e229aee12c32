//! Connection actor: handshake, keepalive and request/response correlation
//! over one [`Link`].
//!
//! A connection moves through `Connecting → Handshaking → Established →
//! Closed`. The handshake runs before the actor starts; once established,
//! one task owns the link, the table of pending requests and their
//! deadlines. [`Connection`] is the cheap handle other tasks use to talk to
//! it.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cxo_core::PublicKey;
use cxo_store::{ContentStore, StoreError};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, debug_span, trace, warn, Instrument};

use crate::codec;
use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use crate::messages::{Envelope, Msg, PROTOCOL_VERSION};
use crate::registry::RegistryHandle;
use crate::transport::Link;

/// Process-unique connection id.
pub type ConnId = u64;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Handshaking,
    Established,
    Closed,
}

pub(crate) enum ConnCmd {
    Send(Envelope),
    Request {
        msg: Msg,
        reply: oneshot::Sender<Result<Msg>>,
    },
}

/// What a connection needs from its node.
#[derive(Clone)]
pub(crate) struct ConnContext {
    pub node_id: PublicKey,
    pub config: Arc<NodeConfig>,
    pub cxds: Arc<dyn ContentStore>,
    pub registry: RegistryHandle,
}

struct Inner {
    id: ConnId,
    address: String,
    incoming: bool,
    peer_id: PublicKey,
    cmd: mpsc::Sender<ConnCmd>,
    state: watch::Receiver<ConnState>,
    shutdown: Notify,
}

/// Handle to an established connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("address", &self.inner.address)
            .field("peer_id", &self.inner.peer_id)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    pub fn id(&self) -> ConnId {
        self.inner.id
    }

    /// Remote address.
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// The node id the peer presented in the handshake.
    pub fn peer_id(&self) -> PublicKey {
        self.inner.peer_id
    }

    /// Whether the peer dialed us.
    pub fn is_incoming(&self) -> bool {
        self.inner.incoming
    }

    pub fn state(&self) -> ConnState {
        *self.inner.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnState::Closed
    }

    /// Wait until the connection is closed.
    pub async fn closed(&self) {
        let mut state = self.inner.state.clone();
        let _ = state.wait_for(|s| *s == ConnState::Closed).await;
    }

    /// Close the connection. Safe to call any number of times, from anywhere.
    pub fn close(&self) {
        self.inner.shutdown.notify_one();
    }

    /// Queue a message. A full queue closes the connection.
    pub fn send(&self, msg: Msg) -> Result<()> {
        self.push(ConnCmd::Send(Envelope::new(msg)))
    }

    pub(crate) fn reply(&self, to: u64, msg: Msg) -> Result<()> {
        self.push(ConnCmd::Send(Envelope::reply(to, msg)))
    }

    /// Send a request and wait for the matching response.
    pub async fn request(&self, msg: Msg) -> Result<Msg> {
        self.start_request(msg)?
            .await
            .map_err(|_| NodeError::ConnectionClosed)?
    }

    /// Queue a request now; the response arrives on the returned channel.
    pub(crate) fn start_request(&self, msg: Msg) -> Result<oneshot::Receiver<Result<Msg>>> {
        let (reply, rx) = oneshot::channel();
        self.push(ConnCmd::Request { msg, reply })?;
        Ok(rx)
    }

    /// Feeds shared by a public peer.
    pub async fn remote_feeds(&self) -> Result<Vec<PublicKey>> {
        match self.request(Msg::RequestListOfFeeds).await? {
            Msg::ListOfFeeds { feeds } => Ok(feeds),
            Msg::NonPublicServer => Err(NodeError::NotPublic),
            other => Err(NodeError::InvalidResponse(other.name().into())),
        }
    }

    fn push(&self, cmd: ConnCmd) -> Result<()> {
        match self.inner.cmd.try_send(cmd) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(conn = self.id(), "send queue full, closing connection");
                self.close();
                Err(NodeError::SendQueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(NodeError::ConnectionClosed),
        }
    }
}

/// Run the handshake over `link` and start the connection actor.
pub(crate) async fn establish(mut link: Link, incoming: bool, ctx: ConnContext) -> Result<Connection> {
    let id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    let span = debug_span!("conn", id, remote = %link.remote, incoming);

    let (state_tx, state_rx) = watch::channel(ConnState::Connecting);
    state_tx.send_replace(ConnState::Handshaking);

    let handshake = async {
        if incoming {
            accept_handshake(&mut link, &ctx).await
        } else {
            dial_handshake(&mut link, &ctx).await
        }
    };
    let peer_id = match handshake.instrument(span.clone()).await {
        Ok(peer_id) => peer_id,
        Err(e) => {
            state_tx.send_replace(ConnState::Closed);
            debug!(parent: &span, error = %e, "handshake failed");
            return Err(e);
        }
    };

    let (cmd_tx, cmd_rx) = mpsc::channel(ctx.config.send_queue_size);
    let conn = Connection {
        inner: Arc::new(Inner {
            id,
            address: link.remote.clone(),
            incoming,
            peer_id,
            cmd: cmd_tx,
            state: state_rx,
            shutdown: Notify::new(),
        }),
    };
    state_tx.send_replace(ConnState::Established);
    debug!(parent: &span, peer = %peer_id, "connection established");

    // Registered before the actor runs, so the registry never sees a message
    // from a connection it does not know.
    if let Err(e) = ctx.registry.add_conn(conn.clone()).await {
        state_tx.send_replace(ConnState::Closed);
        return Err(e);
    }

    let actor = ConnActor {
        conn: conn.clone(),
        ctx,
        link,
        cmd_rx,
        state: state_tx,
        pending: PendingTable::default(),
        last_seen: Instant::now(),
    };
    tokio::spawn(actor.run().instrument(span));
    Ok(conn)
}

async fn recv_handshake(link: &mut Link, timeout: Duration) -> Result<Envelope> {
    match tokio::time::timeout(timeout, link.rx.recv()).await {
        Err(_) => Err(NodeError::Timeout("handshake".into())),
        Ok(None) => Err(NodeError::ConnectionClosed),
        Ok(Some(frame)) => codec::decode(&frame),
    }
}

async fn send_handshake(link: &Link, env: &Envelope) -> Result<()> {
    link.tx
        .send(codec::encode(env)?)
        .await
        .map_err(|_| NodeError::ConnectionClosed)
}

async fn dial_handshake(link: &mut Link, ctx: &ConnContext) -> Result<PublicKey> {
    let hello = Envelope::new(Msg::Hello {
        version: PROTOCOL_VERSION,
        node_id: ctx.node_id,
    });
    send_handshake(link, &hello).await?;

    let env = recv_handshake(link, ctx.config.handshake_timeout).await?;
    if env.reply_to != Some(hello.id) {
        return Err(NodeError::UnexpectedMessage(format!(
            "{} during handshake",
            env.msg.name()
        )));
    }
    match env.msg {
        Msg::Accept { node_id } => Ok(node_id),
        Msg::Reject { reason } => Err(NodeError::Rejected(reason)),
        other => Err(NodeError::UnexpectedMessage(format!(
            "{} in reply to hello",
            other.name()
        ))),
    }
}

async fn accept_handshake(link: &mut Link, ctx: &ConnContext) -> Result<PublicKey> {
    let env = recv_handshake(link, ctx.config.handshake_timeout).await?;
    match env.msg {
        Msg::Hello { version, node_id } if version == PROTOCOL_VERSION => {
            let accept = Envelope::reply(
                env.id,
                Msg::Accept {
                    node_id: ctx.node_id,
                },
            );
            send_handshake(link, &accept).await?;
            Ok(node_id)
        }
        Msg::Hello { version, .. } => {
            let reason = format!(
                "protocol version {} not supported, want {}",
                version, PROTOCOL_VERSION
            );
            // The link closes right after; a lost Reject changes nothing.
            let _ = send_handshake(link, &Envelope::reply(env.id, Msg::Reject { reason })).await;
            Err(NodeError::VersionMismatch {
                local: PROTOCOL_VERSION,
                peer: version,
            })
        }
        other => Err(NodeError::UnexpectedMessage(format!(
            "{} before hello",
            other.name()
        ))),
    }
}

struct Pending {
    reply: oneshot::Sender<Result<Msg>>,
    deadline: Option<Instant>,
}

/// Size below which abandoned requests are not pruned on insert.
const PRUNE_MIN: usize = 64;

/// Requests awaiting a response, ordered by deadline.
#[derive(Default)]
struct PendingTable {
    by_id: HashMap<u64, Pending>,
    deadlines: BTreeSet<(Instant, u64)>,
    /// Size at which the next insert prunes abandoned requests.
    prune_at: usize,
}

impl PendingTable {
    fn contains(&self, id: u64) -> bool {
        self.by_id.contains_key(&id)
    }

    fn len(&self) -> usize {
        self.by_id.len()
    }

    fn insert(&mut self, id: u64, reply: oneshot::Sender<Result<Msg>>, deadline: Option<Instant>) {
        if self.by_id.len() >= self.prune_at.max(PRUNE_MIN) {
            self.prune();
            self.prune_at = self.by_id.len() * 2;
        }
        if let Some(at) = deadline {
            self.deadlines.insert((at, id));
        }
        self.by_id.insert(id, Pending { reply, deadline });
    }

    fn take(&mut self, id: u64) -> Option<oneshot::Sender<Result<Msg>>> {
        let pending = self.by_id.remove(&id)?;
        if let Some(at) = pending.deadline {
            self.deadlines.remove(&(at, id));
        }
        Some(pending.reply)
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.first().map(|(at, _)| *at)
    }

    /// Fail every request whose deadline is not after `now`.
    fn expire(&mut self, now: Instant) {
        while let Some(&(at, id)) = self.deadlines.first() {
            if at > now {
                break;
            }
            self.deadlines.pop_first();
            if let Some(pending) = self.by_id.remove(&id) {
                trace!(id, "request timed out");
                let _ = pending
                    .reply
                    .send(Err(NodeError::Timeout(format!("no response to request {}", id))));
            }
        }
    }

    /// Drop requests whose requester went away. Returns how many.
    fn prune(&mut self) -> usize {
        let before = self.by_id.len();
        let deadlines = &mut self.deadlines;
        self.by_id.retain(|id, pending| {
            let alive = !pending.reply.is_closed();
            if !alive {
                if let Some(at) = pending.deadline {
                    deadlines.remove(&(at, *id));
                }
            }
            alive
        });
        before - self.by_id.len()
    }

    fn fail_all(&mut self) {
        self.deadlines.clear();
        for (_, pending) in self.by_id.drain() {
            let _ = pending.reply.send(Err(NodeError::ConnectionClosed));
        }
    }
}

struct ConnActor {
    conn: Connection,
    ctx: ConnContext,
    link: Link,
    cmd_rx: mpsc::Receiver<ConnCmd>,
    state: watch::Sender<ConnState>,
    pending: PendingTable,
    last_seen: Instant,
}

impl ConnActor {
    async fn run(mut self) {
        match self.event_loop().await {
            Ok(()) => debug!("connection closed"),
            Err(NodeError::ConnectionClosed) => debug!("connection closed by peer"),
            Err(e) => debug!(error = %e, "connection closed"),
        }

        self.state.send_replace(ConnState::Closed);
        self.pending.fail_all();
        self.cmd_rx.close();
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            if let ConnCmd::Request { reply, .. } = cmd {
                let _ = reply.send(Err(NodeError::ConnectionClosed));
            }
        }

        let _ = self.ctx.registry.conn_closed(self.conn.id()).await;
    }

    async fn event_loop(&mut self) -> Result<()> {
        let interval = self.ctx.config.ping_interval;
        let mut ping = (!interval.is_zero()).then(|| {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            let next_deadline = self.pending.next_deadline();

            tokio::select! {
                biased;

                _ = self.conn.inner.shutdown.notified() => return Ok(()),

                frame = self.link.rx.recv() => match frame {
                    Some(frame) => self.on_frame(frame).await?,
                    None => return Err(NodeError::ConnectionClosed),
                },

                Some(cmd) = self.cmd_rx.recv() => self.on_cmd(cmd)?,

                _ = sleep_until(next_deadline) => self.pending.expire(Instant::now()),

                _ = tick(&mut ping) => self.keepalive(interval)?,
            }
        }
    }

    fn write(&mut self, env: &Envelope) -> Result<()> {
        trace!(msg = env.msg.name(), id = env.id, "send");
        let frame = codec::encode(env)?;
        match self.link.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(NodeError::SendQueueFull),
            Err(TrySendError::Closed(_)) => Err(NodeError::ConnectionClosed),
        }
    }

    fn on_cmd(&mut self, cmd: ConnCmd) -> Result<()> {
        match cmd {
            ConnCmd::Send(env) => self.write(&env),
            ConnCmd::Request { msg, reply } => {
                let mut env = Envelope::new(msg);
                while self.pending.contains(env.id) {
                    env.id = rand::random();
                }
                self.write(&env)?;

                let deadline = self
                    .ctx
                    .config
                    .response_deadline()
                    .map(|d| Instant::now() + d);
                self.pending.insert(env.id, reply, deadline);
                Ok(())
            }
        }
    }

    fn keepalive(&mut self, interval: Duration) -> Result<()> {
        if self.last_seen.elapsed() >= interval * 2 {
            return Err(NodeError::Timeout("keepalive".into()));
        }
        let pruned = self.pending.prune();
        if pruned > 0 {
            trace!(pruned, left = self.pending.len(), "abandoned requests dropped");
        }
        self.write(&Envelope::new(Msg::Ping))
    }

    async fn on_frame(&mut self, frame: Bytes) -> Result<()> {
        self.last_seen = Instant::now();
        let env = codec::decode(&frame)?;
        trace!(msg = env.msg.name(), id = env.id, "recv");

        if let Some(to) = env.reply_to {
            if !env.msg.is_response() {
                return Err(NodeError::UnexpectedMessage(format!("{} as a response", env.msg.name())));
            }
            match self.pending.take(to) {
                Some(reply) => {
                    let _ = reply.send(Ok(env.msg));
                }
                None => warn!(reply_to = to, msg = env.msg.name(), "unmatched response dropped"),
            }
            return Ok(());
        }

        let conn_id = self.conn.id();
        match env.msg {
            Msg::Ping => self.write(&Envelope::new(Msg::Pong))?,
            Msg::Pong => {}
            Msg::Hello { .. } => {
                return Err(NodeError::UnexpectedMessage("hello after handshake".into()));
            }
            Msg::Subscribe { feed } => {
                self.ctx.registry.remote_subscribe(conn_id, feed, env.id).await?;
            }
            Msg::Unsubscribe { feed } => {
                self.ctx.registry.remote_unsubscribe(conn_id, feed).await?;
            }
            Msg::Root(root) => {
                self.ctx.registry.received_root(conn_id, root).await?;
            }
            Msg::RequestObject { hash } => {
                let msg = match self.ctx.cxds.get(&hash, 0) {
                    Ok((value, _)) => Msg::Object { value },
                    Err(StoreError::NotFound(_)) => Msg::NotFound { hash },
                    Err(e) => {
                        warn!(%hash, error = %e, "object lookup failed");
                        Msg::NotFound { hash }
                    }
                };
                self.write(&Envelope::reply(env.id, msg))?;
            }
            Msg::RequestListOfFeeds => {
                if self.ctx.config.public {
                    let conn = self.conn.clone();
                    let registry = self.ctx.registry.clone();
                    let id = env.id;
                    tokio::spawn(
                        async move {
                            if let Ok(feeds) = registry.list_feeds().await {
                                let _ = conn.reply(id, Msg::ListOfFeeds { feeds });
                            }
                        }
                        .in_current_span(),
                    );
                } else {
                    self.write(&Envelope::reply(env.id, Msg::NonPublicServer))?;
                }
            }
            other => debug!(msg = other.name(), "unsolicited response dropped"),
        }
        Ok(())
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::head::HeadContext;
    use crate::hooks::NoHooks;
    use crate::registry;
    use crate::transport::link_pair;
    use cxo_core::{CborSchema, Keypair};
    use cxo_store::{IdxDb, MemoryCxds};

    fn context(config: NodeConfig) -> ConnContext {
        let cxds: Arc<dyn ContentStore> = Arc::new(MemoryCxds::new());
        let config = Arc::new(config);
        let registry = registry::spawn(HeadContext {
            cxds: cxds.clone(),
            idx: Arc::new(IdxDb::open_memory().unwrap()),
            walker: Arc::new(CborSchema),
            hooks: Arc::new(NoHooks),
            config: config.clone(),
        })
        .unwrap();
        ConnContext {
            node_id: Keypair::from_seed(&[1; 32]).public_key(),
            config,
            cxds,
            registry,
        }
    }

    fn quick() -> NodeConfig {
        NodeConfig {
            handshake_timeout: Duration::from_millis(200),
            response_timeout: Duration::from_millis(200),
            ping_interval: Duration::ZERO,
            ..NodeConfig::default()
        }
    }

    async fn peer_recv(link: &mut Link) -> Envelope {
        let frame = tokio::time::timeout(Duration::from_secs(5), link.rx.recv())
            .await
            .expect("peer timed out")
            .expect("link closed");
        codec::decode(&frame).unwrap()
    }

    async fn peer_send(link: &Link, env: Envelope) {
        link.tx.send(codec::encode(&env).unwrap()).await.unwrap();
    }

    /// Establish a dialing connection against a hand-driven acceptor.
    async fn dialed(ctx: ConnContext) -> (Connection, Link) {
        let (ours, mut peer) = link_pair("us", "peer", 64);
        let peer_key = Keypair::from_seed(&[2; 32]).public_key();

        let (conn, _) = tokio::join!(establish(ours, false, ctx), async {
            let hello = peer_recv(&mut peer).await;
            assert!(matches!(hello.msg, Msg::Hello { version: PROTOCOL_VERSION, .. }));
            peer_send(&peer, Envelope::reply(hello.id, Msg::Accept { node_id: peer_key })).await;
        });
        let conn = conn.unwrap();
        assert_eq!(conn.peer_id(), peer_key);
        (conn, peer)
    }

    #[tokio::test]
    async fn test_handshake_dial() {
        let (conn, _peer) = dialed(context(quick())).await;
        assert_eq!(conn.state(), ConnState::Established);
        assert!(!conn.is_incoming());
    }

    #[tokio::test]
    async fn test_handshake_rejects_version() {
        let ctx = context(quick());
        let (ours, mut peer) = link_pair("us", "peer", 64);

        let (res, _) = tokio::join!(establish(ours, true, ctx), async {
            let hello = Envelope::new(Msg::Hello {
                version: PROTOCOL_VERSION + 1,
                node_id: PublicKey::default(),
            });
            peer_send(&peer, hello.clone()).await;
            let reply = peer_recv(&mut peer).await;
            assert_eq!(reply.reply_to, Some(hello.id));
            assert!(matches!(reply.msg, Msg::Reject { .. }));
        });
        assert!(matches!(res, Err(NodeError::VersionMismatch { .. })));
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let ctx = context(quick());
        let (ours, _peer) = link_pair("us", "peer", 64);
        let res = establish(ours, false, ctx).await;
        assert!(matches!(res, Err(NodeError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_handshake_rejected_by_peer() {
        let ctx = context(quick());
        let (ours, mut peer) = link_pair("us", "peer", 64);
        let (res, _) = tokio::join!(establish(ours, false, ctx), async {
            let hello = peer_recv(&mut peer).await;
            peer_send(
                &peer,
                Envelope::reply(hello.id, Msg::Reject { reason: "busy".into() }),
            )
            .await;
        });
        assert!(matches!(res, Err(NodeError::Rejected(r)) if r == "busy"));
    }

    #[tokio::test]
    async fn test_request_response_and_unmatched() {
        let (conn, mut peer) = dialed(context(quick())).await;

        let requester = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.request(Msg::RequestListOfFeeds).await })
        };

        let req = peer_recv(&mut peer).await;
        assert_eq!(req.msg, Msg::RequestListOfFeeds);

        // a response nobody asked for is dropped
        peer_send(&peer, Envelope::reply(req.id.wrapping_add(1), Msg::NonPublicServer)).await;
        peer_send(&peer, Envelope::reply(req.id, Msg::ListOfFeeds { feeds: vec![] })).await;

        let resp = requester.await.unwrap().unwrap();
        assert_eq!(resp, Msg::ListOfFeeds { feeds: vec![] });
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let (conn, mut peer) = dialed(context(quick())).await;
        let res = conn.request(Msg::RequestListOfFeeds).await;
        assert!(matches!(res, Err(NodeError::Timeout(_))));
        // the request did reach the peer
        assert_eq!(peer_recv(&mut peer).await.msg, Msg::RequestListOfFeeds);
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_is_idempotent() {
        let config = NodeConfig {
            response_timeout: Duration::ZERO,
            ..quick()
        };
        let (conn, mut peer) = dialed(context(config)).await;

        let requester = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.request(Msg::RequestListOfFeeds).await })
        };
        peer_recv(&mut peer).await;

        conn.close();
        conn.close();
        let res = requester.await.unwrap();
        assert!(matches!(res, Err(NodeError::ConnectionClosed)));

        tokio::time::timeout(Duration::from_secs(1), conn.closed())
            .await
            .unwrap();
        assert!(conn.is_closed());
        conn.close();
        assert!(matches!(
            conn.request(Msg::RequestListOfFeeds).await,
            Err(NodeError::ConnectionClosed)
        ));

        // the peer sees the link go away
        let rest = tokio::time::timeout(Duration::from_secs(1), peer.rx.recv())
            .await
            .unwrap();
        assert!(rest.is_none());
    }

    #[tokio::test]
    async fn test_serves_objects_and_pings() {
        let ctx = context(quick());
        let (hash, _) = ctx.cxds.add(b"served").unwrap();
        let (_conn, mut peer) = dialed(ctx).await;

        let req = Envelope::new(Msg::RequestObject { hash });
        peer_send(&peer, req.clone()).await;
        let resp = peer_recv(&mut peer).await;
        assert_eq!(resp.reply_to, Some(req.id));
        assert_eq!(
            resp.msg,
            Msg::Object {
                value: Bytes::from_static(b"served")
            }
        );

        let missing = cxo_core::Hash::sum(b"missing");
        let req = Envelope::new(Msg::RequestObject { hash: missing });
        peer_send(&peer, req.clone()).await;
        let resp = peer_recv(&mut peer).await;
        assert_eq!(resp.msg, Msg::NotFound { hash: missing });

        peer_send(&peer, Envelope::new(Msg::Ping)).await;
        assert_eq!(peer_recv(&mut peer).await.msg, Msg::Pong);

        let req = Envelope::new(Msg::RequestListOfFeeds);
        peer_send(&peer, req.clone()).await;
        assert_eq!(peer_recv(&mut peer).await.msg, Msg::NonPublicServer);
    }

    #[tokio::test]
    async fn test_keepalive_closes_silent_peer() {
        let config = NodeConfig {
            ping_interval: Duration::from_millis(30),
            ..quick()
        };
        let (conn, _peer) = dialed(context(config)).await;
        tokio::time::timeout(Duration::from_secs(2), conn.closed())
            .await
            .expect("silent peer should be dropped");
    }

    #[tokio::test]
    async fn test_protocol_error_closes() {
        let (conn, peer) = dialed(context(quick())).await;
        peer.tx.send(Bytes::from_static(b"\xff\xff\xff")).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), conn.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_send_queue_full_closes() {
        let ctx = context(quick());
        let (ours, mut peer) = link_pair("us", "peer", 1);
        let peer_key = Keypair::from_seed(&[2; 32]).public_key();
        let (conn, _) = tokio::join!(establish(ours, false, ctx), async {
            let hello = peer_recv(&mut peer).await;
            peer_send(&peer, Envelope::reply(hello.id, Msg::Accept { node_id: peer_key })).await;
        });
        let conn = conn.unwrap();

        // the peer never reads; the one-frame link fills up
        for _ in 0..8 {
            let _ = conn.send(Msg::Ping);
        }
        tokio::time::timeout(Duration::from_secs(1), conn.closed())
            .await
            .expect("overflowing connection should close");
    }

    #[tokio::test]
    async fn test_request_kind_as_response_closes() {
        let (conn, peer) = dialed(context(quick())).await;
        peer_send(&peer, Envelope::reply(7, Msg::Ping)).await;
        tokio::time::timeout(Duration::from_secs(1), conn.closed())
            .await
            .expect("a ping cannot answer a request");
    }

    #[test]
    fn test_pending_table_prunes_abandoned_requests() {
        let mut table = PendingTable::default();
        let later = Instant::now() + Duration::from_secs(60);

        let (kept, mut kept_rx) = oneshot::channel();
        table.insert(1, kept, Some(later));
        for id in 2..=(PRUNE_MIN as u64 + 10) {
            let (reply, rx) = oneshot::channel();
            drop(rx);
            table.insert(id, reply, if id % 2 == 0 { Some(later) } else { None });
        }
        // Inserting past the threshold already pruned the abandoned ones.
        assert!(table.len() < PRUNE_MIN);

        table.prune();
        assert_eq!(table.len(), 1);
        assert_eq!(table.next_deadline(), Some(later));

        table.expire(later);
        assert_eq!(table.len(), 0);
        assert!(matches!(kept_rx.try_recv(), Ok(Err(NodeError::Timeout(_)))));
    }

    #[test]
    fn test_pending_table_take_clears_deadline() {
        let mut table = PendingTable::default();
        let (reply, _rx) = oneshot::channel();
        table.insert(5, reply, Some(Instant::now()));
        assert!(table.take(5).is_some());
        assert!(table.take(5).is_none());
        assert_eq!(table.next_deadline(), None);
    }
}
