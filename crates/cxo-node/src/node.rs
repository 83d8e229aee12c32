//! The Node: stores, transport and replication engine behind one API.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use cxo_core::{CborSchema, Keypair, PublicKey, Root, Walker};
use cxo_store::{ContentStore, IdxDb, MemoryCxds, ObjectStat, RootMeta};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, Instrument};

use crate::config::NodeConfig;
use crate::connection::{self, ConnContext, Connection};
use crate::error::{NodeError, Result};
use crate::filler;
use crate::head::{HeadCmd, HeadContext, HeadStatus};
use crate::hooks::{Hooks, NoHooks};
use crate::registry::{self, RegistryHandle};
use crate::transport::tcp::TcpTransport;
use crate::transport::Transport;

/// Root counts of one head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadStat {
    pub nonce: u64,
    /// Stored descriptors, full or not.
    pub roots: usize,
    pub last_full: Option<u64>,
}

/// Heads of one feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedStat {
    pub feed: PublicKey,
    pub heads: Vec<HeadStat>,
}

/// Node statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeStat {
    pub objects: ObjectStat,
    pub feeds: Vec<FeedStat>,
}

/// Builder for a [`Node`].
///
/// Everything has a default: in-memory stores, TCP, the CBOR schema, no
/// hooks and a random node id.
#[derive(Default)]
pub struct NodeBuilder {
    config: NodeConfig,
    keypair: Option<Keypair>,
    cxds: Option<Arc<dyn ContentStore>>,
    idx: Option<Arc<IdxDb>>,
    walker: Option<Arc<dyn Walker>>,
    hooks: Option<Arc<dyn Hooks>>,
    transport: Option<Arc<dyn Transport>>,
}

impl NodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    /// Node identity, presented in handshakes.
    pub fn keypair(mut self, keypair: Keypair) -> Self {
        self.keypair = Some(keypair);
        self
    }

    pub fn cxds(mut self, cxds: Arc<dyn ContentStore>) -> Self {
        self.cxds = Some(cxds);
        self
    }

    pub fn idx(mut self, idx: Arc<IdxDb>) -> Self {
        self.idx = Some(idx);
        self
    }

    pub fn walker(mut self, walker: Arc<dyn Walker>) -> Self {
        self.walker = Some(walker);
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn Hooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Start the node. Must run inside a tokio runtime.
    pub async fn spawn(self) -> Result<Node> {
        self.config.validate()?;
        let config = Arc::new(self.config);
        let keypair = self.keypair.unwrap_or_else(Keypair::generate);
        let cxds = self.cxds.unwrap_or_else(|| Arc::new(MemoryCxds::new()));
        let idx = match self.idx {
            Some(idx) => idx,
            None => Arc::new(IdxDb::open_memory()?),
        };
        let walker = self.walker.unwrap_or_else(|| Arc::new(CborSchema));
        let hooks = self.hooks.unwrap_or_else(|| Arc::new(NoHooks));
        let transport = self.transport.unwrap_or_else(|| Arc::new(TcpTransport::new()));

        let registry = registry::spawn(HeadContext {
            cxds: cxds.clone(),
            idx: idx.clone(),
            walker,
            hooks,
            config: config.clone(),
        })?;

        let node = Node {
            conn_ctx: ConnContext {
                node_id: keypair.public_key(),
                config: config.clone(),
                cxds: cxds.clone(),
                registry: registry.clone(),
            },
            keypair,
            config,
            cxds,
            idx,
            transport,
            registry,
            listeners: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        };
        info!(id = %node.id(), "node started");

        if let Some(addr) = node.config.listen.clone() {
            node.listen(&addr).await?;
        }
        Ok(node)
    }
}

/// A CXO node.
///
/// Shares feeds, replicates their Roots with connected peers and keeps the
/// object graphs of stored Roots pinned in the content store.
pub struct Node {
    keypair: Keypair,
    config: Arc<NodeConfig>,
    cxds: Arc<dyn ContentStore>,
    idx: Arc<IdxDb>,
    transport: Arc<dyn Transport>,
    registry: RegistryHandle,
    conn_ctx: ConnContext,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Node {
    pub fn builder() -> NodeBuilder {
        NodeBuilder::new()
    }

    /// The node id.
    pub fn id(&self) -> PublicKey {
        self.keypair.public_key()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn cxds(&self) -> &Arc<dyn ContentStore> {
        &self.cxds
    }

    pub fn idx(&self) -> &Arc<IdxDb> {
        &self.idx
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Connections
    // ─────────────────────────────────────────────────────────────────────────

    /// Accept connections on `addr`. Returns the address peers should dial.
    pub async fn listen(&self, addr: &str) -> Result<String> {
        self.check_open()?;
        let mut listener = self.transport.listen(addr).await?;
        let local = listener.local_addr();
        let ctx = self.conn_ctx.clone();

        let task = tokio::spawn(
            async move {
                loop {
                    match listener.accept().await {
                        Ok(link) => {
                            let ctx = ctx.clone();
                            tokio::spawn(
                                async move {
                                    if let Err(e) = connection::establish(link, true, ctx).await {
                                        debug!(error = %e, "incoming connection failed");
                                    }
                                }
                                .in_current_span(),
                            );
                        }
                        Err(e) => {
                            debug!(error = %e, "listener stopped");
                            break;
                        }
                    }
                }
            }
            .instrument(info_span!("listen", addr = %local)),
        );
        self.listeners
            .lock()
            .map_err(|_| NodeError::Closed)?
            .push(task);

        info!(addr = %local, "listening");
        Ok(local)
    }

    /// Dial `addr` and run the handshake.
    pub async fn connect(&self, addr: &str) -> Result<Connection> {
        self.check_open()?;
        let link = self.transport.dial(addr).await?;
        connection::establish(link, false, self.conn_ctx.clone()).await
    }

    /// Established connections, by id.
    pub async fn connections(&self) -> Result<Vec<Connection>> {
        self.registry.list_conns().await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Feeds
    // ─────────────────────────────────────────────────────────────────────────

    /// Share a feed. Returns false if it was shared already.
    pub async fn share(&self, feed: PublicKey) -> Result<bool> {
        self.registry.add_feed(feed).await
    }

    /// Stop sharing a feed, dropping all of its Roots.
    pub async fn del_feed(&self, feed: PublicKey) -> Result<()> {
        self.registry.del_feed(feed).await
    }

    /// Shared feeds, sorted.
    pub async fn feeds(&self) -> Result<Vec<PublicKey>> {
        self.registry.list_feeds().await
    }

    /// Exchange Roots of `feed` with the peer of `conn`. Shares the feed.
    /// Fails with `SubscriptionRejected` if the peer does not share it.
    pub async fn subscribe(&self, conn: &Connection, feed: PublicKey) -> Result<()> {
        self.registry.subscribe(conn.id(), feed).await
    }

    pub async fn unsubscribe(&self, conn: &Connection, feed: PublicKey) -> Result<()> {
        self.registry.unsubscribe(conn.id(), feed).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Roots
    // ─────────────────────────────────────────────────────────────────────────

    /// Sign and store the next Root of head `(keypair's feed, nonce)` and
    /// announce it to subscribers.
    ///
    /// Every object the payload reaches must be stored already or be among
    /// `objects`; otherwise nothing is kept and `MissingObject` is returned.
    pub async fn publish(
        &self,
        keypair: &Keypair,
        nonce: u64,
        payload: impl Into<Bytes>,
        objects: Vec<Bytes>,
    ) -> Result<Root> {
        let feed = keypair.public_key();
        self.share(feed).await?;
        let keypair = keypair.clone();
        let payload = payload.into();
        self.head_call(feed, nonce, |reply| HeadCmd::Publish {
            keypair,
            payload,
            objects,
            reply,
        })
        .await?
    }

    /// The newest Root of a head held in full.
    pub fn last_root(&self, feed: PublicKey, nonce: u64) -> Result<Option<Root>> {
        let meta = self.idx.tx(|feeds| {
            if !feeds.has(&feed)? || !feeds.heads(&feed)?.has(nonce)? {
                return Ok(None);
            }
            feeds.heads(&feed)?.roots(nonce)?.last_full()
        })?;
        meta.map(|meta| filler::load_root(&*self.cxds, &meta))
            .transpose()
    }

    /// Descriptor of a stored Root.
    pub fn root_meta(&self, feed: PublicKey, nonce: u64, seq: u64) -> Result<RootMeta> {
        Ok(self
            .idx
            .tx(|feeds| feeds.heads(&feed)?.roots(nonce)?.get(seq))?)
    }

    /// Replication state of a head.
    pub async fn head_status(&self, feed: PublicKey, nonce: u64) -> Result<HeadStatus> {
        self.head_call(feed, nonce, |reply| HeadCmd::Status { reply })
            .await
    }

    /// Seq of the Root being filled on a head, if any.
    pub async fn filling(&self, feed: PublicKey, nonce: u64) -> Result<Option<u64>> {
        Ok(self.head_status(feed, nonce).await?.filling)
    }

    /// Delete the Roots of a head with seq below `seq`, releasing their
    /// objects. Returns how many were deleted.
    pub async fn del_roots_before(&self, feed: PublicKey, nonce: u64, seq: u64) -> Result<usize> {
        self.head_call(feed, nonce, |reply| HeadCmd::DelRootsBefore { seq, reply })
            .await?
    }

    async fn head_call<T>(
        &self,
        feed: PublicKey,
        nonce: u64,
        cmd: impl FnOnce(oneshot::Sender<T>) -> HeadCmd,
    ) -> Result<T> {
        let head = self.registry.head(feed, nonce).await?;
        let (reply, rx) = oneshot::channel();
        head.send(cmd(reply)).await.map_err(|_| NodeError::Closed)?;
        rx.await.map_err(|_| NodeError::Closed)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Delete unreferenced objects. Returns how many were deleted.
    pub fn sweep(&self) -> Result<usize> {
        let removed = self.cxds.sweep()?;
        debug!(removed, "swept objects");
        Ok(removed)
    }

    pub fn stat(&self) -> Result<NodeStat> {
        let objects = self.cxds.stat()?;
        let feeds = self.idx.tx(|feeds| {
            let mut out = Vec::new();
            for feed in feeds.list()? {
                let heads = feeds.heads(&feed)?;
                let mut stats = Vec::new();
                for nonce in heads.list()? {
                    let roots = heads.roots(nonce)?;
                    stats.push(HeadStat {
                        nonce,
                        roots: roots.len()?,
                        last_full: roots.last_full()?.map(|m| m.seq),
                    });
                }
                out.push(FeedStat { feed, heads: stats });
            }
            Ok(out)
        })?;
        Ok(NodeStat { objects, feeds })
    }

    /// Every Root of a head, lowest seq first.
    pub fn roots(&self, feed: PublicKey, nonce: u64) -> Result<Vec<RootMeta>> {
        Ok(self.idx.tx(|feeds| {
            let mut out = Vec::new();
            feeds.heads(&feed)?.roots(nonce)?.ascend(|meta| {
                out.push(meta.clone());
                Ok(ControlFlow::Continue(()))
            })?;
            Ok(out)
        })?)
    }

    /// Stop listening, close every connection and head, then the stores.
    /// Calling it again does nothing.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Ok(mut listeners) = self.listeners.lock() {
            for task in listeners.drain(..) {
                task.abort();
            }
        }
        if let Err(e) = self.registry.shutdown().await {
            debug!(error = %e, "registry already stopped");
        }
        self.cxds.close()?;
        self.idx.close()?;
        info!(id = %self.id(), "node closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(NodeError::Closed);
        }
        Ok(())
    }
}
