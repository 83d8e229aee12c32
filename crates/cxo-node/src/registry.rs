//! Registry actor: shared feeds, live connections, subscriptions and the
//! head actors.
//!
//! Connections report to the registry; the registry routes Roots to the
//! right head, spawning heads on demand.

use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;

use cxo_core::{PublicKey, Root};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, debug_span, warn, Instrument};

use crate::connection::{ConnId, Connection};
use crate::error::{NodeError, Result};
use crate::filler;
use crate::head::{self, HeadCmd, HeadContext, HeadHandle};
use crate::messages::Msg;

pub(crate) enum RegistryCmd {
    AddFeed {
        feed: PublicKey,
        reply: oneshot::Sender<Result<bool>>,
    },
    DelFeed {
        feed: PublicKey,
        reply: oneshot::Sender<Result<()>>,
    },
    ListFeeds {
        reply: oneshot::Sender<Vec<PublicKey>>,
    },
    AddConn {
        conn: Connection,
        reply: oneshot::Sender<()>,
    },
    ConnClosed {
        id: ConnId,
    },
    ListConns {
        reply: oneshot::Sender<Vec<Connection>>,
    },
    Subscribe {
        conn: ConnId,
        feed: PublicKey,
        origin: SubscribeOrigin,
    },
    Unsubscribe {
        conn: ConnId,
        feed: PublicKey,
        local: bool,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    ReceivedRoot {
        conn: ConnId,
        root: Root,
    },
    Head {
        feed: PublicKey,
        nonce: u64,
        reply: oneshot::Sender<Result<mpsc::Sender<HeadCmd>>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

pub(crate) enum SubscribeOrigin {
    /// We subscribe; the receiver yields the peer's answer.
    Local(oneshot::Sender<Result<oneshot::Receiver<Result<Msg>>>>),
    /// The peer subscribed with request `id`.
    Remote(u64),
}

/// Handle to the registry actor.
#[derive(Clone)]
pub(crate) struct RegistryHandle {
    tx: mpsc::Sender<RegistryCmd>,
}

impl RegistryHandle {
    async fn send(&self, cmd: RegistryCmd) -> Result<()> {
        self.tx.send(cmd).await.map_err(|_| NodeError::Closed)
    }

    async fn call<T>(&self, cmd: impl FnOnce(oneshot::Sender<T>) -> RegistryCmd) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(cmd(reply)).await?;
        rx.await.map_err(|_| NodeError::Closed)
    }

    /// Share a feed. Returns false if it was shared already.
    pub async fn add_feed(&self, feed: PublicKey) -> Result<bool> {
        self.call(|reply| RegistryCmd::AddFeed { feed, reply }).await?
    }

    pub async fn del_feed(&self, feed: PublicKey) -> Result<()> {
        self.call(|reply| RegistryCmd::DelFeed { feed, reply }).await?
    }

    pub async fn list_feeds(&self) -> Result<Vec<PublicKey>> {
        self.call(|reply| RegistryCmd::ListFeeds { reply }).await
    }

    pub async fn add_conn(&self, conn: Connection) -> Result<()> {
        self.call(|reply| RegistryCmd::AddConn { conn, reply }).await
    }

    pub async fn conn_closed(&self, id: ConnId) -> Result<()> {
        self.send(RegistryCmd::ConnClosed { id }).await
    }

    pub async fn list_conns(&self) -> Result<Vec<Connection>> {
        self.call(|reply| RegistryCmd::ListConns { reply }).await
    }

    /// Subscribe a connection to a feed on our initiative and wait for the
    /// peer to accept. The feed is shared either way; a refused or
    /// unanswered subscription is dropped again.
    pub async fn subscribe(&self, conn: ConnId, feed: PublicKey) -> Result<()> {
        let answer = self
            .call(|reply| RegistryCmd::Subscribe {
                conn,
                feed,
                origin: SubscribeOrigin::Local(reply),
            })
            .await??;
        let err = match answer.await.map_err(|_| NodeError::ConnectionClosed) {
            Ok(Ok(Msg::AcceptSubscription { .. })) => return Ok(()),
            Ok(Ok(Msg::RejectSubscription { feed })) => NodeError::SubscriptionRejected(feed),
            Ok(Ok(other)) => NodeError::InvalidResponse(other.name().into()),
            Ok(Err(e)) | Err(e) => e,
        };
        debug!(%feed, conn, error = %err, "subscription failed");
        self.send(RegistryCmd::Unsubscribe {
            conn,
            feed,
            local: false,
            reply: None,
        })
        .await?;
        Err(err)
    }

    pub async fn unsubscribe(&self, conn: ConnId, feed: PublicKey) -> Result<()> {
        self.call(|reply| RegistryCmd::Unsubscribe {
            conn,
            feed,
            local: true,
            reply: Some(reply),
        })
        .await?
    }

    /// The peer subscribed to a feed with request `id`.
    pub async fn remote_subscribe(&self, conn: ConnId, feed: PublicKey, id: u64) -> Result<()> {
        self.send(RegistryCmd::Subscribe {
            conn,
            feed,
            origin: SubscribeOrigin::Remote(id),
        })
        .await
    }

    pub async fn remote_unsubscribe(&self, conn: ConnId, feed: PublicKey) -> Result<()> {
        self.send(RegistryCmd::Unsubscribe {
            conn,
            feed,
            local: false,
            reply: None,
        })
        .await
    }

    pub async fn received_root(&self, conn: ConnId, root: Root) -> Result<()> {
        self.send(RegistryCmd::ReceivedRoot { conn, root }).await
    }

    /// Mailbox of head `(feed, nonce)`, started if needed. The feed must be
    /// shared.
    pub async fn head(&self, feed: PublicKey, nonce: u64) -> Result<mpsc::Sender<HeadCmd>> {
        self.call(|reply| RegistryCmd::Head { feed, nonce, reply }).await?
    }

    /// Stop every head and close every connection.
    pub async fn shutdown(&self) -> Result<()> {
        self.call(|reply| RegistryCmd::Shutdown { reply }).await
    }
}

#[derive(Default)]
struct FeedEntry {
    /// Connections subscribed to the feed.
    conns: HashSet<ConnId>,
    heads: HashMap<u64, HeadHandle>,
}

struct Registry {
    rx: mpsc::Receiver<RegistryCmd>,
    ctx: HeadContext,
    feeds: HashMap<PublicKey, FeedEntry>,
    conns: HashMap<ConnId, Connection>,
}

/// Start the registry, with a head for every head in the index.
pub(crate) fn spawn(ctx: HeadContext) -> Result<RegistryHandle> {
    let stored = ctx.idx.tx(|feeds| {
        let mut out = Vec::new();
        for feed in feeds.list()? {
            let nonces = feeds.heads(&feed)?.list()?;
            out.push((feed, nonces));
        }
        Ok(out)
    })?;

    let (tx, rx) = mpsc::channel(ctx.config.mailbox_size);
    let mut registry = Registry {
        rx,
        ctx,
        feeds: HashMap::new(),
        conns: HashMap::new(),
    };
    for (feed, nonces) in stored {
        let entry = registry.feeds.entry(feed).or_default();
        for nonce in nonces {
            let head = head::spawn(feed, nonce, registry.ctx.clone(), Vec::new());
            entry.heads.insert(nonce, head);
        }
    }
    debug!(feeds = registry.feeds.len(), "registry started");

    tokio::spawn(registry.run().instrument(debug_span!("registry")));
    Ok(RegistryHandle { tx })
}

impl Registry {
    async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            if self.handle(cmd).await.is_break() {
                return;
            }
        }
        self.shutdown().await;
    }

    async fn handle(&mut self, cmd: RegistryCmd) -> ControlFlow<()> {
        match cmd {
            RegistryCmd::AddFeed { feed, reply } => {
                let _ = reply.send(self.add_feed(feed));
            }
            RegistryCmd::DelFeed { feed, reply } => {
                let _ = reply.send(self.del_feed(feed).await);
            }
            RegistryCmd::ListFeeds { reply } => {
                let mut feeds: Vec<PublicKey> = self.feeds.keys().copied().collect();
                feeds.sort();
                let _ = reply.send(feeds);
            }
            RegistryCmd::AddConn { conn, reply } => {
                self.ctx.hooks.on_connect(&conn);
                self.conns.insert(conn.id(), conn);
                let _ = reply.send(());
            }
            RegistryCmd::ConnClosed { id } => self.conn_closed(id).await,
            RegistryCmd::ListConns { reply } => {
                let mut conns: Vec<Connection> = self.conns.values().cloned().collect();
                conns.sort_by_key(|c| c.id());
                let _ = reply.send(conns);
            }
            RegistryCmd::Subscribe { conn, feed, origin } => match origin {
                SubscribeOrigin::Local(reply) => {
                    let _ = reply.send(self.subscribe(conn, feed).await);
                }
                SubscribeOrigin::Remote(id) => self.remote_subscribe(conn, feed, id).await,
            },
            RegistryCmd::Unsubscribe {
                conn,
                feed,
                local,
                reply,
            } => {
                let res = self.unsubscribe(conn, feed, local).await;
                respond(reply, res);
            }
            RegistryCmd::ReceivedRoot { conn, root } => self.received_root(conn, root).await,
            RegistryCmd::Head { feed, nonce, reply } => {
                let _ = reply.send(self.head(feed, nonce).map(HeadHandle::sender));
            }
            RegistryCmd::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn add_feed(&mut self, feed: PublicKey) -> Result<bool> {
        if self.feeds.contains_key(&feed) {
            return Ok(false);
        }
        self.ctx.idx.tx(|feeds| feeds.add(&feed))?;
        self.feeds.insert(feed, FeedEntry::default());
        debug!(%feed, "feed shared");
        Ok(true)
    }

    /// Stop sharing a feed and release everything its Roots hold.
    async fn del_feed(&mut self, feed: PublicKey) -> Result<()> {
        if let Some(entry) = self.feeds.remove(&feed) {
            for (_, head) in entry.heads {
                head.close().await;
            }
            for id in entry.conns {
                if let Some(conn) = self.conns.get(&id) {
                    let _ = conn.send(Msg::Unsubscribe { feed });
                }
            }
        }

        let roots = self.ctx.idx.tx(|feeds| {
            if !feeds.has(&feed)? {
                return Ok(Vec::new());
            }
            let heads = feeds.heads(&feed)?;
            let mut all = Vec::new();
            for nonce in heads.list()? {
                heads.roots(nonce)?.ascend(|meta| {
                    all.push(meta.clone());
                    Ok(ControlFlow::Continue(()))
                })?;
                heads.del(nonce)?;
            }
            feeds.del(&feed)?;
            Ok(all)
        })?;

        // Closed heads dropped their partial fills; what is left is full.
        for meta in roots.iter().filter(|m| m.is_full) {
            let root = filler::load_root(&*self.ctx.cxds, meta)?;
            filler::release_root(&*self.ctx.cxds, &*self.ctx.walker, &root)?;
        }
        debug!(%feed, roots = roots.len(), "feed deleted");
        Ok(())
    }

    async fn conn_closed(&mut self, id: ConnId) {
        let Some(conn) = self.conns.remove(&id) else {
            return;
        };
        for entry in self.feeds.values_mut() {
            if !entry.conns.remove(&id) {
                continue;
            }
            for head in entry.heads.values() {
                if head.send(HeadCmd::DelConn(id)).await.is_err() {
                    warn!(conn = id, "head is gone");
                }
            }
        }
        self.ctx.hooks.on_disconnect(&conn);
    }

    /// Share `feed`, ask the peer of `id` for it and treat the peer as
    /// subscribed until it refuses. The request is queued before any Root
    /// of the feed can be announced on the connection.
    async fn subscribe(&mut self, id: ConnId, feed: PublicKey) -> Result<oneshot::Receiver<Result<Msg>>> {
        let conn = self.conns.get(&id).cloned().ok_or(NodeError::ConnectionClosed)?;
        self.add_feed(feed)?;
        let answer = conn.start_request(Msg::Subscribe { feed })?;
        self.add_subscriber(conn, feed).await?;
        Ok(answer)
    }

    async fn remote_subscribe(&mut self, id: ConnId, feed: PublicKey, request: u64) {
        let Some(conn) = self.conns.get(&id).cloned() else {
            return;
        };
        if !self.feeds.contains_key(&feed) {
            debug!(%feed, conn = id, "subscription to a feed not shared");
            if let Err(e) = conn.reply(request, Msg::RejectSubscription { feed }) {
                debug!(conn = id, error = %e, "rejection not sent");
            }
            return;
        }
        // Accepted before the heads can announce anything.
        if let Err(e) = conn.reply(request, Msg::AcceptSubscription { feed }) {
            debug!(conn = id, error = %e, "acceptance not sent");
            return;
        }
        if let Err(e) = self.add_subscriber(conn, feed).await {
            warn!(%feed, conn = id, error = %e, "remote subscription failed");
        }
    }

    async fn add_subscriber(&mut self, conn: Connection, feed: PublicKey) -> Result<()> {
        let id = conn.id();
        let entry = self.feeds.get_mut(&feed).ok_or(NodeError::NoSuchFeed(feed))?;
        if entry.conns.insert(id) {
            debug!(%feed, conn = id, "subscribed");
            for head in entry.heads.values() {
                head.send(HeadCmd::AddConn(conn.clone())).await?;
            }
        }
        Ok(())
    }

    async fn unsubscribe(&mut self, id: ConnId, feed: PublicKey, local: bool) -> Result<()> {
        if local {
            if let Some(conn) = self.conns.get(&id) {
                conn.send(Msg::Unsubscribe { feed })?;
            }
        }
        let Some(entry) = self.feeds.get_mut(&feed) else {
            return Ok(());
        };
        if entry.conns.remove(&id) {
            debug!(%feed, conn = id, local, "unsubscribed");
            for head in entry.heads.values() {
                head.send(HeadCmd::DelConn(id)).await?;
            }
        }
        Ok(())
    }

    async fn received_root(&mut self, id: ConnId, root: Root) {
        let Some(conn) = self.conns.get(&id).cloned() else {
            return;
        };
        let subscribed = self
            .feeds
            .get(&root.feed)
            .is_some_and(|entry| entry.conns.contains(&id));
        if !subscribed {
            debug!(feed = %root.feed, conn = id, "root of a feed the connection is not subscribed to");
            return;
        }

        let (feed, nonce) = (root.feed, root.nonce);
        let sent = match self.head(feed, nonce) {
            Ok(head) => head.send(HeadCmd::Root { conn, root }).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            warn!(%feed, nonce, error = %e, "root not delivered to its head");
            if let Some(entry) = self.feeds.get_mut(&feed) {
                entry.heads.remove(&nonce);
            }
        }
    }

    /// The head `(feed, nonce)`, started with the feed's subscribers if new.
    fn head(&mut self, feed: PublicKey, nonce: u64) -> Result<&HeadHandle> {
        let entry = self.feeds.get_mut(&feed).ok_or(NodeError::NoSuchFeed(feed))?;
        if !entry.heads.contains_key(&nonce) {
            let conns: Vec<Connection> = entry
                .conns
                .iter()
                .filter_map(|id| self.conns.get(id).cloned())
                .collect();
            debug!(%feed, nonce, "head started");
            let head = head::spawn(feed, nonce, self.ctx.clone(), conns);
            entry.heads.insert(nonce, head);
        }
        entry.heads.get(&nonce).ok_or(NodeError::Closed)
    }

    async fn shutdown(&mut self) {
        for (_, entry) in self.feeds.drain() {
            for (_, head) in entry.heads {
                head.close().await;
            }
        }
        for (_, conn) in self.conns.drain() {
            conn.close();
        }
        debug!("registry stopped");
    }
}

fn respond(reply: Option<oneshot::Sender<Result<()>>>, res: Result<()>) {
    match reply {
        Some(reply) => {
            let _ = reply.send(res);
        }
        None => {
            if let Err(e) = res {
                debug!(error = %e, "remote request ignored");
            }
        }
    }
}
