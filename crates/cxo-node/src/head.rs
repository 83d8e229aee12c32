//! Per-head replication.
//!
//! One actor per `(feed, nonce)`. It tracks which connections advertised
//! which seqs, fills at most one Root at a time, publishes local Roots and
//! applies retention. All index and store writes for the head go through
//! it, so a head never races with itself.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::ops::ControlFlow;
use std::sync::Arc;

use bytes::Bytes;
use cxo_core::{Hash, Keypair, PublicKey, Root, RootBuilder, Walker};
use cxo_store::{ContentStore, IdxDb, RootMeta, StoreError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, debug_span, error, info, trace, warn, Instrument};

use crate::config::NodeConfig;
use crate::connection::{ConnId, Connection};
use crate::error::{NodeError, Result};
use crate::filler::{self, Filler};
use crate::hooks::Hooks;
use crate::messages::Msg;

/// Everything a head shares with the rest of the node.
#[derive(Clone)]
pub(crate) struct HeadContext {
    pub cxds: Arc<dyn ContentStore>,
    pub idx: Arc<IdxDb>,
    pub walker: Arc<dyn Walker>,
    pub hooks: Arc<dyn Hooks>,
    pub config: Arc<NodeConfig>,
}

/// Snapshot of a head's replication state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeadStatus {
    /// Seq of the newest Root held in full.
    pub last_full: Option<u64>,
    /// Seq of the Root being filled.
    pub filling: Option<u64>,
    /// Distinct objects the fill still waits for.
    pub wanted: usize,
    /// Object requests in flight.
    pub in_flight: usize,
    /// Connections the fill may request objects from.
    pub holders: usize,
    /// Subscribed connections.
    pub conns: usize,
}

pub(crate) enum HeadCmd {
    Root {
        conn: Connection,
        root: Root,
    },
    AddConn(Connection),
    DelConn(ConnId),
    Publish {
        keypair: Keypair,
        payload: Bytes,
        objects: Vec<Bytes>,
        reply: oneshot::Sender<Result<Root>>,
    },
    DelRootsBefore {
        seq: u64,
        reply: oneshot::Sender<Result<usize>>,
    },
    Status {
        reply: oneshot::Sender<HeadStatus>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

pub(crate) struct HeadHandle {
    tx: mpsc::Sender<HeadCmd>,
    task: JoinHandle<()>,
}

impl HeadHandle {
    pub async fn send(&self, cmd: HeadCmd) -> Result<()> {
        self.tx.send(cmd).await.map_err(|_| NodeError::Closed)
    }

    pub fn sender(&self) -> mpsc::Sender<HeadCmd> {
        self.tx.clone()
    }

    /// Stop the head, abandoning its fill, and wait for it.
    pub async fn close(self) {
        let (reply, done) = oneshot::channel();
        if self.tx.send(HeadCmd::Close { reply }).await.is_ok() {
            let _ = done.await;
        }
        let _ = self.task.await;
    }
}

/// Start the actor of head `(feed, nonce)` with `conns` subscribed.
pub(crate) fn spawn(feed: PublicKey, nonce: u64, ctx: HeadContext, conns: Vec<Connection>) -> HeadHandle {
    let (tx, rx) = mpsc::channel(ctx.config.mailbox_size);
    let (replies_tx, replies_rx) = mpsc::unbounded_channel();
    let actor = HeadReplicator {
        feed,
        nonce,
        ctx,
        rx,
        replies_tx,
        replies_rx,
        conns: conns.into_iter().map(|c| (c.id(), c)).collect(),
        known: KnownRoots::default(),
        last_full: None,
        fill: None,
        generation: 0,
    };
    let span = debug_span!("head", feed = %feed, nonce);
    let task = tokio::spawn(actor.run().instrument(span));
    HeadHandle { tx, task }
}

/// Roots each connection has advertised or been sent, by seq.
#[derive(Debug, Default)]
struct KnownRoots {
    by_conn: HashMap<ConnId, BTreeMap<u64, Hash>>,
}

impl KnownRoots {
    fn insert(&mut self, conn: ConnId, seq: u64, hash: Hash) {
        self.by_conn.entry(conn).or_default().insert(seq, hash);
    }

    fn has(&self, conn: ConnId, seq: u64, hash: &Hash) -> bool {
        self.by_conn
            .get(&conn)
            .and_then(|roots| roots.get(&seq))
            .is_some_and(|h| h == hash)
    }

    /// Connections that advertised exactly this Root.
    fn holders(&self, seq: u64, hash: &Hash) -> Vec<ConnId> {
        let mut out: Vec<ConnId> = self
            .by_conn
            .iter()
            .filter(|(_, roots)| roots.get(&seq) == Some(hash))
            .map(|(conn, _)| *conn)
            .collect();
        out.sort_unstable();
        out
    }

    fn remove_conn(&mut self, conn: ConnId) {
        self.by_conn.remove(&conn);
    }

    /// Forget seqs below `seq`.
    fn prune_below(&mut self, seq: u64) {
        for roots in self.by_conn.values_mut() {
            *roots = roots.split_off(&seq);
        }
    }
}

struct ObjectReply {
    generation: u64,
    conn: ConnId,
    hash: Hash,
    result: Result<Msg>,
}

struct InFlight {
    conn: ConnId,
    task: JoinHandle<()>,
}

/// The one Root being filled.
struct Fill {
    root: Root,
    generation: u64,
    filler: Filler,
    /// Request order; the front is asked next.
    holders: VecDeque<ConnId>,
    in_flight: HashMap<Hash, InFlight>,
    /// Holders that answered NotFound, per hash.
    misses: HashMap<Hash, HashSet<ConnId>>,
    /// Hashes every live holder missed; retried when a holder announces.
    parked: Vec<Hash>,
}

/// Where the next request for a hash goes.
enum Pick {
    Holder(Connection),
    /// Every live holder answered NotFound for the hash.
    Missed,
    /// No live holder at all.
    Nobody,
}

impl Fill {
    /// Record an announcement of the filled Root by `conn`: it becomes a
    /// candidate for every hash again and parked hashes are retried.
    /// Returns whether the holder is new.
    fn add_holder(&mut self, conn: ConnId) -> bool {
        let added = !self.holders.contains(&conn);
        if added {
            self.holders.push_back(conn);
        }
        self.misses.retain(|_, missed| {
            missed.remove(&conn);
            !missed.is_empty()
        });
        for hash in self.parked.drain(..) {
            self.filler.requeue(hash);
        }
        added
    }

    /// Rotate to the next live holder that has not missed `hash`.
    fn pick(&mut self, hash: &Hash, conns: &HashMap<ConnId, Connection>) -> Pick {
        let missed = self.misses.get(hash);
        let mut live = false;
        for _ in 0..self.holders.len() {
            let Some(id) = self.holders.pop_front() else {
                break;
            };
            let conn = conns.get(&id).filter(|c| !c.is_closed());
            if conn.is_some() {
                live = true;
            }
            self.holders.push_back(id);
            if let Some(conn) = conn.filter(|_| !missed.is_some_and(|m| m.contains(&id))) {
                return Pick::Holder(conn.clone());
            }
        }
        if live {
            Pick::Missed
        } else {
            Pick::Nobody
        }
    }

    fn missed(&mut self, hash: Hash, conn: ConnId) {
        self.misses.entry(hash).or_default().insert(conn);
    }

    fn drop_conn(&mut self, conn: ConnId) {
        self.holders.retain(|c| *c != conn);
        let lost: Vec<Hash> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.conn == conn)
            .map(|(h, _)| *h)
            .collect();
        for hash in lost {
            if let Some(f) = self.in_flight.remove(&hash) {
                f.task.abort();
            }
            self.filler.requeue(hash);
        }
    }

    fn cancel(&mut self) {
        for (_, f) in self.in_flight.drain() {
            f.task.abort();
        }
    }
}

struct HeadReplicator {
    feed: PublicKey,
    nonce: u64,
    ctx: HeadContext,
    rx: mpsc::Receiver<HeadCmd>,
    replies_tx: mpsc::UnboundedSender<ObjectReply>,
    replies_rx: mpsc::UnboundedReceiver<ObjectReply>,
    conns: HashMap<ConnId, Connection>,
    known: KnownRoots,
    last_full: Option<Root>,
    fill: Option<Fill>,
    generation: u64,
}

impl HeadReplicator {
    async fn run(mut self) {
        if let Err(e) = self.load() {
            warn!(error = %e, "failed to load head state");
        }
        if let Some(root) = self.last_full.clone() {
            self.propagate(&root);
        }

        loop {
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => {
                        if self.on_cmd(cmd).is_break() {
                            break;
                        }
                    }
                    None => {
                        self.break_fill(NodeError::Closed);
                        break;
                    }
                },
                Some(reply) = self.replies_rx.recv() => self.on_reply(reply),
            }
        }
        debug!("head stopped");
    }

    /// Drop descriptors of fills a previous run left behind and pick up the
    /// newest full Root.
    fn load(&mut self) -> Result<()> {
        let (feed, nonce) = (self.feed, self.nonce);
        let (last_full, stale) = self.ctx.idx.tx(|feeds| {
            let heads = match feeds.heads(&feed) {
                Ok(heads) => heads,
                Err(e) if e.is_not_found() => return Ok((None, 0)),
                Err(e) => return Err(e),
            };
            if !heads.has(nonce)? {
                return Ok((None, 0));
            }
            let roots = heads.roots(nonce)?;
            let mut stale = Vec::new();
            roots.ascend(|meta| {
                if !meta.is_full {
                    stale.push(meta.seq);
                }
                Ok(ControlFlow::Continue(()))
            })?;
            for seq in &stale {
                roots.del(*seq)?;
            }
            Ok((roots.last_full()?, stale.len()))
        })?;
        if stale > 0 {
            // Their pins are not released; the leak is bounded by one fill
            // per head per crash.
            warn!(count = stale, "dropped incomplete roots of a previous run");
        }
        self.last_full = last_full
            .map(|meta| filler::load_root(&*self.ctx.cxds, &meta))
            .transpose()?;
        Ok(())
    }

    fn on_cmd(&mut self, cmd: HeadCmd) -> ControlFlow<()> {
        match cmd {
            HeadCmd::Root { conn, root } => self.on_root(conn, root),
            HeadCmd::AddConn(conn) => self.add_conn(conn),
            HeadCmd::DelConn(id) => self.del_conn(id),
            HeadCmd::Publish {
                keypair,
                payload,
                objects,
                reply,
            } => {
                let _ = reply.send(self.publish(&keypair, payload, objects));
            }
            HeadCmd::DelRootsBefore { seq, reply } => {
                let _ = reply.send(self.del_roots_before(seq));
            }
            HeadCmd::Status { reply } => {
                let _ = reply.send(self.status());
            }
            HeadCmd::Close { reply } => {
                self.break_fill(NodeError::Closed);
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn status(&self) -> HeadStatus {
        HeadStatus {
            last_full: self.last_full.as_ref().map(|r| r.seq),
            filling: self.fill.as_ref().map(|f| f.root.seq),
            wanted: self.fill.as_ref().map_or(0, |f| f.filler.wanted()),
            in_flight: self.fill.as_ref().map_or(0, |f| f.in_flight.len()),
            holders: self.fill.as_ref().map_or(0, |f| f.holders.len()),
            conns: self.conns.len(),
        }
    }

    fn add_conn(&mut self, conn: Connection) {
        let id = conn.id();
        if let Some(root) = &self.last_full {
            if !self.known.has(id, root.seq, &root.hash) && conn.send(Msg::Root(root.clone())).is_ok() {
                self.known.insert(id, root.seq, root.hash);
            }
        }
        self.conns.insert(id, conn);
    }

    fn del_conn(&mut self, id: ConnId) {
        self.conns.remove(&id);
        self.known.remove_conn(id);
        if let Some(fill) = &mut self.fill {
            fill.drop_conn(id);
            if fill.holders.is_empty() {
                debug!(seq = fill.root.seq, "fill stalled, no connection holds it");
            }
        }
        self.progress();
    }

    fn on_root(&mut self, conn: Connection, root: Root) {
        if root.feed != self.feed || root.nonce != self.nonce {
            warn!(seq = root.seq, "root routed to the wrong head");
            return;
        }
        if let Err(e) = root.verify() {
            warn!(conn = conn.id(), seq = root.seq, error = %e, "invalid root, closing connection");
            conn.close();
            return;
        }
        self.ctx.hooks.on_root_received(&conn, &root);

        let conn_id = conn.id();
        self.conns.entry(conn_id).or_insert(conn);
        // Keyed by hash, so a conflicting announcement never counts as
        // holding our Root.
        self.known.insert(conn_id, root.seq, root.hash);

        if let Some(full) = &self.last_full {
            if root.seq <= full.seq {
                if root.seq == full.seq && root.hash != full.hash {
                    warn!(seq = root.seq, conn = conn_id, "conflicting root ignored");
                }
                return;
            }
        }

        if let Some(fill) = &mut self.fill {
            match root.seq.cmp(&fill.root.seq) {
                Ordering::Less => return,
                Ordering::Equal => {
                    if root.hash != fill.root.hash {
                        warn!(seq = root.seq, conn = conn_id, "conflicting root ignored");
                    } else {
                        if fill.add_holder(conn_id) {
                            trace!(seq = root.seq, conn = conn_id, "new holder");
                        }
                        self.progress();
                    }
                    return;
                }
                Ordering::Greater => {}
            }
        }

        // The current fill is only given up for a Root that fits the chain.
        if !self.admit(&root) {
            return;
        }
        if let Some(fill) = &self.fill {
            let superseded = NodeError::Superseded {
                seq: fill.root.seq,
                by: root.seq,
            };
            self.break_fill(superseded);
        }
        self.start_fill(root);
    }

    /// Record the descriptor of `root` if it fits the stored chain.
    fn admit(&self, root: &Root) -> bool {
        let (feed, nonce) = (self.feed, self.nonce);
        let mut meta = RootMeta::new(root);
        let existing = self.ctx.idx.tx(|feeds| {
            feeds.add(&feed)?;
            let roots = feeds.heads(&feed)?.add(nonce)?;
            if roots.has(root.seq)? {
                return Ok(Some(roots.get(root.seq)?));
            }
            roots.set_base(&mut meta)?;
            Ok(None)
        });
        match existing {
            Ok(None) => true,
            Ok(Some(stored)) => {
                if stored.hash != root.hash {
                    warn!(seq = root.seq, "conflicting root ignored");
                }
                false
            }
            Err(e) => {
                warn!(seq = root.seq, error = %e, "root does not fit the stored chain");
                false
            }
        }
    }

    /// Start filling an admitted `root`.
    fn start_fill(&mut self, root: Root) {
        let (feed, nonce) = (self.feed, self.nonce);
        if let Err(e) = self.ctx.cxds.set(&root.hash, &root.encode(), 1) {
            warn!(seq = root.seq, error = %e, "failed to store root");
            let _ = self.ctx.idx.tx(|feeds| feeds.heads(&feed)?.roots(nonce)?.del(root.seq));
            return;
        }

        self.generation += 1;
        let holders = self.known.holders(root.seq, &root.hash).into_iter().collect();
        let mut fill = Fill {
            root,
            generation: self.generation,
            filler: Filler::new(self.ctx.cxds.clone(), self.ctx.walker.clone()),
            holders,
            in_flight: HashMap::new(),
            misses: HashMap::new(),
            parked: Vec::new(),
        };
        let pinned = fill.filler.pin_root(&fill.root);
        debug!(seq = fill.root.seq, wanted = fill.filler.wanted(), "fill started");
        self.fill = Some(fill);

        match pinned {
            Ok(()) => self.progress(),
            Err(e) => self.break_fill(e),
        }
    }

    /// Dispatch requests, or finish the fill.
    fn progress(&mut self) {
        let Some(fill) = &mut self.fill else {
            return;
        };
        if fill.filler.is_done() {
            self.complete();
            return;
        }

        let max = self.ctx.config.max_parallel_requests;
        while fill.in_flight.len() < max {
            let Some(hash) = fill.filler.next_wanted() else {
                break;
            };
            let conn = match fill.pick(&hash, &self.conns) {
                Pick::Holder(conn) => conn,
                Pick::Missed => {
                    debug!(%hash, "no holder has the object, parked");
                    fill.parked.push(hash);
                    continue;
                }
                Pick::Nobody => {
                    fill.filler.unpop(hash);
                    break;
                }
            };

            let replies = self.replies_tx.clone();
            let generation = fill.generation;
            let conn_id = conn.id();
            let task = tokio::spawn(
                async move {
                    let result = conn.request(Msg::RequestObject { hash }).await;
                    let _ = replies.send(ObjectReply {
                        generation,
                        conn: conn_id,
                        hash,
                        result,
                    });
                }
                .in_current_span(),
            );
            trace!(%hash, conn = conn_id, "object requested");
            fill.in_flight.insert(hash, InFlight { conn: conn_id, task });
        }
    }

    fn on_reply(&mut self, reply: ObjectReply) {
        let Some(fill) = &mut self.fill else {
            return;
        };
        let current = fill.generation == reply.generation
            && fill.in_flight.get(&reply.hash).is_some_and(|f| f.conn == reply.conn);
        if !current {
            trace!(hash = %reply.hash, "stale object reply");
            return;
        }
        fill.in_flight.remove(&reply.hash);
        let hash = reply.hash;

        match reply.result {
            Ok(Msg::Object { value }) => {
                if Hash::sum(&value) != hash {
                    warn!(%hash, conn = reply.conn, "object does not match its hash, closing connection");
                    if let Some(conn) = self.conns.get(&reply.conn) {
                        conn.close();
                    }
                    fill.drop_conn(reply.conn);
                    fill.filler.requeue(hash);
                } else if let Err(e) = fill.filler.got(hash, &value) {
                    self.break_fill(e);
                    return;
                } else {
                    fill.misses.remove(&hash);
                }
            }
            Ok(Msg::NotFound { .. }) => {
                trace!(%hash, conn = reply.conn, "object not found");
                fill.missed(hash, reply.conn);
                fill.filler.requeue(hash);
            }
            Ok(other) => {
                warn!(msg = other.name(), conn = reply.conn, "unexpected answer to object request, closing connection");
                if let Some(conn) = self.conns.get(&reply.conn) {
                    conn.close();
                }
                fill.drop_conn(reply.conn);
                fill.filler.requeue(hash);
            }
            Err(e) => {
                debug!(%hash, conn = reply.conn, error = %e, "object request failed");
                fill.filler.requeue(hash);
            }
        }
        self.progress();
    }

    fn complete(&mut self) {
        let Some(mut fill) = self.fill.take() else {
            return;
        };
        fill.cancel();
        let root = fill.root;
        let (feed, nonce) = (self.feed, self.nonce);

        let marked = self.ctx.idx.tx(|feeds| {
            let roots = feeds.heads(&feed)?.roots(nonce)?;
            let mut meta = roots.get(root.seq)?;
            meta.is_full = true;
            roots.set_base(&mut meta)
        });
        if let Err(e) = marked {
            error!(seq = root.seq, error = %e, "failed to record filled root");
            if let Err(e) = filler::release_root(&*self.ctx.cxds, &*self.ctx.walker, &root) {
                warn!(seq = root.seq, error = %e, "failed to release root");
            }
            self.ctx.hooks.on_filling_breaks(&root, &NodeError::Store(e));
            return;
        }

        info!(seq = root.seq, "root filled");
        self.known.prune_below(root.seq);
        self.propagate(&root);
        self.ctx.hooks.on_root_filled(&root);
        self.last_full = Some(root);
    }

    /// Announce `root` to every connection that has not advertised it.
    fn propagate(&mut self, root: &Root) {
        for (id, conn) in &self.conns {
            if self.known.has(*id, root.seq, &root.hash) {
                continue;
            }
            match conn.send(Msg::Root(root.clone())) {
                Ok(()) => self.known.insert(*id, root.seq, root.hash),
                Err(e) => debug!(conn = *id, error = %e, "root not announced"),
            }
        }
    }

    /// Abandon the fill, releasing everything it took.
    fn break_fill(&mut self, err: NodeError) {
        let Some(mut fill) = self.fill.take() else {
            return;
        };
        fill.cancel();
        let Fill { root, filler, .. } = fill;
        debug!(seq = root.seq, error = %err, "fill abandoned");

        if let Err(e) = filler.abandon(&root) {
            warn!(seq = root.seq, error = %e, "failed to release abandoned fill");
        }
        if let Err(e) = filler::release_blob(&*self.ctx.cxds, &root.hash) {
            warn!(seq = root.seq, error = %e, "failed to release root blob");
        }

        let (feed, nonce) = (self.feed, self.nonce);
        let removed = self.ctx.idx.tx(|feeds| {
            let roots = feeds.heads(&feed)?.roots(nonce)?;
            match roots.get(root.seq) {
                Ok(meta) if !meta.is_full && meta.hash == root.hash => roots.del(root.seq),
                Ok(_) => Ok(()),
                Err(e) if e.is_not_found() => Ok(()),
                Err(e) => Err(e),
            }
        });
        if let Err(e) = removed {
            if !e.is_not_found() {
                warn!(seq = root.seq, error = %e, "failed to drop descriptor of abandoned fill");
            }
        }

        self.ctx.hooks.on_filling_breaks(&root, &err);
    }

    fn publish(&mut self, keypair: &Keypair, payload: Bytes, objects: Vec<Bytes>) -> Result<Root> {
        if keypair.public_key() != self.feed {
            return Err(NodeError::NotFeedOwner(self.feed));
        }
        let (feed, nonce) = (self.feed, self.nonce);
        let last = self.ctx.idx.tx(|feeds| {
            feeds.add(&feed)?;
            feeds.heads(&feed)?.add(nonce)?.last_full()
        })?;
        let seq = last.as_ref().map_or(0, |m| m.seq + 1);
        if let Some(fill) = &self.fill {
            let superseded = NodeError::Superseded {
                seq: fill.root.seq,
                by: seq,
            };
            self.break_fill(superseded);
        }

        let mut builder = RootBuilder::new(feed).nonce(nonce).payload(payload);
        if let Some(last) = last {
            builder = builder.seq(seq).prev(last.hash);
        }
        let root = builder.sign(keypair);

        let provided: HashMap<Hash, Bytes> = objects.into_iter().map(|v| (Hash::sum(&v), v)).collect();
        let mut filler = Filler::new(self.ctx.cxds.clone(), self.ctx.walker.clone());
        let pinned = filler
            .pin_root(&root)
            .and_then(|()| filler.take_provided(&provided));
        let missing = match pinned {
            Ok(()) => filler.first_missing(),
            Err(e) => {
                let _ = filler.abandon(&root);
                return Err(e);
            }
        };
        if let Some(hash) = missing {
            filler.abandon(&root)?;
            return Err(NodeError::MissingObject(hash));
        }

        self.ctx.cxds.set(&root.hash, &root.encode(), 1)?;
        let mut meta = RootMeta::new(&root);
        meta.is_full = true;
        let stored = self
            .ctx
            .idx
            .tx(|feeds| feeds.heads(&feed)?.roots(nonce)?.set(&mut meta));
        if let Err(e) = stored {
            if let Err(e) = filler::release_root(&*self.ctx.cxds, &*self.ctx.walker, &root) {
                warn!(seq = root.seq, error = %e, "failed to release unpublished root");
            }
            return Err(e.into());
        }

        info!(seq = root.seq, "root published");
        self.known.prune_below(root.seq);
        self.propagate(&root);
        self.last_full = Some(root.clone());
        Ok(root)
    }

    fn del_roots_before(&mut self, seq: u64) -> Result<usize> {
        if let Some(fill) = &self.fill {
            if fill.root.seq < seq {
                let pruned = NodeError::Pruned(fill.root.seq);
                self.break_fill(pruned);
            }
        }

        let (feed, nonce) = (self.feed, self.nonce);
        let removed = self.ctx.idx.tx(|feeds| {
            let heads = match feeds.heads(&feed) {
                Ok(heads) => heads,
                Err(e) if e.is_not_found() => return Ok(Vec::new()),
                Err(e) => return Err(e),
            };
            match heads.roots(nonce) {
                Ok(roots) => roots.del_before(seq),
                Err(StoreError::NoSuchHead { .. }) => Ok(Vec::new()),
                Err(e) => Err(e),
            }
        })?;

        for meta in removed.iter().filter(|m| m.is_full) {
            let root = filler::load_root(&*self.ctx.cxds, meta)?;
            filler::release_root(&*self.ctx.cxds, &*self.ctx.walker, &root)?;
        }
        if self.last_full.as_ref().is_some_and(|r| r.seq < seq) {
            self.last_full = None;
        }
        debug!(before = seq, removed = removed.len(), "roots deleted");
        Ok(removed.len())
    }
}
