//! Reference counting of Root graphs.
//!
//! A stored Root holds one reference to its blob and one to each hash its
//! payload names. An object with a positive count holds one reference to
//! each of its children. Filling a Root therefore means taking those
//! references edge by edge: a present object just gains a count, an absent
//! one becomes *wanted* until it arrives.
//!
//! Edges to wanted hashes are counted in the want map instead of the store,
//! so abandoning a fill releases exactly what was taken.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use cxo_core::{Hash, Root, Walker};
use cxo_store::{ContentStore, RootMeta, StoreError};
use tracing::{debug, warn};

use crate::error::Result;

/// Want/got bookkeeping for one Root graph.
pub(crate) struct Filler {
    cxds: Arc<dyn ContentStore>,
    walker: Arc<dyn Walker>,
    /// Absent hash -> edges waiting on it.
    want: HashMap<Hash, u32>,
    /// Wanted hashes not currently requested.
    queue: VecDeque<Hash>,
}

impl Filler {
    pub fn new(cxds: Arc<dyn ContentStore>, walker: Arc<dyn Walker>) -> Self {
        Self {
            cxds,
            walker,
            want: HashMap::new(),
            queue: VecDeque::new(),
        }
    }

    /// Take the edges from `root`'s payload. The blob is not touched.
    pub fn pin_root(&mut self, root: &Root) -> Result<()> {
        for hash in self.walker.root_refs(&root.payload)? {
            self.pin(hash, 1)?;
        }
        Ok(())
    }

    /// Take `n` edges to `hash`, descending into objects that become live.
    fn pin(&mut self, hash: Hash, n: u32) -> Result<()> {
        let mut stack = vec![(hash, n)];
        while let Some((hash, n)) = stack.pop() {
            if let Err(e) = self.pin_one(hash, n, &mut stack) {
                // Untaken edges count as wanted so that a release skips them.
                for (hash, n) in stack {
                    *self.want.entry(hash).or_insert(0) += n;
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn pin_one(&mut self, hash: Hash, n: u32, stack: &mut Vec<(Hash, u32)>) -> Result<()> {
        if let Some(edges) = self.want.get_mut(&hash) {
            *edges += n;
            return Ok(());
        }
        match self.cxds.get(&hash, n as i64) {
            Ok((value, rc)) => {
                if rc == n {
                    let refs = self.walker.object_refs(&value)?;
                    stack.extend(refs.into_iter().map(|child| (child, 1)));
                }
                Ok(())
            }
            Err(StoreError::NotFound(_)) => {
                self.want.insert(hash, n);
                self.queue.push_back(hash);
                Ok(())
            }
            Err(e) => {
                // not taken
                *self.want.entry(hash).or_insert(0) += n;
                Err(e.into())
            }
        }
    }

    /// Store an arrived object with the edges waiting on it. Returns false
    /// if the hash was not wanted.
    pub fn got(&mut self, hash: Hash, value: &[u8]) -> Result<bool> {
        let Some(&n) = self.want.get(&hash) else {
            return Ok(false);
        };
        let refs = self.walker.object_refs(value)?;
        let rc = self.cxds.set(&hash, value, n)?;
        self.want.remove(&hash);
        if rc == n {
            for child in refs {
                self.pin(child, 1)?;
            }
        }
        Ok(true)
    }

    /// Next wanted hash to request.
    pub fn next_wanted(&mut self) -> Option<Hash> {
        self.queue.pop_front()
    }

    /// Put a hash back for a later request.
    pub fn requeue(&mut self, hash: Hash) {
        if self.want.contains_key(&hash) {
            self.queue.push_back(hash);
        }
    }

    /// Put a hash back at the front of the queue.
    pub fn unpop(&mut self, hash: Hash) {
        if self.want.contains_key(&hash) {
            self.queue.push_front(hash);
        }
    }

    pub fn is_done(&self) -> bool {
        self.want.is_empty()
    }

    /// Number of distinct hashes still wanted.
    pub fn wanted(&self) -> usize {
        self.want.len()
    }

    /// Satisfy the queue from `provided`; what cannot be found stays queued.
    pub fn take_provided(&mut self, provided: &HashMap<Hash, Bytes>) -> Result<()> {
        let mut missing = VecDeque::new();
        while let Some(hash) = self.queue.pop_front() {
            match provided.get(&hash) {
                Some(value) => {
                    self.got(hash, value)?;
                }
                None => missing.push_back(hash),
            }
        }
        self.queue = missing;
        Ok(())
    }

    /// Some hash still wanted, if any.
    pub fn first_missing(&self) -> Option<Hash> {
        self.queue
            .front()
            .copied()
            .or_else(|| self.want.keys().next().copied())
    }

    /// Release the edges taken for `root`'s graph. The blob is not touched.
    pub fn abandon(self, root: &Root) -> Result<()> {
        let mut skip = self.want;
        release_graph(&*self.cxds, &*self.walker, root, &mut skip)
    }
}

/// Release everything a stored Root holds: its graph and its blob.
pub(crate) fn release_root(cxds: &dyn ContentStore, walker: &dyn Walker, root: &Root) -> Result<()> {
    release_graph(cxds, walker, root, &mut HashMap::new())?;
    release_blob(cxds, &root.hash)
}

pub(crate) fn release_blob(cxds: &dyn ContentStore, hash: &Hash) -> Result<()> {
    match cxds.dec(hash) {
        Ok(_) => Ok(()),
        Err(StoreError::NotFound(_)) | Err(StoreError::RefcountUnderflow(_)) => {
            warn!(%hash, "root blob already released");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn release_graph(
    cxds: &dyn ContentStore,
    walker: &dyn Walker,
    root: &Root,
    skip: &mut HashMap<Hash, u32>,
) -> Result<()> {
    let mut stack = match walker.root_refs(&root.payload) {
        Ok(refs) => refs,
        Err(e) => {
            warn!(seq = root.seq, error = %e, "undecodable root payload, nothing to release");
            return Ok(());
        }
    };

    while let Some(hash) = stack.pop() {
        if let Some(edges) = skip.get_mut(&hash) {
            if *edges > 0 {
                *edges -= 1;
                continue;
            }
        }
        match cxds.dec(&hash) {
            // Dead now: its edges go too.
            Ok((value, 0)) => match walker.object_refs(&value) {
                Ok(refs) => stack.extend(refs),
                Err(e) => warn!(%hash, error = %e, "undecodable object, children kept"),
            },
            Ok(_) => {}
            Err(StoreError::NotFound(_)) | Err(StoreError::RefcountUnderflow(_)) => {
                debug!(%hash, "released object already gone");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Load the Root a descriptor points at.
///
/// # Panics
///
/// If the blob is gone. Descriptors pin their blob, so this is a corrupted
/// store.
pub(crate) fn load_root(cxds: &dyn ContentStore, meta: &RootMeta) -> Result<Root> {
    let bytes = match cxds.get(&meta.hash, 0) {
        Ok((bytes, _)) => bytes,
        Err(StoreError::NotFound(hash)) => {
            panic!("root seq {} points at missing blob {}", meta.seq, hash)
        }
        Err(e) => return Err(e.into()),
    };
    Ok(Root::decode(&bytes, meta.sig)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ops::ControlFlow;

    use cxo_core::{encode_object, encode_root_payload, CborSchema, DagObject, Keypair, RootBuilder};
    use cxo_store::{MemoryCxds, ObjectStat, Sweep};

    /// Sweeps after every `dec`, so a dead entry is gone before the caller
    /// could read it again.
    struct EagerSweep(MemoryCxds);

    impl ContentStore for EagerSweep {
        fn get(&self, key: &Hash, delta: i64) -> cxo_store::Result<(Bytes, u32)> {
            self.0.get(key, delta)
        }

        fn set(&self, key: &Hash, value: &[u8], delta: u32) -> cxo_store::Result<u32> {
            self.0.set(key, value, delta)
        }

        fn inc(&self, key: &Hash, delta: i64) -> cxo_store::Result<u32> {
            self.0.inc(key, delta)
        }

        fn dec(&self, key: &Hash) -> cxo_store::Result<(Bytes, u32)> {
            let out = self.0.dec(key)?;
            self.0.sweep()?;
            Ok(out)
        }

        fn del(&self, key: &Hash) -> cxo_store::Result<()> {
            self.0.del(key)
        }

        fn iterate(
            &self,
            f: &mut dyn FnMut(&Hash, u32, &[u8]) -> cxo_store::Result<ControlFlow<()>>,
        ) -> cxo_store::Result<()> {
            self.0.iterate(f)
        }

        fn iterate_del(
            &self,
            f: &mut dyn FnMut(&Hash, u32, &[u8]) -> cxo_store::Result<Sweep>,
        ) -> cxo_store::Result<()> {
            self.0.iterate_del(f)
        }

        fn multi_inc(&self, keys: &[Hash]) -> cxo_store::Result<()> {
            self.0.multi_inc(keys)
        }

        fn multi_dec(&self, keys: &[Hash]) -> cxo_store::Result<()> {
            self.0.multi_dec(keys)
        }

        fn stat(&self) -> cxo_store::Result<ObjectStat> {
            self.0.stat()
        }

        fn close(&self) -> cxo_store::Result<()> {
            self.0.close()
        }
    }

    struct Graph {
        cxds: Arc<dyn ContentStore>,
        walker: Arc<dyn Walker>,
    }

    impl Graph {
        fn new() -> Self {
            Self {
                cxds: Arc::new(MemoryCxds::new()),
                walker: Arc::new(CborSchema),
            }
        }

        fn filler(&self) -> Filler {
            Filler::new(self.cxds.clone(), self.walker.clone())
        }

        fn rc(&self, hash: &Hash) -> Option<u32> {
            match self.cxds.get(hash, 0) {
                Ok((_, rc)) => Some(rc),
                Err(StoreError::NotFound(_)) => None,
                Err(e) => panic!("{e}"),
            }
        }
    }

    fn obj(refs: Vec<Hash>, data: &str) -> (Hash, Bytes) {
        let value = Bytes::from(encode_object(&DagObject::node(refs, data.to_string())));
        (Hash::sum(&value), value)
    }

    fn root_over(refs: &[Hash]) -> Root {
        let kp = Keypair::from_seed(&[9; 32]);
        RootBuilder::new(kp.public_key())
            .payload(encode_root_payload(refs))
            .sign(&kp)
    }

    fn fill(filler: &mut Filler, objects: &HashMap<Hash, Bytes>) {
        while let Some(hash) = filler.next_wanted() {
            assert!(filler.got(hash, &objects[&hash]).unwrap());
        }
        assert!(filler.is_done());
    }

    #[test]
    fn test_fill_counts_shared_children_once_per_edge() {
        let g = Graph::new();
        let (leaf, leaf_v) = obj(vec![], "leaf");
        let (a, a_v) = obj(vec![leaf], "a");
        let (b, b_v) = obj(vec![leaf], "b");
        let objects: HashMap<_, _> = [(leaf, leaf_v), (a, a_v), (b, b_v)].into_iter().collect();

        let root = root_over(&[a, b, a]);
        let mut filler = g.filler();
        filler.pin_root(&root).unwrap();
        assert_eq!(filler.wanted(), 2);
        fill(&mut filler, &objects);

        assert_eq!(g.rc(&a), Some(2));
        assert_eq!(g.rc(&b), Some(1));
        assert_eq!(g.rc(&leaf), Some(2));
    }

    #[test]
    fn test_present_objects_are_not_wanted() {
        let g = Graph::new();
        let (leaf, leaf_v) = obj(vec![], "leaf");
        let (a, a_v) = obj(vec![leaf], "a");
        g.cxds.set(&a, &a_v, 1).unwrap();
        g.cxds.set(&leaf, &leaf_v, 1).unwrap();

        let mut filler = g.filler();
        filler.pin_root(&root_over(&[a])).unwrap();
        assert!(filler.is_done());
        // `a` was live already, so its subtree is not touched again
        assert_eq!(g.rc(&a), Some(2));
        assert_eq!(g.rc(&leaf), Some(1));
    }

    #[test]
    fn test_dead_object_is_revived_with_children() {
        let g = Graph::new();
        let (leaf, leaf_v) = obj(vec![], "leaf");
        let (a, a_v) = obj(vec![leaf], "a");
        g.cxds.set(&a, &a_v, 1).unwrap();
        g.cxds.inc(&a, -1).unwrap();

        let mut filler = g.filler();
        filler.pin_root(&root_over(&[a])).unwrap();
        assert_eq!(g.rc(&a), Some(1));
        assert_eq!(filler.next_wanted(), Some(leaf));
        assert!(filler.got(leaf, &leaf_v).unwrap());
        assert!(filler.is_done());
        assert_eq!(g.rc(&leaf), Some(1));
    }

    #[test]
    fn test_unwanted_object_is_ignored() {
        let g = Graph::new();
        let (a, a_v) = obj(vec![], "a");
        let mut filler = g.filler();
        assert!(!filler.got(a, &a_v).unwrap());
        assert_eq!(g.rc(&a), None);
    }

    #[test]
    fn test_abandon_releases_exactly_what_was_taken() {
        let g = Graph::new();
        let (leaf, leaf_v) = obj(vec![], "leaf");
        let (a, a_v) = obj(vec![leaf], "a");
        let (b, _) = obj(vec![leaf], "b");
        let (kept, kept_v) = obj(vec![], "kept");
        g.cxds.set(&kept, &kept_v, 1).unwrap();

        let root = root_over(&[a, b, kept]);
        let mut filler = g.filler();
        filler.pin_root(&root).unwrap();
        assert_eq!(g.rc(&kept), Some(2));

        // `a` and its child arrive, `b` never does
        assert_eq!(filler.next_wanted(), Some(a));
        filler.got(a, &a_v).unwrap();
        assert_eq!(filler.next_wanted(), Some(b));
        assert_eq!(filler.next_wanted(), Some(leaf));
        filler.got(leaf, &leaf_v).unwrap();
        assert_eq!(g.rc(&leaf), Some(1));

        filler.abandon(&root).unwrap();
        assert_eq!(g.rc(&a), Some(0));
        assert_eq!(g.rc(&leaf), Some(0));
        assert_eq!(g.rc(&b), None);
        assert_eq!(g.rc(&kept), Some(1));
    }

    #[test]
    fn test_release_root_cascades() {
        let g = Graph::new();
        let (leaf, leaf_v) = obj(vec![], "leaf");
        let (a, a_v) = obj(vec![leaf], "a");
        let (b, b_v) = obj(vec![], "b");
        let objects: HashMap<_, _> = [(leaf, leaf_v), (a, a_v), (b, b_v)].into_iter().collect();

        let r0 = root_over(&[a]);
        let r1 = root_over(&[a, b]);
        for root in [&r0, &r1] {
            g.cxds.set(&root.hash, &root.encode(), 1).unwrap();
            let mut filler = g.filler();
            filler.pin_root(root).unwrap();
            fill(&mut filler, &objects);
        }
        assert_eq!(g.rc(&a), Some(2));

        release_root(&*g.cxds, &*g.walker, &r0).unwrap();
        assert_eq!(g.rc(&r0.hash), Some(0));
        assert_eq!(g.rc(&a), Some(1));
        assert_eq!(g.rc(&leaf), Some(1));

        release_root(&*g.cxds, &*g.walker, &r1).unwrap();
        assert_eq!(g.rc(&a), Some(0));
        assert_eq!(g.rc(&leaf), Some(0));
        assert_eq!(g.rc(&b), Some(0));
        assert_eq!(g.cxds.sweep().unwrap(), 5);
    }

    #[test]
    fn test_release_survives_sweep_between_steps() {
        let g = Graph {
            cxds: Arc::new(EagerSweep(MemoryCxds::new())),
            walker: Arc::new(CborSchema),
        };
        let (leaf, leaf_v) = obj(vec![], "leaf");
        let (mid, mid_v) = obj(vec![leaf], "mid");
        let (top, top_v) = obj(vec![mid], "top");
        let objects: HashMap<_, _> = [(leaf, leaf_v), (mid, mid_v), (top, top_v)].into_iter().collect();

        let root = root_over(&[top]);
        g.cxds.set(&root.hash, &root.encode(), 1).unwrap();
        let mut filler = g.filler();
        filler.pin_root(&root).unwrap();
        fill(&mut filler, &objects);
        assert_eq!(g.rc(&leaf), Some(1));

        // Each dead entry is swept before its children are visited.
        release_root(&*g.cxds, &*g.walker, &root).unwrap();
        assert_eq!(g.rc(&top), None);
        assert_eq!(g.rc(&mid), None);
        assert_eq!(g.rc(&leaf), None);
        assert_eq!(g.rc(&root.hash), None);
        assert_eq!(g.cxds.stat().unwrap().amount, 0);
    }

    #[test]
    fn test_take_provided_reports_missing() {
        let g = Graph::new();
        let (a, a_v) = obj(vec![], "a");
        let (b, _) = obj(vec![], "b");
        let provided: HashMap<_, _> = [(a, a_v)].into_iter().collect();

        let root = root_over(&[a, b]);
        let mut filler = g.filler();
        filler.pin_root(&root).unwrap();
        filler.take_provided(&provided).unwrap();
        assert!(!filler.is_done());
        assert_eq!(filler.first_missing(), Some(b));
        assert_eq!(g.rc(&a), Some(1));

        filler.abandon(&root).unwrap();
        assert_eq!(g.rc(&a), Some(0));
    }

    #[test]
    fn test_load_root() {
        let g = Graph::new();
        let root = root_over(&[]);
        g.cxds.set(&root.hash, &root.encode(), 1).unwrap();
        let loaded = load_root(&*g.cxds, &RootMeta::new(&root)).unwrap();
        assert_eq!(loaded, root);
    }

    #[test]
    #[should_panic(expected = "missing blob")]
    fn test_load_root_missing_blob_panics() {
        let g = Graph::new();
        let root = root_over(&[]);
        let _ = load_root(&*g.cxds, &RootMeta::new(&root));
    }
}
