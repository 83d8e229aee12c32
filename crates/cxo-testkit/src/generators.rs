//! Proptest generators for property-based testing.

use std::collections::{HashMap, HashSet};

use proptest::prelude::*;

use cxo_core::{Hash, Keypair, PublicKey};

use crate::fixtures::ObjectSet;

/// Generate a random keypair.
pub fn keypair() -> impl Strategy<Value = Keypair> {
    any::<[u8; 32]>().prop_map(|seed| Keypair::from_seed(&seed))
}

/// Generate a random Hash.
pub fn hash() -> impl Strategy<Value = Hash> {
    any::<[u8; 32]>().prop_map(Hash)
}

/// Generate a random PublicKey.
pub fn public_key() -> impl Strategy<Value = PublicKey> {
    keypair().prop_map(|kp| kp.public_key())
}

/// Generate payload bytes of specified max length.
pub fn payload(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=max_len)
}

/// Shape of an object graph: object `i` references a subset of the objects
/// before it, the Root references a non-empty subset of all of them.
#[derive(Debug, Clone)]
pub struct GraphParams {
    pub children: Vec<Vec<usize>>,
    pub root_refs: Vec<usize>,
}

impl Arbitrary for GraphParams {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        (1usize..12)
            .prop_flat_map(|n| {
                let children = (0..n)
                    .map(|i| prop::sample::subsequence((0..i).collect::<Vec<_>>(), 0..=i.min(3)))
                    .collect::<Vec<_>>();
                let root_refs = prop::sample::subsequence((0..n).collect::<Vec<_>>(), 1..=n.min(4));
                (children, root_refs)
            })
            .prop_map(|(children, root_refs)| GraphParams {
                children,
                root_refs,
            })
            .boxed()
    }
}

/// An object graph built from [`GraphParams`].
#[derive(Debug, Clone)]
pub struct Graph {
    pub objects: ObjectSet,
    /// Hash of object `i`.
    pub hashes: Vec<Hash>,
    pub root_refs: Vec<Hash>,
    params: GraphParams,
}

impl Graph {
    pub fn from_params(params: &GraphParams) -> Self {
        let mut objects = ObjectSet::new();
        let mut hashes = Vec::with_capacity(params.children.len());
        for (i, children) in params.children.iter().enumerate() {
            let refs: Vec<Hash> = children.iter().map(|&c| hashes[c]).collect();
            hashes.push(objects.node(&refs, &format!("object-{i}")));
        }
        let root_refs = params.root_refs.iter().map(|&i| hashes[i]).collect();
        Self {
            objects,
            hashes,
            root_refs,
            params: params.clone(),
        }
    }

    /// Objects reachable from the Root.
    pub fn reachable(&self) -> HashSet<usize> {
        let mut seen = HashSet::new();
        let mut stack = self.params.root_refs.clone();
        while let Some(i) = stack.pop() {
            if seen.insert(i) {
                stack.extend(self.params.children[i].iter().copied());
            }
        }
        seen
    }

    /// Expected refcount of every reachable object once the Root is held:
    /// one per edge from the Root and from each reachable parent.
    pub fn expected_refcounts(&self) -> HashMap<Hash, u32> {
        let reachable = self.reachable();
        let mut counts: HashMap<Hash, u32> = HashMap::new();
        for &i in &self.params.root_refs {
            *counts.entry(self.hashes[i]).or_default() += 1;
        }
        for &p in &reachable {
            for &c in &self.params.children[p] {
                *counts.entry(self.hashes[c]).or_default() += 1;
            }
        }
        counts
    }
}
