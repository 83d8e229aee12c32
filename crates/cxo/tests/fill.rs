//! Fill behaviour against scripted peers: supersession, stalls and
//! fallback to another holder.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use cxo::node::{Msg, NodeError};
use cxo::{ContentStore, Hash, MemoryNetwork, Node, NodeConfig, PublicKey};
use cxo_testkit::{eventually, init_tracing, ObjectSet, PeerHarness, RecordingHooks, TestFeed};

async fn node_with_hooks(net: &MemoryNetwork, addr: &str) -> Result<(Node, Arc<RecordingHooks>)> {
    node_with_config(net, NodeConfig {
        listen: Some(addr.to_string()),
        ..NodeConfig::default()
    })
    .await
}

async fn node_with_config(net: &MemoryNetwork, config: NodeConfig) -> Result<(Node, Arc<RecordingHooks>)> {
    let hooks = Arc::new(RecordingHooks::new());
    let node = Node::builder()
        .transport(Arc::new(net.clone()))
        .hooks(hooks.clone())
        .config(config)
        .spawn()
        .await?;
    Ok((node, hooks))
}

fn rc(node: &Node, hash: &Hash) -> Option<u32> {
    node.cxds().get(hash, 0).ok().map(|(_, rc)| rc)
}

async fn wait_filling(node: &Node, feed: PublicKey, seq: Option<u64>) -> Result<()> {
    for _ in 0..500 {
        if node.filling(feed, 0).await? == seq {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("fill never reached {:?}", seq)
}

#[tokio::test]
async fn test_newer_root_supersedes_fill() -> Result<()> {
    init_tracing();
    let net = MemoryNetwork::new();
    let (node, hooks) = node_with_hooks(&net, "node").await?;
    let feed = TestFeed::with_seed([1; 32]);
    node.share(feed.public_key()).await?;

    let mut objects = ObjectSet::new();
    let a = objects.leaf("a");
    let b = objects.leaf("b");
    let c = objects.leaf("c");
    let r0 = feed.first(&[a, b]);
    let r1 = feed.next(&r0, &[b, c]);

    let mut peer = PeerHarness::connect(&net, "node").await?;
    peer.subscribe(feed.public_key()).await?;
    peer.announce(&r0).await?;

    // Answer `a` only; `b` stays in flight.
    for _ in 0..2 {
        let (id, hash) = peer.recv_request().await?;
        if hash == a {
            let value = objects.get(&a).cloned().unwrap_or_default();
            peer.reply(id, Msg::Object { value }).await?;
        }
    }
    eventually("a to be stored", || rc(&node, &a) == Some(1)).await;
    assert_eq!(node.filling(feed.public_key(), 0).await?, Some(0));

    peer.announce(&r1).await?;
    eventually("fill of seq 0 to break", || hooks.events().breaks.len() == 1).await;
    assert_eq!(node.filling(feed.public_key(), 0).await?, Some(1));

    // Everything seq 0 took is given back and its descriptor is gone.
    assert_eq!(rc(&node, &a), Some(0));
    assert_eq!(rc(&node, &r0.hash), Some(0));
    assert!(node.root_meta(feed.public_key(), 0, 0).is_err());
    let events = hooks.events();
    assert_eq!(events.breaks[0].0, 0);
    assert!(events.breaks[0].1.contains("superseded"));

    peer.serve(objects.as_map(), 2).await?;
    wait_filling(&node, feed.public_key(), None).await?;
    assert_eq!(node.last_root(feed.public_key(), 0)?, Some(r1));
    assert_eq!(rc(&node, &b), Some(1));
    assert_eq!(rc(&node, &c), Some(1));
    assert_eq!(rc(&node, &a), Some(0));

    node.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_fill_falls_back_to_another_holder() -> Result<()> {
    init_tracing();
    let net = MemoryNetwork::new();
    let (node, hooks) = node_with_hooks(&net, "node").await?;
    let feed = TestFeed::with_seed([2; 32]);
    node.share(feed.public_key()).await?;

    let mut objects = ObjectSet::new();
    let x = objects.leaf("x");
    let y = objects.leaf("y");
    let root = feed.first(&[x, y]);

    let mut first = PeerHarness::connect(&net, "node").await?;
    first.subscribe(feed.public_key()).await?;
    first.announce(&root).await?;
    for _ in 0..2 {
        let (id, hash) = first.recv_request().await?;
        if hash == x {
            let value = objects.get(&x).cloned().unwrap_or_default();
            first.reply(id, Msg::Object { value }).await?;
        }
    }
    first.disconnect();

    // Nobody else holds the Root: the fill waits instead of breaking.
    eventually("disconnect", || hooks.events().disconnects == 1).await;
    let st = node.head_status(feed.public_key(), 0).await?;
    assert_eq!(st.filling, Some(0));
    assert_eq!(st.holders, 0);
    assert!(hooks.events().breaks.is_empty());

    let mut second = PeerHarness::connect(&net, "node").await?;
    second.subscribe(feed.public_key()).await?;
    second.announce(&root).await?;
    let map = objects.as_map().clone();
    let server = tokio::spawn(async move { while second.serve(&map, 1).await.is_ok() {} });

    wait_filling(&node, feed.public_key(), None).await?;
    assert_eq!(node.last_root(feed.public_key(), 0)?, Some(root));
    assert_eq!(rc(&node, &x), Some(1));
    assert_eq!(rc(&node, &y), Some(1));
    let events = hooks.events();
    assert_eq!(events.filled, vec![0]);
    assert!(events.breaks.is_empty());

    server.abort();
    node.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_not_found_everywhere_parks_the_object() -> Result<()> {
    let net = MemoryNetwork::new();
    let (node, hooks) = node_with_hooks(&net, "node").await?;
    let feed = TestFeed::with_seed([3; 32]);
    node.share(feed.public_key()).await?;

    let mut objects = ObjectSet::new();
    let gone = objects.leaf("gone");
    let root = feed.first(&[gone]);

    let mut peer = PeerHarness::connect(&net, "node").await?;
    peer.subscribe(feed.public_key()).await?;
    peer.announce(&root).await?;
    // The peer lost the object.
    peer.serve(&Default::default(), 1).await?;

    let mut st = node.head_status(feed.public_key(), 0).await?;
    for _ in 0..500 {
        if st.in_flight == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        st = node.head_status(feed.public_key(), 0).await?;
    }
    assert_eq!((st.filling, st.wanted, st.in_flight), (Some(0), 1, 0));
    assert!(hooks.events().breaks.is_empty());

    // Announcing again makes the peer a candidate once more.
    peer.announce(&root).await?;
    peer.serve(objects.as_map(), 1).await?;
    wait_filling(&node, feed.public_key(), None).await?;
    assert_eq!(rc(&node, &gone), Some(1));
    Ok(())
}

#[tokio::test]
async fn test_retention_breaks_pruned_fill() -> Result<()> {
    let net = MemoryNetwork::new();
    let (node, hooks) = node_with_hooks(&net, "node").await?;
    let feed = TestFeed::with_seed([4; 32]);
    node.share(feed.public_key()).await?;

    let mut objects = ObjectSet::new();
    let a = objects.leaf("a");
    let root = feed.first(&[a]);

    let mut peer = PeerHarness::connect(&net, "node").await?;
    peer.subscribe(feed.public_key()).await?;
    peer.announce(&root).await?;
    let _ = peer.recv_request().await?;

    assert_eq!(node.del_roots_before(feed.public_key(), 0, 1).await?, 0);
    assert_eq!(node.filling(feed.public_key(), 0).await?, None);
    assert_eq!(rc(&node, &root.hash), Some(0));
    let events = hooks.events();
    assert_eq!(events.breaks, vec![(0, "fill of seq 0 pruned".to_string())]);
    Ok(())
}

#[tokio::test]
async fn test_not_found_falls_back_to_second_holder() -> Result<()> {
    let net = MemoryNetwork::new();
    let (node, hooks) = node_with_config(
        &net,
        NodeConfig {
            listen: Some("node".to_string()),
            max_parallel_requests: 1,
            ..NodeConfig::default()
        },
    )
    .await?;
    let feed = TestFeed::with_seed([5; 32]);
    node.share(feed.public_key()).await?;

    let mut objects = ObjectSet::new();
    let leaves: Vec<Hash> = ["p", "q", "r", "s"].iter().map(|d| objects.leaf(d)).collect();
    let root = feed.first(&leaves);

    // The first holder lost everything and keeps answering NotFound.
    let mut empty = PeerHarness::connect(&net, "node").await?;
    empty.subscribe(feed.public_key()).await?;
    empty.announce(&root).await?;
    let nothing = Default::default();
    let lost = tokio::spawn(async move { while empty.serve(&nothing, 1).await.is_ok() {} });

    let mut full = PeerHarness::connect(&net, "node").await?;
    full.subscribe(feed.public_key()).await?;
    full.announce(&root).await?;
    let map = objects.as_map().clone();
    let server = tokio::spawn(async move { while full.serve(&map, 1).await.is_ok() {} });

    wait_filling(&node, feed.public_key(), None).await?;
    assert_eq!(node.last_root(feed.public_key(), 0)?, Some(root));
    for leaf in &leaves {
        assert_eq!(rc(&node, leaf), Some(1));
    }
    assert_eq!(hooks.events().filled, vec![0]);

    lost.abort();
    server.abort();
    node.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_conflicting_roots_leave_fill_alone() -> Result<()> {
    let net = MemoryNetwork::new();
    let (node, hooks) = node_with_hooks(&net, "node").await?;
    let feed = TestFeed::with_seed([6; 32]);
    node.share(feed.public_key()).await?;

    let mut objects = ObjectSet::new();
    let a = objects.leaf("a");
    let other = objects.leaf("other");
    let r0 = feed.first(&[a]);
    // Same seq, different content; and a successor of that rival.
    let rival0 = feed.first(&[other]);
    let rival1 = feed.next(&rival0, &[a]);

    let mut peer = PeerHarness::connect(&net, "node").await?;
    peer.subscribe(feed.public_key()).await?;
    peer.announce(&r0).await?;
    let (id, hash) = peer.recv_request().await?;
    assert_eq!(hash, a);

    peer.announce(&rival1).await?;
    peer.announce(&rival0).await?;
    peer.round_trip().await?;

    let st = node.head_status(feed.public_key(), 0).await?;
    assert_eq!((st.filling, st.holders), (Some(0), 1));
    assert!(hooks.events().breaks.is_empty());
    assert!(node.root_meta(feed.public_key(), 0, 1).is_err());
    assert_eq!(node.root_meta(feed.public_key(), 0, 0)?.hash, r0.hash);

    // The original request is still answered into the same fill.
    let value = objects.get(&a).cloned().unwrap_or_default();
    peer.reply(id, Msg::Object { value }).await?;
    wait_filling(&node, feed.public_key(), None).await?;
    assert_eq!(node.last_root(feed.public_key(), 0)?, Some(r0));
    assert_eq!(rc(&node, &other), None);

    node.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_wrong_answer_to_object_request_closes_connection() -> Result<()> {
    let net = MemoryNetwork::new();
    let (node, hooks) = node_with_hooks(&net, "node").await?;
    let feed = TestFeed::with_seed([7; 32]);
    node.share(feed.public_key()).await?;

    let mut objects = ObjectSet::new();
    let a = objects.leaf("a");
    let root = feed.first(&[a]);

    let mut peer = PeerHarness::connect(&net, "node").await?;
    peer.subscribe(feed.public_key()).await?;
    peer.announce(&root).await?;
    let (id, _) = peer.recv_request().await?;
    peer.reply(id, Msg::NonPublicServer).await?;

    let closed = loop {
        match peer.recv().await {
            Ok(_) => continue,
            Err(e) => break e,
        }
    };
    assert!(matches!(closed, NodeError::ConnectionClosed));

    eventually("disconnect", || hooks.events().disconnects == 1).await;
    let st = node.head_status(feed.public_key(), 0).await?;
    assert_eq!((st.filling, st.holders), (Some(0), 0));
    assert!(hooks.events().breaks.is_empty());
    Ok(())
}
