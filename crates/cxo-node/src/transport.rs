//! Transport abstraction.
//!
//! A transport moves opaque frames. Dialing or accepting yields a [`Link`]:
//! a pair of frame queues. Dropping the sending half closes the link; the
//! peer sees its receiving half end.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;

/// Frames buffered per direction of a link.
pub const LINK_CAPACITY: usize = 1024;

/// One established byte link to a peer.
#[derive(Debug)]
pub struct Link {
    /// Remote address, for logs.
    pub remote: String,
    pub tx: mpsc::Sender<Bytes>,
    pub rx: mpsc::Receiver<Bytes>,
}

/// Dials and listens.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn dial(&self, addr: &str) -> Result<Link>;

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>>;
}

/// Accepts incoming links.
#[async_trait]
pub trait Listener: Send {
    /// The address peers should dial.
    fn local_addr(&self) -> String;

    async fn accept(&mut self) -> Result<Link>;
}

/// A pair of links wired to each other.
pub fn link_pair(a: &str, b: &str, capacity: usize) -> (Link, Link) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    (
        Link {
            remote: b.to_string(),
            tx: a_tx,
            rx: a_rx,
        },
        Link {
            remote: a.to_string(),
            tx: b_tx,
            rx: b_rx,
        },
    )
}

/// A simple in-memory transport for testing.
///
/// Listeners register under a name; dialing that name hands the listener
/// one end of a fresh [`link_pair`].
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    use crate::error::NodeError;

    #[derive(Default)]
    struct Shared {
        listeners: Mutex<HashMap<String, mpsc::Sender<Link>>>,
        next_port: AtomicU64,
    }

    /// Shared state for the memory transport network.
    #[derive(Clone, Default)]
    pub struct MemoryNetwork {
        shared: Arc<Shared>,
    }

    impl MemoryNetwork {
        pub fn new() -> Self {
            Self::default()
        }

        fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, mpsc::Sender<Link>>>> {
            self.shared
                .listeners
                .lock()
                .map_err(|e| NodeError::Transport(format!("mutex poisoned: {}", e)))
        }
    }

    #[async_trait]
    impl Transport for MemoryNetwork {
        async fn dial(&self, addr: &str) -> Result<Link> {
            let acceptor = self
                .lock()?
                .get(addr)
                .cloned()
                .ok_or_else(|| NodeError::Transport(format!("connection refused: {}", addr)))?;

            let port = self.shared.next_port.fetch_add(1, Ordering::Relaxed);
            let (ours, theirs) = link_pair(&format!("mem-dialer-{}", port), addr, LINK_CAPACITY);
            acceptor
                .send(theirs)
                .await
                .map_err(|_| NodeError::Transport(format!("listener closed: {}", addr)))?;
            Ok(ours)
        }

        async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>> {
            let mut listeners = self.lock()?;
            if listeners.get(addr).is_some_and(|tx| !tx.is_closed()) {
                return Err(NodeError::Transport(format!("address in use: {}", addr)));
            }
            let (tx, rx) = mpsc::channel(16);
            listeners.insert(addr.to_string(), tx);
            Ok(Box::new(MemoryListener {
                addr: addr.to_string(),
                rx,
                network: self.clone(),
            }))
        }
    }

    pub struct MemoryListener {
        addr: String,
        rx: mpsc::Receiver<Link>,
        network: MemoryNetwork,
    }

    #[async_trait]
    impl Listener for MemoryListener {
        fn local_addr(&self) -> String {
            self.addr.clone()
        }

        async fn accept(&mut self) -> Result<Link> {
            self.rx
                .recv()
                .await
                .ok_or_else(|| NodeError::Transport("listener closed".into()))
        }
    }

    impl Drop for MemoryListener {
        fn drop(&mut self) {
            if let Ok(mut listeners) = self.network.lock() {
                listeners.remove(&self.addr);
            }
        }
    }
}

/// TCP transport: frames are prefixed by their length as u32 big-endian.
pub mod tcp {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
    use tracing::{debug, trace};

    use crate::codec::MAX_FRAME;

    #[derive(Debug, Clone, Copy, Default)]
    pub struct TcpTransport;

    impl TcpTransport {
        pub fn new() -> Self {
            Self
        }
    }

    #[async_trait]
    impl Transport for TcpTransport {
        async fn dial(&self, addr: &str) -> Result<Link> {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(spawn_link(stream, addr.to_string()))
        }

        async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>> {
            let listener = TcpListener::bind(addr).await?;
            let local = listener.local_addr()?.to_string();
            Ok(Box::new(TcpLinkListener { listener, local }))
        }
    }

    struct TcpLinkListener {
        listener: TcpListener,
        local: String,
    }

    #[async_trait]
    impl Listener for TcpLinkListener {
        fn local_addr(&self) -> String {
            self.local.clone()
        }

        async fn accept(&mut self) -> Result<Link> {
            let (stream, remote) = self.listener.accept().await?;
            stream.set_nodelay(true)?;
            Ok(spawn_link(stream, remote.to_string()))
        }
    }

    fn frame_codec() -> LengthDelimitedCodec {
        LengthDelimitedCodec::builder()
            .length_field_length(4)
            .max_frame_length(MAX_FRAME)
            .new_codec()
    }

    /// Pump frames between a TCP stream and a pair of queues.
    fn spawn_link(stream: TcpStream, remote: String) -> Link {
        let (reader, writer) = stream.into_split();
        let mut frames_in = FramedRead::new(reader, frame_codec());
        let mut frames_out = FramedWrite::new(writer, frame_codec());
        let (in_tx, in_rx) = mpsc::channel::<Bytes>(LINK_CAPACITY);
        let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(LINK_CAPACITY);

        let peer = remote.clone();
        tokio::spawn(async move {
            while let Some(frame) = frames_in.next().await {
                let frame = match frame {
                    Ok(frame) => frame.freeze(),
                    Err(e) => {
                        debug!(%peer, error = %e, "bad frame, dropping link");
                        break;
                    }
                };
                if in_tx.send(frame).await.is_err() {
                    break;
                }
            }
            trace!(%peer, "tcp reader done");
        });

        let peer = remote.clone();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = frames_out.send(frame).await {
                    debug!(%peer, error = %e, "tcp write failed");
                    break;
                }
            }
            let _ = SinkExt::<Bytes>::close(&mut frames_out).await;
            trace!(%peer, "tcp writer done");
        });

        Link {
            remote,
            tx: out_tx,
            rx: in_rx,
        }
    }
}
