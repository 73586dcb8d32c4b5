// src/broadcast.rs - WebSocket fan-out of skeleton frames
//!
//! The producer hands frames to a [`FrameSender`] and never waits. A drain
//! task on the broadcaster's own runtime pops them in order and pushes each
//! into every subscriber's own [`FrameQueue`], so a slow subscriber only
//! delays itself. The [`QueuePolicy`] applies to each of those queues, which
//! bounds what a stalled subscriber can hold under `DropOldest`.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use axum::Router;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::runtime::{Builder as RuntimeBuilder, Runtime};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::skeleton::Skeleton;

/// One serialized skeleton, as sent to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame(Arc<str>);

impl StreamFrame {
    pub fn from_skeleton(skeleton: &Skeleton) -> serde_json::Result<Self> {
        Ok(Self(serde_json::to_string(skeleton)?.into()))
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self(text.into().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// What a queue does when its consumer falls behind: the drain loop for the
/// producer's queue, the socket for a subscriber's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum QueuePolicy {
    /// Never drop; memory grows with the backlog.
    Unbounded,
    /// Keep at most `capacity` frames, evicting the oldest.
    DropOldest { capacity: usize },
}

impl Default for QueuePolicy {
    fn default() -> Self {
        QueuePolicy::Unbounded
    }
}

/// Single-consumer FIFO, used between the producer and the drain loop and
/// between the drain loop and each subscriber.
#[derive(Debug)]
pub struct FrameQueue {
    frames: Mutex<VecDeque<StreamFrame>>,
    notify: Notify,
    policy: QueuePolicy,
    dropped: Arc<AtomicU64>,
}

impl FrameQueue {
    pub fn new(policy: QueuePolicy) -> Self {
        Self::with_drop_counter(policy, Arc::new(AtomicU64::new(0)))
    }

    /// Counts evictions into a counter shared with other queues.
    pub fn with_drop_counter(policy: QueuePolicy, dropped: Arc<AtomicU64>) -> Self {
        Self {
            frames: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            policy,
            dropped,
        }
    }

    pub fn push(&self, frame: StreamFrame) {
        {
            let mut frames = lock(&self.frames);
            frames.push_back(frame);
            if let QueuePolicy::DropOldest { capacity } = self.policy {
                while frames.len() > capacity.max(1) {
                    frames.pop_front();
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        self.notify.notify_one();
    }

    pub fn pop(&self) -> Option<StreamFrame> {
        lock(&self.frames).pop_front()
    }

    /// Waits for the next frame.
    pub async fn next(&self) -> StreamFrame {
        loop {
            if let Some(frame) = self.pop() {
                return frame;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.frames).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames evicted by [`QueuePolicy::DropOldest`] from every queue
    /// sharing this counter.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Producer-side handle. Cloning is cheap; `enqueue` never blocks.
#[derive(Debug, Clone)]
pub struct FrameSender {
    queue: Arc<FrameQueue>,
}

impl FrameSender {
    pub fn enqueue(&self, frame: StreamFrame) {
        self.queue.push(frame);
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Frames dropped so far, whether the drain loop or a subscriber fell
    /// behind.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastOptions {
    pub host: String,
    /// Use `0` for an ephemeral port.
    pub port: u16,
    pub queue: QueuePolicy,
}

impl Default for BroadcastOptions {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8765,
            queue: QueuePolicy::Unbounded,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error("failed to initialize broadcast runtime: {0}")]
    RuntimeInit(#[source] std::io::Error),
    #[error("failed to bind broadcaster at {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to determine bound address: {0}")]
    LocalAddr(#[source] std::io::Error),
    #[error("broadcast server error: {0}")]
    Serve(#[source] std::io::Error),
    #[error("broadcast task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// How long a closing handshake may take before the socket is dropped.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type SubscriberMap = Arc<Mutex<HashMap<u64, Arc<FrameQueue>>>>;

/// State shared by the connection handlers.
#[derive(Clone)]
struct Hub {
    subscribers: SubscriberMap,
    next_id: Arc<AtomicU64>,
    policy: QueuePolicy,
    dropped: Arc<AtomicU64>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Hub {
    fn register(&self) -> (u64, Arc<FrameQueue>) {
        let queue = Arc::new(FrameQueue::with_drop_counter(
            self.policy,
            Arc::clone(&self.dropped),
        ));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.subscribers).insert(id, Arc::clone(&queue));
        (id, queue)
    }

    fn unregister(&self, id: u64) {
        lock(&self.subscribers).remove(&id);
    }
}

struct Running {
    runtime: Runtime,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    server_task: JoinHandle<Result<(), BroadcastError>>,
    drain_task: JoinHandle<()>,
    bound_addr: SocketAddr,
}

/// Persistent WebSocket server streaming [`StreamFrame`]s to every
/// connected subscriber.
///
/// `start` and `stop` block the calling thread and must not be called from
/// inside an async runtime.
pub struct Broadcaster {
    opts: BroadcastOptions,
    queue: Arc<FrameQueue>,
    dropped: Arc<AtomicU64>,
    subscribers: SubscriberMap,
    running: Mutex<Option<Running>>,
}

impl Broadcaster {
    pub fn new(opts: BroadcastOptions) -> Self {
        let dropped = Arc::new(AtomicU64::new(0));
        Self {
            queue: Arc::new(FrameQueue::with_drop_counter(opts.queue, Arc::clone(&dropped))),
            dropped,
            opts,
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            running: Mutex::new(None),
        }
    }

    pub fn sender(&self) -> FrameSender {
        FrameSender {
            queue: Arc::clone(&self.queue),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    /// Frames waiting for the furthest-behind subscriber.
    pub fn subscriber_backlog(&self) -> usize {
        lock(&self.subscribers)
            .values()
            .map(|queue| queue.len())
            .max()
            .unwrap_or(0)
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }

    pub fn bound_addr(&self) -> Option<SocketAddr> {
        lock(&self.running).as_ref().map(|r| r.bound_addr)
    }

    /// Binds the listener and spawns the server and drain loop. Calling it
    /// again while running returns the existing address.
    pub fn start(&self) -> Result<SocketAddr, BroadcastError> {
        let mut running = lock(&self.running);
        if let Some(existing) = running.as_ref() {
            return Ok(existing.bound_addr);
        }

        let runtime = RuntimeBuilder::new_multi_thread()
            .worker_threads(2)
            .thread_name("pose-stream-broadcast")
            .enable_all()
            .build()
            .map_err(BroadcastError::RuntimeInit)?;

        let host = self.opts.host.clone();
        let port = self.opts.port;
        let listener = runtime
            .block_on(TcpListener::bind((host.as_str(), port)))
            .map_err(|source| BroadcastError::Bind {
                addr: format!("{}:{}", host, port),
                source,
            })?;
        let bound_addr = listener.local_addr().map_err(BroadcastError::LocalAddr)?;

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let hub = Hub {
            subscribers: Arc::clone(&self.subscribers),
            next_id: Arc::new(AtomicU64::new(0)),
            policy: self.opts.queue,
            dropped: Arc::clone(&self.dropped),
            shutdown: shutdown.clone(),
            tracker: tracker.clone(),
        };

        let app = Router::new().fallback(subscribe).with_state(hub);
        let server_shutdown = shutdown.clone();
        let server_task = runtime.spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
            .map_err(BroadcastError::Serve)
        });

        let drain_task = runtime.spawn(drain(
            Arc::clone(&self.queue),
            Arc::clone(&self.subscribers),
            shutdown.clone(),
        ));

        info!(%bound_addr, "broadcaster listening on ws://{}", bound_addr);

        *running = Some(Running {
            runtime,
            shutdown,
            tracker,
            server_task,
            drain_task,
            bound_addr,
        });
        Ok(bound_addr)
    }

    /// Closes every subscriber connection and waits for the server, the
    /// subscriber tasks and the drain loop to finish. A subscriber that has
    /// stopped reading is dropped without a closing handshake. No-op when
    /// stopped.
    pub fn stop(&self) -> Result<(), BroadcastError> {
        let Some(running) = lock(&self.running).take() else {
            return Ok(());
        };
        let Running {
            runtime,
            shutdown,
            tracker,
            server_task,
            drain_task,
            bound_addr,
        } = running;

        shutdown.cancel();
        let result = runtime.block_on(async move {
            let served = server_task.await;
            tracker.close();
            tracker.wait().await;
            let drained = drain_task.await;
            served??;
            drained?;
            Ok(())
        });
        lock(&self.subscribers).clear();
        info!(%bound_addr, "broadcaster stopped");
        result
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("broadcaster shutdown error: {}", e);
        }
    }
}

async fn subscribe(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(hub): State<Hub>,
) -> Response {
    ws.on_upgrade(move |socket| {
        let tracker = hub.tracker.clone();
        tracker.track_future(serve_subscriber(socket, peer, hub))
    })
}

async fn serve_subscriber(mut socket: WebSocket, peer: SocketAddr, hub: Hub) {
    let (id, queue) = hub.register();
    info!(%peer, id, "subscriber connected");

    loop {
        let frame = tokio::select! {
            _ = hub.shutdown.cancelled() => {
                if tokio::time::timeout(CLOSE_TIMEOUT, socket.send(Message::Close(None)))
                    .await
                    .is_err()
                {
                    debug!(%peer, id, "close handshake timed out");
                }
                break;
            }
            frame = queue.next() => frame,
            msg = socket.recv() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                // Subscribers are not expected to talk back.
                Some(Ok(_)) => continue,
            },
        };

        // A peer that stopped reading blocks here once its TCP window fills.
        tokio::select! {
            _ = hub.shutdown.cancelled() => {
                debug!(%peer, id, "dropping stalled subscriber");
                break;
            }
            sent = socket.send(Message::Text(frame.as_str().into())) => {
                if let Err(e) = sent {
                    debug!(%peer, id, "send failed: {}", e);
                    break;
                }
            }
        }
    }

    hub.unregister(id);
    info!(%peer, id, "subscriber disconnected");
}

async fn drain(queue: Arc<FrameQueue>, subscribers: SubscriberMap, shutdown: CancellationToken) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = queue.next() => frame,
        };
        fan_out(&subscribers, &frame);
    }
    debug!("drain loop finished");
}

/// Queues the frame for every subscriber. Each queue applies the policy on
/// its own, so one backlog never evicts another subscriber's frames.
fn fan_out(subscribers: &SubscriberMap, frame: &StreamFrame) {
    for queue in lock(subscribers).values() {
        queue.push(frame.clone());
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
