use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use futures::StreamExt;
use pose_stream::{BroadcastOptions, Broadcaster, QueuePolicy, StreamFrame};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn local_broadcaster() -> (Broadcaster, SocketAddr) {
    broadcaster_with(QueuePolicy::Unbounded)
}

fn broadcaster_with(queue: QueuePolicy) -> (Broadcaster, SocketAddr) {
    let broadcaster = Broadcaster::new(BroadcastOptions {
        host: "127.0.0.1".to_string(),
        port: 0,
        queue,
    });
    let addr = broadcaster.start().unwrap();
    (broadcaster, addr)
}

/// Frames big enough that a client which never reads fills the kernel
/// buffers and blocks the server's writes.
fn large_frames(count: usize, size: usize) -> Vec<StreamFrame> {
    (0..count)
        .map(|i| {
            let mut text = format!("frame-{}:", i);
            text.extend(std::iter::repeat('x').take(size));
            StreamFrame::text(text)
        })
        .collect()
}

fn frame_label(text: &str) -> &str {
    text.split(':').next().unwrap()
}

/// Runs `stop` on another thread and fails if it does not return in time.
fn stop_within(broadcaster: Broadcaster, deadline: Duration) {
    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    thread::spawn(move || {
        let result = broadcaster.stop().map_err(|e| e.to_string());
        let _ = done_tx.send(result);
    });
    match done_rx.recv_timeout(deadline) {
        Ok(result) => result.unwrap(),
        Err(_) => panic!("stop() did not return within {:?}", deadline),
    }
}

async fn connect(addr: SocketAddr, path: &str) -> Client {
    let (client, _) = connect_async(format!("ws://{}{}", addr, path)).await.unwrap();
    client
}

async fn wait_for_subscribers(broadcaster: &Broadcaster, expected: usize) {
    for _ in 0..200 {
        if broadcaster.subscriber_count() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "expected {} subscribers, have {}",
        expected,
        broadcaster.subscriber_count()
    );
}

async fn next_text(client: &mut Client) -> String {
    let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("connection closed")
        .unwrap();
    msg.to_text().unwrap().to_string()
}

// The broadcaster blocks on its own runtime in start/stop, so the clients get
// a separate one and start/stop happen outside of it.

#[test]
fn every_subscriber_gets_every_frame_in_order() {
    let (broadcaster, addr) = local_broadcaster();
    let sender = broadcaster.sender();
    let rt = Runtime::new().unwrap();

    let received = rt.block_on(async {
        let mut fast_a = connect(addr, "/").await;
        let mut fast_b = connect(addr, "/skeleton").await;
        let mut late = connect(addr, "/").await;
        wait_for_subscribers(&broadcaster, 3).await;

        for i in 0..5 {
            sender.enqueue(StreamFrame::text(format!("frame-{}", i)));
        }

        let mut received = Vec::new();
        for client in [&mut fast_a, &mut fast_b] {
            let mut frames = Vec::new();
            for _ in 0..5 {
                frames.push(next_text(client).await);
            }
            received.push(frames);
        }

        // This one only starts reading once the others are done.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let mut frames = Vec::new();
        for _ in 0..5 {
            frames.push(next_text(&mut late).await);
        }
        received.push(frames);
        received
    });

    let expected: Vec<String> = (0..5).map(|i| format!("frame-{}", i)).collect();
    for frames in received {
        assert_eq!(frames, expected);
    }
    broadcaster.stop().unwrap();
}

#[test]
fn disconnected_subscribers_are_removed() {
    let (broadcaster, addr) = local_broadcaster();
    let sender = broadcaster.sender();
    let rt = Runtime::new().unwrap();

    rt.block_on(async {
        let mut stays = connect(addr, "/").await;
        let mut leaves = connect(addr, "/").await;
        wait_for_subscribers(&broadcaster, 2).await;

        leaves.close(None).await.unwrap();
        drop(leaves);
        wait_for_subscribers(&broadcaster, 1).await;

        sender.enqueue(StreamFrame::text("after"));
        assert_eq!(next_text(&mut stays).await, "after");
    });

    broadcaster.stop().unwrap();
}

#[test]
fn stop_closes_subscriber_connections() {
    let (broadcaster, addr) = local_broadcaster();
    let rt = Runtime::new().unwrap();

    let mut client = rt.block_on(async {
        let client = connect(addr, "/").await;
        wait_for_subscribers(&broadcaster, 1).await;
        client
    });

    broadcaster.stop().unwrap();
    assert!(!broadcaster.is_running());
    assert_eq!(broadcaster.subscriber_count(), 0);

    rt.block_on(async {
        let next = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("connection was not closed");
        assert!(matches!(next, None | Some(Ok(Message::Close(_))) | Some(Err(_))));
    });

    // Stopping twice is harmless.
    broadcaster.stop().unwrap();
}

#[test]
fn frames_enqueued_while_nobody_listens_are_not_replayed() {
    let (broadcaster, addr) = local_broadcaster();
    let sender = broadcaster.sender();
    sender.enqueue(StreamFrame::text("early"));
    let rt = Runtime::new().unwrap();

    rt.block_on(async {
        // Let the drain loop consume the early frame.
        for _ in 0..200 {
            if sender.queued() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let mut client = connect(addr, "/").await;
        wait_for_subscribers(&broadcaster, 1).await;
        sender.enqueue(StreamFrame::text("late"));
        assert_eq!(next_text(&mut client).await, "late");
    });

    broadcaster.stop().unwrap();
}

#[test]
fn blocked_subscriber_does_not_hold_back_the_others() {
    let (broadcaster, addr) = local_broadcaster();
    let sender = broadcaster.sender();
    let frames = large_frames(5, 4 << 20);
    let rt = Runtime::new().unwrap();

    let (received, blocked) = rt.block_on(async {
        let mut fast_a = connect(addr, "/").await;
        let mut fast_b = connect(addr, "/").await;
        // Connected but never polled again.
        let blocked = connect(addr, "/").await;
        wait_for_subscribers(&broadcaster, 3).await;

        let started = Instant::now();
        for frame in &frames {
            sender.enqueue(frame.clone());
        }
        assert!(
            started.elapsed() < Duration::from_millis(100),
            "enqueue blocked for {:?}",
            started.elapsed()
        );

        let mut received = Vec::new();
        for client in [&mut fast_a, &mut fast_b] {
            let mut labels = Vec::new();
            for _ in 0..5 {
                labels.push(frame_label(&next_text(client).await).to_string());
            }
            received.push(labels);
        }
        (received, blocked)
    });

    let expected: Vec<String> = (0..5).map(|i| format!("frame-{}", i)).collect();
    for labels in received {
        assert_eq!(labels, expected);
    }
    stop_within(broadcaster, Duration::from_secs(10));
    drop(blocked);
}

#[test]
fn stop_returns_while_a_subscriber_is_stalled() {
    let (broadcaster, addr) = local_broadcaster();
    let sender = broadcaster.sender();
    let rt = Runtime::new().unwrap();

    let stalled = rt.block_on(async {
        let client = connect(addr, "/").await;
        wait_for_subscribers(&broadcaster, 1).await;
        client
    });
    for frame in large_frames(64, 1 << 20) {
        sender.enqueue(frame);
    }
    // Give the server time to fill the socket and block on the write.
    thread::sleep(Duration::from_millis(300));

    stop_within(broadcaster, Duration::from_secs(10));
    drop(stalled);
}

#[test]
fn drop_oldest_bounds_a_stalled_subscriber() {
    let (broadcaster, addr) = broadcaster_with(QueuePolicy::DropOldest { capacity: 2 });
    let sender = broadcaster.sender();
    let rt = Runtime::new().unwrap();

    let stalled = rt.block_on(async {
        let client = connect(addr, "/").await;
        wait_for_subscribers(&broadcaster, 1).await;
        client
    });
    for frame in large_frames(64, 1 << 20) {
        sender.enqueue(frame);
        thread::sleep(Duration::from_millis(2));
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while sender.dropped() == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(sender.dropped() > 0, "no frames were dropped");
    assert!(broadcaster.subscriber_backlog() <= 2);
    assert!(sender.queued() <= 2);

    stop_within(broadcaster, Duration::from_secs(10));
    drop(stalled);
}
