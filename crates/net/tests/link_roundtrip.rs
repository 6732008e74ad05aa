//! End-to-end link driver tests over real localhost TCP.

use mclink_core::BackoffConfig;
use mclink_net::{LinkDriver, LinkEndpoint, SenderCmd};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

async fn recv_one(rx: &mut mpsc::Receiver<(u64, Vec<u8>)>) -> (u64, Vec<u8>) {
    timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("Timed out waiting for delivery")
        .expect("Delivery channel closed")
}

#[tokio::test]
async fn test_out_of_order_offers_deliver_in_sequence_order() {
    let listener = LinkEndpoint::listen("127.0.0.1:0".parse().expect("Failed to parse addr"))
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("No local addr");

    let internal = LinkDriver::new(listener, 1 << 20);
    let external = LinkDriver::new(
        LinkEndpoint::dial(addr, &BackoffConfig::default()),
        1 << 20,
    );

    let (sender_tx, sender_rx) = mpsc::channel(64);
    let (internal_deliver_tx, mut internal_deliver_rx) = mpsc::channel(64);
    let (peer_sender_tx, peer_sender_rx) = mpsc::channel::<SenderCmd>(64);
    let (external_deliver_tx, _external_deliver_rx) = mpsc::channel(64);

    tokio::spawn(internal.run(peer_sender_rx, internal_deliver_tx));
    tokio::spawn(external.run(sender_rx, external_deliver_tx));

    // Compression finished #2 before #1; the wire must carry #1 first.
    sender_tx
        .send(SenderCmd::Offer {
            sequence: 2,
            payload: b"second".to_vec(),
        })
        .await
        .expect("Failed to send");
    sender_tx
        .send(SenderCmd::Offer {
            sequence: 1,
            payload: b"first".to_vec(),
        })
        .await
        .expect("Failed to send");

    assert_eq!(recv_one(&mut internal_deliver_rx).await, (1, b"first".to_vec()));
    assert_eq!(
        recv_one(&mut internal_deliver_rx).await,
        (2, b"second".to_vec())
    );

    // Keep the peer's sender half alive until the test ends.
    drop(peer_sender_tx);
}

#[tokio::test]
async fn test_permanent_failure_does_not_stall_the_receiver() {
    let listener = LinkEndpoint::listen("127.0.0.1:0".parse().expect("Failed to parse addr"))
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("No local addr");

    let internal = LinkDriver::new(listener, 1 << 20);
    let external = LinkDriver::new(
        LinkEndpoint::dial(addr, &BackoffConfig::default()),
        1 << 20,
    );

    let (sender_tx, sender_rx) = mpsc::channel(64);
    let (internal_deliver_tx, mut internal_deliver_rx) = mpsc::channel(64);
    let (peer_sender_tx, peer_sender_rx) = mpsc::channel::<SenderCmd>(64);
    let (external_deliver_tx, _external_deliver_rx) = mpsc::channel(64);

    tokio::spawn(internal.run(peer_sender_rx, internal_deliver_tx));
    tokio::spawn(external.run(sender_rx, external_deliver_tx));

    sender_tx
        .send(SenderCmd::Offer {
            sequence: 1,
            payload: b"one".to_vec(),
        })
        .await
        .expect("Failed to send");
    // Sequence 2 failed compression permanently.
    sender_tx
        .send(SenderCmd::Fail { sequence: 2 })
        .await
        .expect("Failed to send");
    sender_tx
        .send(SenderCmd::Offer {
            sequence: 3,
            payload: b"three".to_vec(),
        })
        .await
        .expect("Failed to send");

    assert_eq!(recv_one(&mut internal_deliver_rx).await, (1, b"one".to_vec()));
    // Sequence 2 is skipped via gap marker, not waited for.
    assert_eq!(
        recv_one(&mut internal_deliver_rx).await,
        (3, b"three".to_vec())
    );

    drop(peer_sender_tx);
}

#[tokio::test]
async fn test_reconnect_resumes_delivery() {
    let listener = LinkEndpoint::listen("127.0.0.1:0".parse().expect("Failed to parse addr"))
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("No local addr");

    // Sender side persists across the peer restart.
    let sender_driver = LinkDriver::new(listener, 1 << 20);
    let (sender_tx, sender_rx) = mpsc::channel(64);
    let (sender_deliver_tx, _sender_deliver_rx) = mpsc::channel(64);
    tokio::spawn(sender_driver.run(sender_rx, sender_deliver_tx));

    // First receiver session.
    let fast_backoff = BackoffConfig {
        initial_ms: 10,
        max_ms: 100,
        multiplier: 2.0,
    };
    let receiver_one = LinkDriver::new(LinkEndpoint::dial(addr, &fast_backoff), 1 << 20);
    let (recv_one_sender_tx, recv_one_sender_rx) = mpsc::channel::<SenderCmd>(64);
    let (deliver_one_tx, mut deliver_one_rx) = mpsc::channel(64);
    let receiver_task = tokio::spawn(receiver_one.run(recv_one_sender_rx, deliver_one_tx));

    sender_tx
        .send(SenderCmd::Offer {
            sequence: 1,
            payload: b"one".to_vec(),
        })
        .await
        .expect("Failed to send");
    assert_eq!(recv_one(&mut deliver_one_rx).await, (1, b"one".to_vec()));

    // Kill the receiver mid-session. Its confirmation state is lost, so
    // the fresh session's handshake reports confirmed = 0 and the sender's
    // retained frames are re-sent rather than stranded.
    receiver_task.abort();
    drop(recv_one_sender_tx);
    drop(deliver_one_rx);

    sender_tx
        .send(SenderCmd::Offer {
            sequence: 2,
            payload: b"two".to_vec(),
        })
        .await
        .expect("Failed to send");

    let receiver_two = LinkDriver::new(LinkEndpoint::dial(addr, &fast_backoff), 1 << 20);
    let (recv_two_sender_tx, recv_two_sender_rx) = mpsc::channel::<SenderCmd>(64);
    let (deliver_two_tx, mut deliver_two_rx) = mpsc::channel(64);
    tokio::spawn(receiver_two.run(recv_two_sender_rx, deliver_two_tx));

    // Everything unconfirmed arrives on the new session, in order.
    assert_eq!(recv_one(&mut deliver_two_rx).await, (1, b"one".to_vec()));
    assert_eq!(recv_one(&mut deliver_two_rx).await, (2, b"two".to_vec()));

    drop(recv_two_sender_tx);
}
