//! 多路复用传输的行为验证：排空、流控、断连、保活、截止隔离与分帧。
//!
//! 测试直接在内存双工管道上完成握手，对端为 [`EchoPeer`]。

mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use spark_client::contract::{CallOptions, Cancellation};
use spark_client::test_stubs::{EchoPeer, PeerHandle, PeerOptions, STATUS_FAILED};
use spark_client::transport::frame::Settings;
use spark_client::transport::{CloseReason, Transport};
use spark_client::{ClientError, TransportConfig};
use support::eventually;

async fn establish(options: PeerOptions, config: &TransportConfig) -> (Transport, PeerHandle) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let peer = EchoPeer::spawn(server, options);
    let transport = Transport::handshake(Box::new(client), "echo.test", config)
        .await
        .expect("握手失败");
    (transport, peer)
}

fn payload(len: usize) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
}

#[tokio::test]
async fn unary_round_trip_and_status() {
    let (transport, _peer) = establish(PeerOptions::default(), &TransportConfig::default()).await;

    let mut stream = transport
        .open_stream("/echo", &CallOptions::new())
        .expect("打开流失败");
    stream.send_message(Bytes::from_static(b"ping")).await.unwrap();
    stream.close_send();
    assert_eq!(stream.recv_message().await.unwrap().as_deref(), Some(&b"ping"[..]));
    assert_eq!(stream.recv_message().await.unwrap(), None);
    stream.finish().await.unwrap();

    let mut failing = transport
        .open_stream("/fail", &CallOptions::new())
        .unwrap();
    failing.close_send();
    match failing.finish().await {
        Err(ClientError::Status { code, .. }) => assert_eq!(code, STATUS_FAILED),
        other => panic!("期望非零状态，得到 {other:?}"),
    }
    assert_eq!(transport.active_streams(), 0);
}

#[tokio::test]
async fn remote_drain_completes_open_streams_and_reports_once() {
    let (transport, peer) = establish(PeerOptions::default(), &TransportConfig::default()).await;
    let closed_reports = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&closed_reports);
    transport.on_closed(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let mut streams = Vec::new();
    for index in 0..3u8 {
        let mut stream = transport
            .open_stream("/echo", &CallOptions::new())
            .unwrap();
        stream.send_message(Bytes::from(vec![index; 8])).await.unwrap();
        streams.push(stream);
    }
    eventually("对端收到 3 个流", Duration::from_secs(2), || {
        peer.streams_opened() == 3
    })
    .await;

    peer.goaway();
    eventually("传输进入排空", Duration::from_secs(2), || transport.is_draining()).await;
    assert!(matches!(
        transport.open_stream("/echo", &CallOptions::new()),
        Err(ClientError::GoingAway)
    ));
    assert!(!transport.is_closed(), "仍有在途流时不应关闭");

    for (index, stream) in streams.iter_mut().enumerate() {
        stream.close_send();
        let echoed = stream.recv_message().await.unwrap().expect("缺少回显");
        assert_eq!(echoed.as_ref(), &[index as u8; 8]);
        stream.finish().await.unwrap();
    }

    assert_eq!(transport.closed().await, CloseReason::Remote);
    transport.drain();
    transport.close(ClientError::transport_fatal("late close"));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(closed_reports.load(Ordering::SeqCst), 1, "关闭只应报告一次");
    assert_eq!(peer.streams_opened(), 3, "排空后不应再有新流到达对端");
}

#[tokio::test]
async fn local_drain_without_streams_closes_gracefully() {
    let (transport, _peer) = establish(PeerOptions::default(), &TransportConfig::default()).await;
    transport.drain();
    assert_eq!(transport.closed().await, CloseReason::Graceful);
    assert!(matches!(
        transport.open_stream("/echo", &CallOptions::new()),
        Err(ClientError::GoingAway)
    ));
}

#[tokio::test]
async fn sender_blocks_until_peer_grants_credit() {
    let options = PeerOptions {
        auto_credit: false,
        settings: Settings {
            stream_window: 1024,
            ..PeerOptions::default().settings
        },
        ..PeerOptions::default()
    };
    let (transport, peer) = establish(options, &TransportConfig::default()).await;

    let mut stream = transport
        .open_stream("/echo", &CallOptions::new())
        .unwrap();
    let id = stream.id();
    let message = payload(4_000);
    let expected = message.clone();
    let sender = tokio::spawn(async move {
        stream.send_message(message).await.map(|()| stream)
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!sender.is_finished(), "窗口耗尽后发送应阻塞");

    peer.grant(id, 4_096);
    let mut stream = tokio::time::timeout(Duration::from_secs(2), sender)
        .await
        .expect("获得额度后发送仍未完成")
        .unwrap()
        .unwrap();
    stream.close_send();
    assert_eq!(stream.recv_message().await.unwrap(), Some(expected));
    stream.finish().await.unwrap();
}

#[tokio::test]
async fn large_messages_are_split_into_frames() {
    let (transport, _peer) = establish(PeerOptions::default(), &TransportConfig::default()).await;
    let message = payload(200 * 1024);

    let mut stream = transport
        .open_stream("/echo", &CallOptions::new())
        .unwrap();
    stream.send_message(message.clone()).await.unwrap();
    stream.send_message(Bytes::new()).await.unwrap();
    stream.close_send();
    assert_eq!(stream.recv_message().await.unwrap(), Some(message));
    assert_eq!(stream.recv_message().await.unwrap(), Some(Bytes::new()));
    stream.finish().await.unwrap();
}

#[tokio::test]
async fn abrupt_disconnect_fails_streams_in_flight() {
    let (transport, peer) = establish(PeerOptions::default(), &TransportConfig::default()).await;
    let mut stream = transport
        .open_stream("/hang", &CallOptions::new())
        .unwrap();
    stream.send_message(Bytes::from_static(b"wait")).await.unwrap();
    stream.close_send();
    eventually("对端收到流", Duration::from_secs(2), || peer.streams_opened() == 1).await;

    peer.close();
    let err = stream.recv_message().await.unwrap_err();
    assert_eq!(err.code(), "spark.client.transport.fatal", "{err}");
    let reason = transport.closed().await;
    assert!(reason.is_fatal(), "{reason}");
    assert!(!transport.is_available());
}

#[tokio::test]
async fn keepalive_without_ack_closes_transport() {
    let config = TransportConfig {
        keepalive_time: Some(Duration::from_millis(50)),
        keepalive_timeout: Duration::from_millis(100),
        keepalive_without_calls: true,
        ..TransportConfig::default()
    };
    let options = PeerOptions {
        answer_pings: false,
        ..PeerOptions::default()
    };
    let (transport, peer) = establish(options, &config).await;

    let reason = tokio::time::timeout(Duration::from_secs(2), transport.closed())
        .await
        .expect("保活超时未触发关闭");
    match reason {
        CloseReason::Fatal(err) => assert!(err.to_string().contains("keepalive"), "{err}"),
        other => panic!("期望致命关闭，得到 {other}"),
    }
    assert!(peer.pings() >= 1);
}

#[tokio::test]
async fn keepalive_with_ack_keeps_transport_alive() {
    let config = TransportConfig {
        keepalive_time: Some(Duration::from_millis(30)),
        keepalive_timeout: Duration::from_millis(200),
        keepalive_without_calls: true,
        ..TransportConfig::default()
    };
    let (transport, peer) = establish(PeerOptions::default(), &config).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(transport.is_available());
    assert!(peer.pings() >= 2, "只收到 {} 次 PING", peer.pings());
}

#[tokio::test]
async fn expired_stream_does_not_affect_siblings() {
    let (transport, peer) = establish(PeerOptions::default(), &TransportConfig::default()).await;

    let mut hanging = transport
        .open_stream(
            "/hang",
            &CallOptions::new().with_timeout(Duration::from_millis(50)),
        )
        .unwrap();
    let mut healthy = transport
        .open_stream("/echo", &CallOptions::new())
        .unwrap();

    hanging.close_send();
    assert_eq!(
        hanging.recv_message().await.unwrap_err(),
        ClientError::DeadlineExceeded
    );
    eventually("对端收到 RESET", Duration::from_secs(2), || peer.resets() == 1).await;

    healthy.send_message(Bytes::from_static(b"still here")).await.unwrap();
    healthy.close_send();
    assert_eq!(
        healthy.recv_message().await.unwrap().as_deref(),
        Some(&b"still here"[..])
    );
    healthy.finish().await.unwrap();
    assert!(transport.is_available());
}

#[tokio::test]
async fn cancellation_interrupts_pending_receive() {
    let (transport, _peer) = establish(PeerOptions::default(), &TransportConfig::default()).await;
    let token = Cancellation::new();
    let mut stream = transport
        .open_stream("/hang", &CallOptions::new().with_cancellation(token.clone()))
        .unwrap();
    stream.close_send();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();
    });
    assert_eq!(
        stream.recv_message().await.unwrap_err(),
        ClientError::Cancelled
    );
    assert!(transport.is_available());
}

#[tokio::test]
async fn oversized_method_fails_only_its_own_call() {
    let (transport, peer) = establish(PeerOptions::default(), &TransportConfig::default()).await;
    let mut sibling = transport
        .open_stream("/echo", &CallOptions::new())
        .unwrap();

    let method = format!("/{}", "m".repeat(20 * 1024));
    match transport.open_stream(&method, &CallOptions::new()) {
        Err(err) => assert_eq!(err.code(), "spark.client.call.invalid_argument", "{err}"),
        Ok(stream) => panic!("超长方法名不应打开流 {}", stream.id()),
    }
    assert_eq!(transport.active_streams(), 1, "被拒绝的调用不应占用流编号");

    sibling.send_message(Bytes::from_static(b"unaffected")).await.unwrap();
    sibling.close_send();
    assert_eq!(
        sibling.recv_message().await.unwrap().as_deref(),
        Some(&b"unaffected"[..])
    );
    sibling.finish().await.unwrap();

    assert_eq!(transport.close_reason(), None);
    assert!(transport.is_available());
    assert!(!peer.is_closed());
    assert_eq!(peer.streams_opened(), 1);
}
