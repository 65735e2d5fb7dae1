
use std::time::Duration;

use harness::{
    free_port, is_closed_by_peer, roundtrip, rule_to, MapperHandle, MarkerBackend, SinkBackend,
    TcpEchoBackend, LOOPBACK, TEST_TIMEOUT,
};
use portmap_rules::ProxyRule;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

async fn read_marker(addr: std::net::SocketAddr) -> std::io::Result<String> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(b"whoami").await?;
    let mut received = Vec::new();
    timeout(TEST_TIMEOUT, stream.read_to_end(&mut received))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "read timeout"))??;
    Ok(String::from_utf8_lossy(&received).to_string())
}

#[tokio::test]
async fn each_port_forwards_to_its_own_remote() {
    let backend_a = MarkerBackend::spawn("A").await.unwrap();
    let backend_b = MarkerBackend::spawn("B").await.unwrap();

    let mapper = MapperHandle::spawn(vec![
        rule_to(backend_a.addr).await,
        rule_to(backend_b.addr).await,
    ])
    .await
    .unwrap();
    assert_eq!(mapper.addrs.len(), 2);
    assert_eq!(mapper.skipped, 0);

    for _ in 0..3 {
        assert_eq!(read_marker(mapper.addrs[0]).await.unwrap(), "A");
        assert_eq!(read_marker(mapper.addrs[1]).await.unwrap(), "B");
    }

    assert_eq!(backend_a.connection_count(), 3);
    assert_eq!(backend_b.connection_count(), 3);

    mapper.stop().await.unwrap();
}

#[tokio::test]
async fn conflicting_port_only_drops_that_rule() {
    let backend = MarkerBackend::spawn("ok").await.unwrap();
    let squatter = TcpListener::bind((LOOPBACK, 0)).await.unwrap();
    let taken_port = squatter.local_addr().unwrap().port();

    let mapper = MapperHandle::spawn(vec![
        rule_to(backend.addr).await,
        ProxyRule::new(taken_port, "127.0.0.1", backend.addr.port()).unwrap(),
        rule_to(backend.addr).await,
    ])
    .await
    .unwrap();

    assert_eq!(mapper.addrs.len(), 2);
    assert_eq!(mapper.skipped, 1);
    assert!(mapper.addrs.iter().all(|a| a.port() != taken_port));

    assert_eq!(read_marker(mapper.addrs[1]).await.unwrap(), "ok");
    mapper.stop().await.unwrap();
}

#[tokio::test]
async fn all_ports_taken_fails_construction() {
    let squatter = TcpListener::bind((LOOPBACK, 0)).await.unwrap();
    let taken_port = squatter.local_addr().unwrap().port();

    let result =
        MapperHandle::spawn(vec![ProxyRule::new(taken_port, "127.0.0.1", 9).unwrap()]).await;
    assert!(matches!(
        result,
        Err(portmap_mapper::DispatchError::NoListeners)
    ));
}

#[tokio::test]
async fn large_transfers_are_byte_exact_both_ways() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let mapper = MapperHandle::spawn(vec![rule_to(backend.addr).await])
        .await
        .unwrap();

    let payload: Vec<u8> = (0..4 * 1024 * 1024u32)
        .map(|i| (i.wrapping_mul(2_654_435_761) >> 24) as u8)
        .collect();

    let stream = TcpStream::connect(mapper.addrs[0]).await.unwrap();
    let (mut read, mut write) = stream.into_split();

    let to_send = payload.clone();
    let writer = tokio::spawn(async move {
        for chunk in to_send.chunks(7919) {
            write.write_all(chunk).await.unwrap();
        }
        write
    });

    let mut echoed = vec![0u8; payload.len()];
    timeout(Duration::from_secs(30), read.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();
    let _write = writer.await.unwrap();

    assert!(echoed == payload, "echoed bytes differ from sent bytes");
    mapper.stop().await.unwrap();
}

#[tokio::test]
async fn client_close_closes_remote() {
    let mut backend = SinkBackend::spawn().await.unwrap();
    let mapper = MapperHandle::spawn(vec![rule_to(backend.addr).await])
        .await
        .unwrap();

    let mut stream = TcpStream::connect(mapper.addrs[0]).await.unwrap();
    stream.write_all(b"last words").await.unwrap();
    drop(stream);

    let received = backend.next_closed().await.expect("remote leg was not closed");
    assert_eq!(received, b"last words");

    assert!(
        mapper
            .wait_for(|m| m.pool.active() == 0)
            .await,
        "relay did not finish"
    );
    mapper.stop().await.unwrap();
}

#[tokio::test]
async fn remote_close_closes_client() {
    let upstream = TcpListener::bind((LOOPBACK, 0)).await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    let mapper = MapperHandle::spawn(vec![rule_to(upstream_addr).await])
        .await
        .unwrap();

    let mut client = TcpStream::connect(mapper.addrs[0]).await.unwrap();
    let (mut remote, _) = timeout(TEST_TIMEOUT, upstream.accept())
        .await
        .unwrap()
        .unwrap();

    remote.write_all(b"hello").await.unwrap();
    let mut greeting = [0u8; 5];
    client.read_exact(&mut greeting).await.unwrap();
    assert_eq!(&greeting, b"hello");

    drop(remote);
    assert!(is_closed_by_peer(&mut client).await);
    mapper.stop().await.unwrap();
}

#[tokio::test]
async fn unreachable_remote_closes_client() {
    let dead_port = free_port().await;
    let mapper = MapperHandle::spawn(vec![
        ProxyRule::new(free_port().await, "127.0.0.1", dead_port).unwrap(),
    ])
    .await
    .unwrap();

    let mut client = TcpStream::connect(mapper.addrs[0]).await.unwrap();
    assert!(is_closed_by_peer(&mut client).await);

    assert!(
        mapper
            .wait_for(|m| m
                .stats
                .relays_failed
                .load(std::sync::atomic::Ordering::Relaxed)
                == 1)
            .await
    );
    mapper.stop().await.unwrap();
}

#[tokio::test]
async fn failing_relay_does_not_disturb_others() {
    let echo = TcpEchoBackend::spawn().await.unwrap();

    // Accepts, waits for data, then drops the socket unread so the relay's
    // remote leg is reset.
    let resetting = TcpListener::bind((LOOPBACK, 0)).await.unwrap();
    let resetting_addr = resetting.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = resetting.accept().await {
            tokio::spawn(async move {
                let _ = stream.readable().await;
                tokio::time::sleep(Duration::from_millis(20)).await;
                drop(stream);
            });
        }
    });

    let mapper = MapperHandle::spawn(vec![
        rule_to(echo.addr).await,
        rule_to(resetting_addr).await,
    ])
    .await
    .unwrap();

    let mut healthy = TcpStream::connect(mapper.addrs[0]).await.unwrap();
    assert_eq!(roundtrip(&mut healthy, b"before").await.unwrap(), b"before");

    let mut doomed = TcpStream::connect(mapper.addrs[1]).await.unwrap();
    doomed.write_all(b"this will be reset").await.unwrap();
    assert!(is_closed_by_peer(&mut doomed).await);

    assert_eq!(roundtrip(&mut healthy, b"after").await.unwrap(), b"after");
    let big = vec![0x5a; 64 * 1024];
    assert_eq!(roundtrip(&mut healthy, &big).await.unwrap(), big);

    mapper.stop().await.unwrap();
}

#[tokio::test]
async fn stop_is_idempotent_and_releases_ports() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let mapper = MapperHandle::spawn(vec![rule_to(backend.addr).await])
        .await
        .unwrap();
    let addr = mapper.addrs[0];

    let extra_stop = mapper.stop_handle();
    extra_stop.stop();
    mapper.stop().await.unwrap();
    extra_stop.stop();

    assert!(TcpStream::connect(addr).await.is_err());
    TcpListener::bind(addr).await.unwrap();
}

#[tokio::test]
async fn running_relays_survive_dispatcher_stop() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let mapper = MapperHandle::spawn(vec![rule_to(backend.addr).await])
        .await
        .unwrap();

    let mut stream = TcpStream::connect(mapper.addrs[0]).await.unwrap();
    assert_eq!(roundtrip(&mut stream, b"ping").await.unwrap(), b"ping");

    let pool = mapper.pool.clone();
    mapper.stop().await.unwrap();
    assert!(pool.is_shut_down());

    assert_eq!(roundtrip(&mut stream, b"still here").await.unwrap(), b"still here");
    drop(stream);
    assert!(pool.drain(TEST_TIMEOUT).await);
}
