use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use protocol::{
    bincode_stream::BincodeCodec,
    control::{ConnectCommand, ControlMessage, RegisterRequest},
    dial_back::write_dial_back_header,
    RendezvousId,
};
use test_log::test;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    task::JoinHandle,
    time::Instant,
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};

use crate::{Bridge, Exchange, ExchangeConfig, ExchangeError, ExchangeService, ServiceSessionId};

struct TestExchange {
    service: Arc<ExchangeService>,
    control: SocketAddr,
    pool: SocketAddr,
    socks5: SocketAddr,
    http_proxy: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<anyhow::Result<()>>,
}

impl TestExchange {
    async fn start(rendezvous_timeout: Duration) -> Self {
        let local: SocketAddr = "127.0.0.1:0".parse().expect("should parse");
        let exchange = Exchange::new(ExchangeConfig {
            control_listener: local,
            pool_listener: local,
            socks5_listener: local,
            http_proxy_listener: Some(local),
            rendezvous_timeout,
            handshake_timeout: Duration::from_secs(1),
            command_channel_size: 8,
        })
        .await
        .expect("should bind");
        let service = exchange.service();
        let control = exchange.control_addr().expect("should have addr");
        let pool = exchange.pool_addr().expect("should have addr");
        let socks5 = exchange.socks5_addr().expect("should have addr");
        let http_proxy = exchange.http_proxy_addr().expect("should have http proxy").expect("should have addr");
        let cancel = CancellationToken::new();
        let task = tokio::spawn(exchange.run(cancel.clone()));
        Self {
            service,
            control,
            pool,
            socks5,
            http_proxy,
            cancel,
            task,
        }
    }

    /// Wait until `name` is served by a session other than `previous`.
    async fn wait_registered(&self, name: &str, previous: Option<ServiceSessionId>) -> ServiceSessionId {
        let deadline = Instant::now() + Duration::from_secs(1);
        loop {
            if let Ok(service) = self.service.get_service(name) {
                if Some(service.session_id()) != previous {
                    return service.session_id();
                }
            }
            assert!(Instant::now() < deadline, "service {name} not registered in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn wait_unregistered(&self, name: &str) {
        let deadline = Instant::now() + Duration::from_secs(1);
        while self.service.get_service(name).is_ok() {
            assert!(Instant::now() < deadline, "service {name} still registered");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn shutdown(self) {
        self.cancel.cancel();
        let res = tokio::time::timeout(Duration::from_secs(2), self.task).await.expect("should stop in time").expect("should join");
        assert!(res.is_ok(), "{res:?}");
    }
}

/// Service side of a control connection, driven by hand.
struct FakeService {
    rx: FramedRead<OwnedReadHalf, BincodeCodec<ControlMessage>>,
    _tx: FramedWrite<OwnedWriteHalf, BincodeCodec<RegisterRequest>>,
}

impl FakeService {
    async fn register(control: SocketAddr, namespace: &str, name: &str) -> Self {
        let stream = TcpStream::connect(control).await.expect("should connect");
        let (read, write) = stream.into_split();
        let mut rx = FramedRead::new(read, BincodeCodec::<ControlMessage>::default());
        let mut tx = FramedWrite::new(write, BincodeCodec::<RegisterRequest>::default());
        tx.send(RegisterRequest {
            namespace: namespace.to_string(),
            service_name: name.to_string(),
        })
        .await
        .expect("should send register");
        assert_eq!(rx.next().await.expect("should have ack").expect("should decode"), ControlMessage::Registered(Ok(())));
        Self { rx, _tx: tx }
    }

    async fn next_command(&mut self) -> ConnectCommand {
        let msg = tokio::time::timeout(Duration::from_secs(1), self.rx.next()).await.expect("should get command in time");
        match msg.expect("should have frame").expect("should decode") {
            ControlMessage::Connect(cmd) => cmd,
            other => panic!("unexpected message {other:?}"),
        }
    }

    async fn dial_back(pool: SocketAddr, id: RendezvousId) -> TcpStream {
        let mut stream = TcpStream::connect(pool).await.expect("should connect pool");
        write_dial_back_header(&mut stream, id).await.expect("should write header");
        stream
    }
}

#[test(tokio::test)]
async fn request_conn_bridges_ping() {
    let exchange = TestExchange::start(Duration::from_secs(2)).await;
    let mut db = FakeService::register(exchange.control, "ns1", "db").await;
    exchange.wait_registered("db", None).await;

    let service = exchange.service.clone();
    let cancel = exchange.cancel.clone();
    let request = tokio::spawn(async move { service.request_conn("db", &cancel).await });

    let cmd = db.next_command().await;
    assert_eq!(cmd.namespace, "ns1");
    assert_eq!(cmd.service_name, "db");
    let mut dialed = FakeService::dial_back(exchange.pool, cmd.id).await;
    let conn = request.await.expect("should join").expect("should get connection");

    let (mut client, downstream) = tokio::io::duplex(1024);
    let cancel = exchange.cancel.clone();
    let bridge = tokio::spawn(async move { Bridge::new(conn, downstream).run(&cancel).await });

    client.write_all(b"PING").await.expect("should write");
    drop(client);
    let mut received = Vec::new();
    dialed.read_to_end(&mut received).await.expect("should read until eof");
    assert_eq!(received, b"PING");
    drop(dialed);

    let (stats, res) = tokio::time::timeout(Duration::from_secs(1), bridge).await.expect("should end").expect("should join");
    assert_eq!(stats.sent, 4);
    assert_eq!(stats.recv, 0);
    assert!(res.is_ok(), "{res:?}");

    exchange.shutdown().await;
}

#[test(tokio::test)]
async fn socks5_client_reaches_service() {
    let exchange = TestExchange::start(Duration::from_secs(2)).await;
    let mut db = FakeService::register(exchange.control, "ns1", "db").await;
    exchange.wait_registered("db", None).await;

    let mut client = TcpStream::connect(exchange.socks5).await.expect("should connect socks5");
    client.write_all(&[0x05, 0x01, 0x00]).await.expect("should write greeting");
    client.write_all(&[0x05, 0x01, 0x00, 0x03, 0x02, b'd', b'b', 0x00, 0x50]).await.expect("should write request");

    let cmd = db.next_command().await;
    let mut dialed = FakeService::dial_back(exchange.pool, cmd.id).await;

    let mut handshake = [0u8; 12];
    client.read_exact(&mut handshake).await.expect("should read handshake");
    assert_eq!(handshake[..2], [0x05, 0x00]);
    assert_eq!(handshake[2..4], [0x05, 0x00]);

    client.write_all(b"PING").await.expect("should write");
    let mut buf = [0u8; 4];
    dialed.read_exact(&mut buf).await.expect("should read");
    assert_eq!(&buf, b"PING");

    dialed.write_all(b"PONG").await.expect("should write");
    client.read_exact(&mut buf).await.expect("should read");
    assert_eq!(&buf, b"PONG");

    exchange.shutdown().await;
}

#[test(tokio::test)]
async fn socks5_unknown_service_is_unreachable() {
    let exchange = TestExchange::start(Duration::from_secs(2)).await;

    let mut client = TcpStream::connect(exchange.socks5).await.expect("should connect socks5");
    client.write_all(&[0x05, 0x01, 0x00]).await.expect("should write greeting");
    client.write_all(&[0x05, 0x01, 0x00, 0x03, 0x04, b'n', b'o', b'p', b'e', 0x00, 0x50]).await.expect("should write request");

    let mut handshake = [0u8; 12];
    client.read_exact(&mut handshake).await.expect("should read handshake");
    assert_eq!(handshake[2..4], [0x05, 0x04]);

    exchange.shutdown().await;
}

#[test(tokio::test)]
async fn http_connect_client_reaches_service() {
    let exchange = TestExchange::start(Duration::from_secs(2)).await;
    let mut db = FakeService::register(exchange.control, "ns1", "db").await;
    exchange.wait_registered("db", None).await;

    let mut client = TcpStream::connect(exchange.http_proxy).await.expect("should connect http proxy");
    // payload in the same write as the head must not be lost
    client.write_all(b"CONNECT db:5432 HTTP/1.1\r\nHost: db:5432\r\n\r\nPING").await.expect("should write request");

    let cmd = db.next_command().await;
    let mut dialed = FakeService::dial_back(exchange.pool, cmd.id).await;

    let established = b"HTTP/1.1 200 Connection Established\r\n\r\n";
    let mut response = vec![0u8; established.len()];
    client.read_exact(&mut response).await.expect("should read response");
    assert_eq!(response, established);

    let mut buf = [0u8; 4];
    dialed.read_exact(&mut buf).await.expect("should read");
    assert_eq!(&buf, b"PING");
    dialed.write_all(b"PONG").await.expect("should write");
    client.read_exact(&mut buf).await.expect("should read");
    assert_eq!(&buf, b"PONG");

    exchange.shutdown().await;
}

#[test(tokio::test)]
async fn http_connect_unknown_service_is_not_found() {
    let exchange = TestExchange::start(Duration::from_secs(2)).await;

    let mut client = TcpStream::connect(exchange.http_proxy).await.expect("should connect http proxy");
    client.write_all(b"CONNECT nope:80 HTTP/1.1\r\nHost: nope:80\r\n\r\n").await.expect("should write request");

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(1), client.read_to_end(&mut response))
        .await
        .expect("should answer in time")
        .expect("should read response");
    assert!(response.starts_with(b"HTTP/1.1 404"), "{}", String::from_utf8_lossy(&response));

    exchange.shutdown().await;
}

#[test(tokio::test)]
async fn unknown_service_fails_fast() {
    let exchange = TestExchange::start(Duration::from_secs(10)).await;

    let res = tokio::time::timeout(Duration::from_millis(200), exchange.service.request_conn("nope", &exchange.cancel))
        .await
        .expect("should not wait");
    assert_eq!(res.err(), Some(ExchangeError::ServiceNotFound("nope".to_string())));

    exchange.shutdown().await;
}

#[test(tokio::test)]
async fn rendezvous_timeout_evicts_request() {
    let exchange = TestExchange::start(Duration::from_millis(200)).await;
    let mut db = FakeService::register(exchange.control, "ns1", "db").await;
    exchange.wait_registered("db", None).await;

    let service = exchange.service.clone();
    let cancel = exchange.cancel.clone();
    let request = tokio::spawn(async move { service.request_conn("db", &cancel).await });

    let cmd = db.next_command().await;
    let res = request.await.expect("should join");
    assert_eq!(res.err(), Some(ExchangeError::Timeout(cmd.id)));
    assert_eq!(exchange.service.pooler().reject(cmd.id, ExchangeError::Cancelled), Err(ExchangeError::ConnReqNotFound(cmd.id)));

    let mut late = FakeService::dial_back(exchange.pool, cmd.id).await;
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(1), late.read(&mut buf)).await.expect("late dial-back should be closed");
    assert!(matches!(read, Ok(0) | Err(_)));

    exchange.shutdown().await;
}

#[test(tokio::test)]
async fn re_register_routes_to_latest() {
    let exchange = TestExchange::start(Duration::from_secs(2)).await;
    let mut first = FakeService::register(exchange.control, "ns1", "db").await;
    let first_session = exchange.wait_registered("db", None).await;
    let mut second = FakeService::register(exchange.control, "ns1", "db").await;
    let second_session = exchange.wait_registered("db", Some(first_session)).await;
    assert_eq!(exchange.service.service_count(), 1);

    let service = exchange.service.clone();
    let cancel = exchange.cancel.clone();
    let request = tokio::spawn(async move { service.request_conn("db", &cancel).await });

    let cmd = second.next_command().await;
    assert!(tokio::time::timeout(Duration::from_millis(100), first.rx.next()).await.is_err());
    let _dialed = FakeService::dial_back(exchange.pool, cmd.id).await;
    assert!(request.await.expect("should join").is_ok());

    drop(first);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(exchange.service.get_service("db").expect("should keep replacement").session_id(), second_session);

    drop(second);
    exchange.wait_unregistered("db").await;

    exchange.shutdown().await;
}

#[test(tokio::test)]
async fn disconnect_removes_and_unblocks() {
    let exchange = TestExchange::start(Duration::from_secs(5)).await;
    let mut db = FakeService::register(exchange.control, "ns1", "db").await;
    exchange.wait_registered("db", None).await;

    let service = exchange.service.clone();
    let cancel = exchange.cancel.clone();
    let request = tokio::spawn(async move { service.request_conn("db", &cancel).await });
    db.next_command().await;
    drop(db);

    let res = tokio::time::timeout(Duration::from_secs(1), request).await.expect("should be unblocked").expect("should join");
    assert_eq!(res.err(), Some(ExchangeError::ServiceGone("db".to_string())));
    exchange.wait_unregistered("db").await;
    assert_eq!(
        exchange.service.request_conn("db", &exchange.cancel).await.err(),
        Some(ExchangeError::ServiceNotFound("db".to_string()))
    );

    exchange.shutdown().await;
}

#[test(tokio::test)]
async fn mismatched_command_is_rejected() {
    let exchange = TestExchange::start(Duration::from_secs(2)).await;
    let _db = FakeService::register(exchange.control, "ns1", "db").await;
    exchange.wait_registered("db", None).await;

    let service = exchange.service.get_service("db").expect("should find");
    let pending = exchange.service.pooler().wait_for_conn();
    service
        .command_tx()
        .send(ConnectCommand {
            namespace: "ns1".to_string(),
            service_name: "cache".to_string(),
            id: pending.id(),
        })
        .await
        .expect("should queue");

    let res = pending.wait(Instant::now() + Duration::from_secs(1), &exchange.cancel).await;
    assert_eq!(
        res.err(),
        Some(ExchangeError::Mismatch {
            expected: "db".to_string(),
            got: "cache".to_string()
        })
    );
    assert!(exchange.service.get_service("db").is_ok());

    exchange.shutdown().await;
}

#[test(tokio::test)]
async fn shutdown_cancels_waiting_requests() {
    let exchange = TestExchange::start(Duration::from_secs(10)).await;
    let mut db = FakeService::register(exchange.control, "ns1", "db").await;
    exchange.wait_registered("db", None).await;

    let service = exchange.service.clone();
    let cancel = exchange.cancel.clone();
    let request = tokio::spawn(async move { service.request_conn("db", &cancel).await });
    db.next_command().await;

    exchange.cancel.cancel();
    let res = tokio::time::timeout(Duration::from_secs(1), request).await.expect("should be unblocked").expect("should join");
    assert!(matches!(res, Err(ExchangeError::Cancelled) | Err(ExchangeError::ServiceGone(_))), "{res:?}");

    exchange.shutdown().await;
}
