//! End-to-end exercises of the public API: connect, exchange, pool reuse.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use towline::address::Address;
use towline::call::{Options, Transmitter};
use towline::codec::{Codec, CodecFactory};
use towline::conn::Connection;
use towline::dns::{Dns, StaticDns};
use towline::error::{ConnectError, Error};
use towline::events::NoEvents;
use towline::pool::{Pool, PoolConfig};

#[derive(Debug)]
struct NoopCodec;

impl Codec for NoopCodec {
    fn cancel(&self) {}
}

#[derive(Debug)]
struct NoopFactory;

impl CodecFactory for NoopFactory {
    fn bind(&self, _connection: &Arc<Connection>) -> Arc<dyn Codec> {
        Arc::new(NoopCodec)
    }
}

async fn server() -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut sockets = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            sockets.push(socket);
        }
    });
    addr
}

fn address_for(host: &str, port: u16) -> Arc<Address> {
    let dns: Arc<dyn Dns> =
        Arc::new(StaticDns::new().with(host, [IpAddr::V4(Ipv4Addr::LOCALHOST)]));
    Arc::new(Address::new(host, port).with_dns(dns))
}

fn transmitter(pool: &Pool) -> Transmitter {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    Transmitter::new(pool.clone(), Options::default(), Arc::new(NoEvents))
}

#[tokio::test]
async fn a_full_call_round_trip_pools_the_connection() {
    let addr = server().await;
    let pool = Pool::new(PoolConfig::default());
    let address = address_for("origin.example", addr.port());

    let tx = transmitter(&pool);
    tx.prepare(address.clone());
    let exchange = tx.new_exchange(&NoopFactory, true).await.unwrap();
    let first = exchange.connection().id();

    // Bodies move through the framing wrappers; the wire itself belongs to
    // the codec, so a local pipe stands in for it here.
    let (request_sink, mut request_wire) = tokio::io::duplex(1024);
    let mut request = exchange.request_body(request_sink, Some(4));
    request.write_all(b"ping").await.unwrap();
    request.shutdown().await.unwrap();

    let mut echoed = [0u8; 4];
    request_wire.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");

    let (response_source, mut response_wire) = tokio::io::duplex(1024);
    response_wire.write_all(b"pong").await.unwrap();
    let mut response = exchange.response_body(response_source, Some(4));
    let mut body = [0u8; 4];
    response.read_exact(&mut body).await.unwrap();
    assert_eq!(&body, b"pong");

    assert!(tx.no_more_exchanges(None).is_none());
    assert_eq!(pool.idle_count(), 1);

    // The next call reuses the pooled connection.
    let tx = transmitter(&pool);
    tx.prepare(address);
    let exchange = tx.new_exchange(&NoopFactory, true).await.unwrap();
    assert_eq!(exchange.connection().id(), first);
    assert_eq!(pool.connection_count(), 1);
}

#[tokio::test]
async fn distinct_origins_get_distinct_connections() {
    let addr = server().await;
    let pool = Pool::new(PoolConfig::default());

    let tx1 = transmitter(&pool);
    tx1.prepare(address_for("one.example", addr.port()));
    let e1 = tx1.new_exchange(&NoopFactory, true).await.unwrap();

    let tx2 = transmitter(&pool);
    tx2.prepare(address_for("two.example", addr.port()));
    let e2 = tx2.new_exchange(&NoopFactory, true).await.unwrap();

    assert_ne!(e1.connection().id(), e2.connection().id());
    assert_eq!(pool.connection_count(), 2);
}

#[tokio::test]
async fn evict_all_closes_idle_connections() {
    let addr = server().await;
    let pool = Pool::new(PoolConfig::default());
    let tx = transmitter(&pool);
    tx.prepare(address_for("origin.example", addr.port()));

    let exchange = tx.new_exchange(&NoopFactory, true).await.unwrap();
    exchange.no_request_body();
    let mut response = exchange.response_body(tokio::io::empty(), None);
    let mut sink = Vec::new();
    response.read_to_end(&mut sink).await.unwrap();
    assert!(tx.no_more_exchanges(None).is_none());
    assert_eq!(pool.idle_count(), 1);

    pool.evict_all();
    assert_eq!(pool.connection_count(), 0);
}

#[tokio::test]
async fn a_canceled_call_never_dials() {
    let pool = Pool::new(PoolConfig::default());
    let tx = transmitter(&pool);
    tx.prepare(address_for("origin.example", 80));
    tx.cancel();

    let error = tx.new_exchange(&NoopFactory, true).await.unwrap_err();
    assert!(matches!(error, Error::Canceled));
    assert_eq!(pool.connection_count(), 0);
}

#[tokio::test]
async fn unresolvable_hosts_report_every_attempt() {
    let pool = Pool::new(PoolConfig::default());
    let dns: Arc<dyn Dns> = Arc::new(StaticDns::new());
    let address = Arc::new(Address::new("missing.example", 80).with_dns(dns));

    let tx = transmitter(&pool);
    tx.prepare(address);
    match tx.new_exchange(&NoopFactory, true).await.unwrap_err() {
        Error::Route(route_error) => {
            assert!(matches!(route_error.first(), ConnectError::Dns { .. }));
        }
        other => panic!("expected a route error, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn the_call_timeout_outranks_the_connect_timeout() {
    let pool = Pool::new(PoolConfig::default());
    let dns: Arc<dyn Dns> = Arc::new(
        StaticDns::new().with("slow.example", [IpAddr::V4(Ipv4Addr::new(10, 255, 255, 1))]),
    );
    let address = Arc::new(Address::new("slow.example", 81).with_dns(dns));

    let tx = Transmitter::new(
        pool.clone(),
        Options {
            call_timeout: Some(Duration::from_millis(200)),
            ..Options::default()
        },
        Arc::new(NoEvents),
    );
    tx.prepare(address);

    let error = tx.new_exchange(&NoopFactory, true).await.unwrap_err();
    assert!(error.is_timeout());
}
