//! End-to-end punching runs over loopback: two engines race each
//! other, arbitrate TLS roles, and pass bytes through the session.

use std::time::Duration;

use tete::cert;
use tete::pair::{PairConfig, SocketPair};
use tete::role;
use tete::session::{self, Verify};
use tete::socket::Socket;

fn free_port() -> u16 {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    probe.local_addr().unwrap().port()
}

async fn punched_pair() -> (Socket, Socket) {
    let (pa, pb) = (free_port(), free_port());

    let a = SocketPair::new(PairConfig {
        local_port: pa,
        peer: format!("127.0.0.1:{}", pb).parse().unwrap(),
    })
    .unwrap();
    let b = SocketPair::new(PairConfig {
        local_port: pb,
        peer: format!("127.0.0.1:{}", pa).parse().unwrap(),
    })
    .unwrap();

    let (sa, sb) = tokio::join!(a.establish(), b.establish());
    (sa.unwrap(), sb.unwrap())
}

#[tokio::test(flavor = "multi_thread")]
async fn punch_handshake_and_chat() {
    let (sa, sb) = punched_pair().await;

    // the greater public address drives the handshake as client
    let a_is_client = role::is_client(
        "127.0.0.2".parse().unwrap(),
        "127.0.0.3".parse().unwrap(),
    );
    assert!(!a_is_client);

    let (a, b) = tokio::join!(
        session::secure(sa, a_is_client, Verify::AnyPeer),
        session::secure(sb, !a_is_client, Verify::AnyPeer),
    );
    let (mut a, mut b) = (a.unwrap(), b.unwrap());

    let mut buf = [0; 32];

    b.write(b"hello\n").await.unwrap();
    let n = a.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"hello\n");

    a.write(b"hi there\n").await.unwrap();
    let n = b.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"hi there\n");

    // clean teardown: close_notify surfaces as EOF on the other end
    b.close().await.unwrap();
    let n = a.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn read_timeout_bounds_a_quiet_peer() {
    let (sa, sb) = punched_pair().await;

    let (a, b) = tokio::join!(
        session::secure(sa, false, Verify::AnyPeer),
        session::secure(sb, true, Verify::AnyPeer),
    );
    let (mut a, _b) = (a.unwrap(), b.unwrap());

    a.set_read_timeout(Some(Duration::from_millis(100)));

    let mut buf = [0; 8];
    let err = a.read(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), tete::error::ErrorKind::Session);
}

#[tokio::test(flavor = "multi_thread")]
async fn pinned_client_rejects_an_unknown_identity() {
    let (sa, sb) = punched_pair().await;

    // pin a certificate the server does not hold
    let unrelated = cert::generate().unwrap();

    let (srv, cli) = tokio::join!(
        session::secure(sa, false, Verify::AnyPeer),
        session::secure(sb, true, Verify::PinnedCert(unrelated.der)),
    );
    assert!(cli.is_err());
    drop(srv);
}

#[tokio::test(flavor = "multi_thread")]
async fn stray_connections_are_never_promoted() {
    let lport = free_port();

    // the configured peer never shows up...
    let pair = SocketPair::new(PairConfig {
        local_port: lport,
        peer: "127.0.0.9:1".parse().unwrap(),
    })
    .unwrap();
    let racing = tokio::spawn(pair.establish());

    // ...but an unrelated local client does
    tokio::time::sleep(Duration::from_millis(300)).await;
    let stray = tokio::net::TcpStream::connect(("127.0.0.1", lport))
        .await
        .unwrap();

    // the stray is discarded and the engine runs out of budget instead
    // of handing it to the caller
    let err = racing.await.unwrap().unwrap_err();
    assert!(matches!(
        err.kind(),
        tete::error::ErrorKind::ConnectExhausted | tete::error::ErrorKind::AcceptExhausted
    ));
    drop(stray);
}
