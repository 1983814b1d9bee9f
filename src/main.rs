use std::net::{IpAddr, SocketAddr};
use std::process;
use std::time::Duration;

use clap::Parser;
use futures::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, WriteHalf};
use futures::StreamExt;
use log::{debug, error, info, LevelFilter};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::compat::TokioAsyncReadCompatExt;

use tete::error::*;
use tete::pair::{PairConfig, SocketPair};
use tete::role;
use tete::session::{self, TlsStream, Verify};

const KEEPALIVE_PERIOD: Duration = Duration::from_secs(10);

/// Direct, encrypted TCP sessions between two NAT'd peers, no
/// rendezvous server required. Run it on both ends at roughly the same
/// time; stdin goes to the peer, the peer's lines come out on stdout.
#[derive(Parser)]
#[command(name = "tete")]
struct Args {
    /// Your public IPv4/IPv6 address
    #[arg(long)]
    myip: IpAddr,

    /// Peer's public IPv4/IPv6 address
    #[arg(long)]
    peerip: IpAddr,

    /// Local port you're listening on
    #[arg(long, default_value_t = 54312, value_parser = clap::value_parser!(u16).range(1..))]
    lport: u16,

    /// Remote port the peer's listening on
    #[arg(long, default_value_t = 54312, value_parser = clap::value_parser!(u16).range(1..))]
    rport: u16,

    /// Enable TCP keepalives
    #[arg(short = 'k')]
    keepalive: bool,

    /// Increase logging verbosity
    #[arg(short = 'v')]
    verbose: bool,
}

fn main() {
    let args = Args::parse();

    let level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Error
    };
    env_logger::Builder::new().filter_level(level).init();

    if let Err(e) = run(args) {
        error!("{}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    validate(&args)?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("tete-worker")
        .enable_all()
        .build()
        .wrapped(ErrorKind::Runtime)?;

    let res = rt.block_on(chat(args));

    // a pending blocking read on stdin must not hold shutdown hostage
    rt.shutdown_background();
    res
}

fn validate(args: &Args) -> Result<()> {
    if args.myip == args.peerip {
        return Err(Error::wrapped(
            ErrorKind::InvalidInput,
            "cannot have the same IP address as the peer",
        ));
    }
    if args.myip.is_ipv4() != args.peerip.is_ipv4() {
        return Err(Error::wrapped(
            ErrorKind::InvalidInput,
            "both addresses must belong to the same family",
        ));
    }
    Ok(())
}

async fn chat(args: Args) -> Result<()> {
    let client = role::is_client(args.myip, args.peerip);
    debug!(
        "taking the TLS {} role",
        if client { "client" } else { "server" }
    );

    let pair = SocketPair::new(PairConfig {
        local_port: args.lport,
        peer: SocketAddr::new(args.peerip, args.rport),
    })?;
    let sock = pair.establish().await?;

    if args.keepalive {
        sock.set_keepalive(KEEPALIVE_PERIOD)
            .wrapped(ErrorKind::SocketSetup)?;
    }

    let session = session::secure(sock, client, Verify::AnyPeer).await?;
    info!("Connected to peer!");

    let (r, mut w) = session.split();
    let mut peer_lines = BufReader::new(r).lines();
    let mut stdin_lines = BufReader::new(tokio::io::stdin().compat()).lines();
    let mut stdin_open = true;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut sigterm = signal(SignalKind::terminate()).wrapped(ErrorKind::Runtime)?;

    loop {
        tokio::select! {
            line = peer_lines.next() => match line {
                Some(line) => {
                    let line = line.wrapped(ErrorKind::Session)?;
                    println!("Message from peer: {}", line);
                }
                None => {
                    info!("Peer closed connection");
                    break;
                }
            },
            line = stdin_lines.next(), if stdin_open => match line {
                Some(line) => {
                    let line = line.wrapped(ErrorKind::Session)?;
                    send_line(&mut w, &line).await?;
                }
                None => {
                    // local input is done; close_notify tells the peer
                    stdin_open = false;
                    w.close().await.wrapped(ErrorKind::Session)?;
                }
            },
            _ = &mut ctrl_c => {
                w.close().await.unwrap_or(());
                info!("Closed connection");
                break;
            }
            _ = sigterm.recv() => {
                w.close().await.unwrap_or(());
                info!("Closed connection");
                break;
            }
        }
    }

    Ok(())
}

async fn send_line(w: &mut WriteHalf<TlsStream>, line: &str) -> Result<()> {
    let mut buf = String::with_capacity(line.len() + 1);
    buf.push_str(line);
    buf.push('\n');

    let n = w.write(buf.as_bytes()).await.wrapped(ErrorKind::Session)?;
    if n != buf.len() {
        return Err(Error::wrapped(
            ErrorKind::Session,
            "failed to write entire message",
        ));
    }
    w.flush().await.wrapped(ErrorKind::Session)
}
