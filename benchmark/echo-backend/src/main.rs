//! Raw TCP echo backend for gatewayd benchmarks.
//!
//! Writes every received byte straight back on the same connection, the
//! simplest possible stand-in for a stateful upstream when exercising the
//! gateway by hand:
//!
//! ```text
//! echo-backend --addr 127.0.0.1:5432 &
//! gatewayd run --config gatewayd.yaml
//! ```

use clap::Parser;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(name = "echo-backend", about = "Raw TCP echo backend")]
struct Cli {
    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:5432")]
    addr: SocketAddr,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let threads = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads)
        .enable_all()
        .build()?
        .block_on(run(cli.addr))
}

async fn run(addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    eprintln!("[echo-backend] listening on {addr}");

    loop {
        let (mut stream, _) = listener.accept().await?;
        tokio::task::spawn(async move {
            let _ = stream.set_nodelay(true);
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }
}
