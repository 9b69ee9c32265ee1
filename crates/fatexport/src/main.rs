//! `fatexportd`: exports a FAT32 volume image as a 9P2000.u filesystem
//! server over TCP.

mod fatdriver;

use clap::Parser;
use fatdriver::FatDriver;
use ninep::server::Server;
use ninep::session::SessionLimits;
use ninep::storage::StorageGateway;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, clap::Parser)]
#[command(about = "9P2000.u server exporting a FAT32 volume image over TCP")]
struct Cli {
    /// Address to listen on, e.g. 0.0.0.0:564
    #[arg(long, default_value = "0.0.0.0:564")]
    address: String,

    /// Path to a FAT32 volume image file
    image: PathBuf,

    /// Maximum concurrent sessions (fixed session-slot pool size)
    #[arg(long, default_value_t = 3)]
    sessions: usize,

    /// Maximum fids per session
    #[arg(long, default_value_t = 64)]
    fids: usize,

    /// Negotiated maximum message size ceiling, in bytes
    #[arg(long, default_value_t = 8192)]
    msize: u32,

    /// Storage lock acquisition timeout, in seconds
    #[arg(long, default_value_t = 5)]
    storage_timeout: u64,

    /// TCP send-window timeout, in seconds
    #[arg(long, default_value_t = 5)]
    send_timeout: u64,
}

async fn run(cli: Cli) -> ninep::Result<i32> {
    if !cli.image.exists() {
        return ninep::res!(ninep::io_err!(
            NotFound,
            format!("volume image not found: {}", cli.image.display())
        ));
    }

    let driver = FatDriver::open_image(&cli.image)?;
    let gateway = StorageGateway::new(Box::new(driver), Duration::from_secs(cli.storage_timeout));
    let limits = SessionLimits {
        max_msize: cli.msize.clamp(256, 65536),
        max_fids: cli.fids,
        send_timeout: Duration::from_secs(cli.send_timeout),
    };

    log::info!(
        "exporting {} on {} (sessions={}, fids={}, msize={})",
        cli.image.display(),
        cli.address,
        cli.sessions,
        limits.max_fids,
        limits.max_msize
    );

    let mut server = Server::bind(&cli.address, gateway, limits, cli.sessions).await?;
    server.serve().await?;
    Ok(0)
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::init();

    let exit_code = run(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        -1
    });

    std::process::exit(exit_code);
}
