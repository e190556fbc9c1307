use std::{error::Error, net::SocketAddr, num::NonZeroUsize, sync::Arc};

use blockwire::{
    MemoryEngine, ServerConfig, Settings,
    protocol::{Server, transport::MAX_FRAME_SIZE},
};
use clap::Parser;
use log::info;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct ServerArgs {
    /// Listen for new connections at address
    #[arg(default_value = "127.0.0.1:9000")]
    address: SocketAddr,
    /// Connection worker threads
    #[arg(long, default_value = "16")]
    workers: NonZeroUsize,
    /// Engine worker threads shared by all queries
    #[arg(long, default_value = "4")]
    engine_workers: NonZeroUsize,
    #[arg(long, default_value = "65536")]
    max_block_size: NonZeroUsize,
    #[arg(long, default_value_t = 2)]
    max_threads: usize,
    #[arg(long, default_value_t = 100)]
    cancel_check_interval_ms: u64,
    #[arg(long, default_value_t = 100)]
    progress_interval_ms: u64,
    /// Largest accepted packet, in bytes
    #[arg(long, default_value_t = MAX_FRAME_SIZE)]
    max_frame_size: usize,
}

impl ServerArgs {
    fn config(&self) -> ServerConfig {
        ServerConfig {
            workers: self.workers.get(),
            max_frame_size: self.max_frame_size,
            default_settings: Settings {
                max_block_size: self.max_block_size.get(),
                max_threads: self.max_threads.max(1),
                cancel_check_interval_ms: self.cancel_check_interval_ms,
                progress_interval_ms: self.progress_interval_ms,
                ..Settings::default()
            },
            ..ServerConfig::default()
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args = ServerArgs::parse();
    let engine = Arc::new(MemoryEngine::new(args.engine_workers.get()));
    let server = Server::bind(args.address, args.config(), engine)?;

    let handle = server.shutdown_handle()?;
    ctrlc::set_handler(move || {
        info!("received interrupt");
        handle.shutdown();
    })?;

    server.listen()?;
    Ok(())
}
