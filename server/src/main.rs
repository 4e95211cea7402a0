use clap::Parser;
use env_logger::Env;
use log::{error, info};
use server::config::{ServerConfig, Timing};
use server::hub::Hub;
use server::lexicon::WordList;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Dictionary file, one word per line
    #[arg(short, long, default_value = "words_alpha.txt")]
    words: PathBuf,

    /// Length of one countdown step in milliseconds
    #[arg(long, default_value = "1000")]
    tick_ms: u64,

    /// How many times to look for a disconnected player before removing them
    #[arg(long, default_value = "10")]
    reconnect_retries: u32,

    /// Pause between reconnect checks in milliseconds
    #[arg(long, default_value = "1000")]
    reconnect_interval_ms: u64,

    /// Seconds a created session waits for its first player before it is dropped
    #[arg(long, default_value = "120")]
    join_deadline_secs: u64,

    /// Messages queued per client before new ones are dropped
    #[arg(long, default_value = "64")]
    outbound_buffer: usize,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        let defaults = ServerConfig::default();
        ServerConfig {
            address: format!("{}:{}", self.host, self.port),
            words_path: self.words,
            outbound_buffer: self.outbound_buffer.max(1),
            timing: Timing {
                unit: Duration::from_millis(self.tick_ms.max(1)),
                reconnect_interval: Duration::from_millis(self.reconnect_interval_ms.max(1)),
                reconnect_retries: self.reconnect_retries,
                join_deadline: Duration::from_secs(self.join_deadline_secs),
                ..Timing::default()
            },
            ..defaults
        }
    }
}

/// Main-method of the application.
/// Parses command-line arguments, loads the dictionary and serves until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config();

    let words = WordList::load_or_empty(&config.words_path);

    let listener = tokio::net::TcpListener::bind(&config.address).await?;
    let hub = Hub::new(config, Arc::new(words));

    let server_handle = tokio::spawn(server::network::serve(listener, hub));

    // Handle shutdown gracefully
    tokio::select! {
        result = server_handle => {
            match result {
                Ok(Err(e)) => error!("Server stopped: {}", e),
                Err(e) => error!("Server task panicked: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    Ok(())
}
