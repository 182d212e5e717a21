// CLI entry point for the driftsync sync server.
//
// Starts a standalone service that game clients connect to for lobbies,
// state replication, accounts, documents, and leaderboards. See `server.rs`
// for the networking architecture and `hub.rs` for the state model.
//
// Usage:
//   syncd [OPTIONS]
//     --port <PORT>             Listen port (default: 8877)
//     --api-key <KEY>           Require clients to present this key
//     --data-dir <DIR>          Persist accounts/scores under this directory
//     --require-verification    New accounts must verify before logging in
//     --leaderboard <NAME>      Declare a leaderboard (repeatable)
//     --data-cap <BYTES>        Cumulative api request byte budget
//     --request-interval-ms <N> Minimum ms between api requests per client

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use driftsync_server::{ServerConfig, start_server};

fn main() {
    env_logger::init();
    let config = parse_args();

    let (handle, addr) = match start_server(config) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("Failed to start sync server: {e}");
            std::process::exit(1);
        }
    };

    println!("Sync server listening on {addr}");
    println!("Press Ctrl+C to stop.");

    // Wait for Ctrl+C.
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    ctrlc_wait(running_clone);

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    println!("\nShutting down...");
    handle.stop();
}

/// Parse command-line arguments into a `ServerConfig`. Uses simple
/// `std::env::args()` matching — no clap dependency.
fn parse_args() -> ServerConfig {
    let mut config = ServerConfig::default();
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--port" => {
                i += 1;
                config.port = args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                    eprintln!("--port requires a valid port number");
                    std::process::exit(1);
                });
            }
            "--api-key" => {
                i += 1;
                config.api_key = args.get(i).cloned().or_else(|| {
                    eprintln!("--api-key requires a value");
                    std::process::exit(1);
                });
            }
            "--data-dir" => {
                i += 1;
                config.data_dir = args.get(i).map(Into::into).or_else(|| {
                    eprintln!("--data-dir requires a path");
                    std::process::exit(1);
                });
            }
            "--require-verification" => {
                config.require_verification = true;
            }
            "--leaderboard" => {
                i += 1;
                match args.get(i) {
                    Some(name) => config.leaderboards.push(name.clone()),
                    None => {
                        eprintln!("--leaderboard requires a name");
                        std::process::exit(1);
                    }
                }
            }
            "--data-cap" => {
                i += 1;
                config.data_cap = args.get(i).and_then(|s| s.parse().ok()).or_else(|| {
                    eprintln!("--data-cap requires a byte count");
                    std::process::exit(1);
                });
            }
            "--request-interval-ms" => {
                i += 1;
                let ms: u64 = args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                    eprintln!("--request-interval-ms requires a valid number");
                    std::process::exit(1);
                });
                config.min_request_interval = Duration::from_millis(ms);
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    config
}

fn print_usage() {
    println!("Usage: syncd [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --port <PORT>             Listen port (default: 8877)");
    println!("  --api-key <KEY>           Require clients to present this key");
    println!("  --data-dir <DIR>          Persist accounts/scores under this directory");
    println!("  --require-verification    New accounts must verify before logging in");
    println!("  --leaderboard <NAME>      Declare a leaderboard (repeatable)");
    println!("  --data-cap <BYTES>        Cumulative api request byte budget");
    println!("  --request-interval-ms <N> Minimum ms between api requests per client");
    println!("  --help, -h                Show this help");
}

/// Block until Ctrl+C is pressed, then set the flag to false.
fn ctrlc_wait(running: Arc<AtomicBool>) {
    // The process exits on SIGINT/SIGTERM by default, which is fine for a
    // standalone service — pending state is flushed every couple of seconds.
    // If more graceful shutdown is needed later, add the `ctrlc` crate.
    let _ = running;
}
