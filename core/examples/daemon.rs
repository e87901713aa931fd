use std::io::{Read, Write};

use anyhow::{Context, Result};
use peerlink_core::{cancellation, Error, Listener};
use tracing::{info, warn};

/// Daemon example: accept loop with Ctrl+C driven cancellation.
///
/// Each client gets one line back describing who the kernel says it is.
fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let socket_path = std::env::temp_dir().join("peerlink-daemon.sock");
    println!("=== peerlink daemon example ===");
    println!("Socket: {}", socket_path.display());
    println!("Press Ctrl+C to stop the server");

    let listener =
        Listener::bind_replacing(&socket_path).context("Failed to bind daemon socket")?;

    let (canceller, token) = cancellation();
    ctrlc::set_handler(move || {
        info!("received shutdown signal, cancelling accept");
        canceller.cancel();
    })
    .context("Failed to set signal handler")?;

    loop {
        let mut conn = match listener.accept_with_cancel(&token) {
            Ok(conn) => conn,
            Err(Error::Cancelled) => {
                info!("accept cancelled, shutting down");
                break;
            }
            Err(err) => {
                warn!("accept failed: {err}");
                continue;
            }
        };

        match conn.credentials() {
            Some(creds) => {
                info!("client pid={} uid={} gid={}", creds.pid, creds.uid, creds.gid);
                let line = format!("you are pid={} uid={} gid={}\n", creds.pid, creds.uid, creds.gid);
                if let Err(err) = conn.write_all(line.as_bytes()) {
                    warn!("failed to answer client: {err}");
                }
            }
            None => warn!("connection without credentials, ignoring"),
        }

        // Drain whatever the client had to say, then drop the connection.
        let mut scratch = Vec::new();
        let _ = conn.read_to_end(&mut scratch);
    }

    Ok(())
}
