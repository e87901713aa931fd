use std::io::Write;

use anyhow::{Context, Result};
use peerlink_rpc::{credentials_from_context, RequestContext, SecuredListener};
use tracing::{info, warn};

/// Whoami example: a credential-secured accept loop that answers each
/// client with a JSON description of who the kernel says it is.
fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let socket_path = std::env::temp_dir().join("peerlink-whoami.sock");
    println!("=== peerlink whoami example ===");
    println!("Socket: {}", socket_path.display());
    println!("Try: socat - UNIX-CONNECT:{}", socket_path.display());

    let listener = SecuredListener::credential_only(
        peerlink_core::Listener::bind_replacing(&socket_path)
            .context("Failed to bind whoami socket")?,
    );

    loop {
        let session = match listener.accept() {
            Ok(session) => session,
            Err(err) => {
                warn!("accept failed: {err}");
                continue;
            }
        };

        // A real framework would build this per request; here the whole
        // connection is one request.
        let ctx = RequestContext::with_peer(session.peer());
        let (mut stream, _peer) = session.into_parts();

        let reply = match credentials_from_context(&ctx) {
            Ok(creds) => {
                info!("client pid={} uid={} gid={}", creds.pid, creds.uid, creds.gid);
                serde_json::json!({
                    "pid": creds.pid,
                    "uid": creds.uid,
                    "gid": creds.gid,
                })
            }
            Err(err) => {
                warn!("no credentials for this client: {err}");
                serde_json::json!({ "error": err.to_string() })
            }
        };

        let mut line = reply.to_string();
        line.push('\n');
        if let Err(err) = stream.write_all(line.as_bytes()) {
            warn!("failed to answer client: {err}");
        }
    }
}
