//! `warden-service`: access authorization over a Unix domain socket.
//!
//! Hosts a single [`warden_core::AccessManager`] and speaks newline-delimited
//! JSON-RPC-lite on `$XDG_RUNTIME_DIR/warden.sock`. Clients open with a
//! `hello` handshake; `changes.subscribe` turns a connection into a push
//! stream of `changes.batch` notifications alongside ordinary responses.

pub mod config;
pub mod ipc;
pub mod protocol;

/// Protocol version for the Warden IPC.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Default socket filename.
pub const SOCKET_FILENAME: &str = "warden.sock";

/// Get the default socket path using XDG_RUNTIME_DIR.
///
/// Falls back to `/tmp/warden-<username>.sock` if XDG_RUNTIME_DIR is not set.
pub fn default_socket_path() -> std::path::PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        std::path::PathBuf::from(runtime_dir).join(SOCKET_FILENAME)
    } else {
        let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
        std::path::PathBuf::from(format!("/tmp/warden-{user}.sock"))
    }
}
