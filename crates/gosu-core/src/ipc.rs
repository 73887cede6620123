//! Local IPC addressing and dialing.
//!
//! Addresses are Unix sockets at `/tmp/gosu-<name>.sock` (named pipes
//! `\\.\pipe\gosu-<name>` on Windows). Random names are 12 random bytes in
//! lowercase unpadded base32; explicit names escape non-alphanumeric
//! characters as `xU<hex>`.

use std::io;
use std::time::Duration;

use rand::RngCore;

#[cfg(unix)]
const PREFIX: &str = "/tmp/gosu-";
#[cfg(unix)]
const SUFFIX: &str = ".sock";

#[cfg(windows)]
const PREFIX: &str = r"\\.\pipe\gosu-";
#[cfg(windows)]
const SUFFIX: &str = "";

/// Extract the name from an IPC address, if it is one.
pub fn from_address(address: &str) -> Option<&str> {
    address
        .strip_prefix(PREFIX)
        .and_then(|rest| rest.strip_suffix(SUFFIX))
}

/// The address for a name; an empty name generates a random one.
pub fn new_address(name: &str) -> String {
    let name = if name.is_empty() {
        let mut bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut bytes);
        base32::encode(base32::Alphabet::Rfc4648 { padding: false }, &bytes).to_lowercase()
    } else {
        name.to_string()
    };
    format!("{PREFIX}{name}{SUFFIX}")
}

/// Like [`new_address`], escaping characters a pipe path cannot carry.
pub fn new_address_escaped(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            escaped.push(c);
        } else {
            escaped.push_str(&format!("xU{:x}", c as u32));
        }
    }
    new_address(&escaped)
}

#[cfg(unix)]
pub type IpcStream = tokio::net::UnixStream;
#[cfg(unix)]
pub type IpcListener = tokio::net::UnixListener;

#[cfg(unix)]
pub async fn dial(address: &str) -> io::Result<IpcStream> {
    IpcStream::connect(address).await
}

#[cfg(unix)]
pub fn bind(address: &str) -> io::Result<IpcListener> {
    let _ = std::fs::remove_file(address);
    IpcListener::bind(address)
}

#[cfg(not(unix))]
pub type IpcStream = tokio::net::TcpStream;

#[cfg(not(unix))]
pub async fn dial(_address: &str) -> io::Result<IpcStream> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "IPC dialing is not supported on this platform",
    ))
}

/// Dial with a deadline; used by liveness probes.
pub async fn dial_timeout(address: &str, timeout: Duration) -> io::Result<IpcStream> {
    tokio::time::timeout(timeout, dial(address))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial timed out"))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_address_round_trips() {
        let addr = new_address("web");
        assert_eq!(from_address(&addr), Some("web"));
    }

    #[test]
    fn random_names_are_base32() {
        let addr = new_address("");
        let name = from_address(&addr).unwrap();
        // 12 bytes -> 20 base32 chars, lowercase, no padding.
        assert_eq!(name.len(), 20);
        assert!(name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_ne!(new_address(""), addr);
    }

    #[test]
    fn escaping_non_alphanumerics() {
        let addr = new_address_escaped("a b/c");
        let name = from_address(&addr).unwrap();
        assert_eq!(name, "axU20bxU2fc");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn bind_and_dial() {
        let addr = new_address("");
        let listener = bind(&addr).unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });
        dial_timeout(&addr, Duration::from_secs(1)).await.unwrap();
        accept.await.unwrap().unwrap();
        std::fs::remove_file(&addr).ok();
    }
}
