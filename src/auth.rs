//! The Auth Gate (§4.6): a single bearer token persisted at server start,
//! bypassed for loopback peers, plus SSH public key registration so remote
//! clients can attach to a job's session over SSH.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use crate::error::{NexusError, Result};

pub struct AuthGate {
    token: String,
}

impl AuthGate {
    /// Loads the token from `token_path`, generating and persisting a fresh
    /// one with `0600` permissions if none exists yet.
    pub fn init(home: &Path) -> Result<Self> {
        let path = crate::config::token_path(home);
        if let Ok(existing) = std::fs::read_to_string(&path) {
            let token = existing.trim().to_string();
            if !token.is_empty() {
                return Ok(Self { token });
            }
        }
        Self::regenerate(home)
    }

    /// Mints a new token and overwrites the persisted one (the `init-token`
    /// CLI subcommand).
    pub fn regenerate(home: &Path) -> Result<Self> {
        std::fs::create_dir_all(home)?;
        let path = crate::config::token_path(home);
        let token: String = (0..32).map(|_| fast_hex_char()).collect();
        std::fs::write(&path, &token)?;
        set_owner_only_permissions(&path)?;
        tracing::info!(path = %path.display(), "wrote bearer token");
        Ok(Self { token })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    fn is_authorized(&self, header_value: Option<&str>) -> bool {
        match header_value.and_then(|v| v.strip_prefix("Bearer ")) {
            Some(presented) => constant_time_eq(presented.as_bytes(), self.token.as_bytes()),
            None => false,
        }
    }
}

fn fast_hex_char() -> char {
    use rand::Rng;
    const ALPHABET: &[u8] = b"0123456789abcdef";
    let idx = rand::rng().random_range(0..ALPHABET.len());
    ALPHABET[idx] as char
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(unix)]
fn set_owner_only_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_owner_only_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

fn is_loopback(addr: &SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V4(ip) => ip == Ipv4Addr::LOCALHOST,
        IpAddr::V6(ip) => ip == Ipv6Addr::LOCALHOST,
    }
}

/// Axum middleware enforcing §4.6: loopback peers bypass the check entirely;
/// everyone else needs a matching `Authorization: Bearer …` header.
pub async fn require_auth(
    State(gate): State<Arc<AuthGate>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> std::result::Result<Response, NexusError> {
    if is_loopback(&peer) {
        return Ok(next.run(request).await);
    }
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if !gate.is_authorized(header) {
        return Err(NexusError::Unauthenticated);
    }
    Ok(next.run(request).await)
}

/// Appends a submitted public key to `$NEXUS_HOME/authorized_keys`, the file
/// an operator points `sshd`'s `AuthorizedKeysFile` at to allow later
/// session-attach from that client.
pub fn register_ssh_key(home: &Path, public_key: &str) -> Result<()> {
    let key = public_key.trim();
    if key.is_empty() || key.contains('\n') {
        return Err(NexusError::Validation("invalid public key".to_string()));
    }
    std::fs::create_dir_all(home)?;
    let path = home.join("authorized_keys");
    let existing = std::fs::read_to_string(&path).unwrap_or_default();
    if existing.lines().any(|l| l == key) {
        return Ok(());
    }
    let mut contents = existing;
    if !contents.is_empty() && !contents.ends_with('\n') {
        contents.push('\n');
    }
    contents.push_str(key);
    contents.push('\n');
    std::fs::write(&path, contents)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_persists_and_reloads_same_token() {
        let dir = tempfile::tempdir().unwrap();
        let gate = AuthGate::init(dir.path()).unwrap();
        let token = gate.token().to_string();
        let reloaded = AuthGate::init(dir.path()).unwrap();
        assert_eq!(reloaded.token(), token);
    }

    #[test]
    fn regenerate_replaces_the_token() {
        let dir = tempfile::tempdir().unwrap();
        let first = AuthGate::init(dir.path()).unwrap().token().to_string();
        let second = AuthGate::regenerate(dir.path()).unwrap();
        assert_ne!(first, second.token());
    }

    #[test]
    fn is_authorized_requires_exact_bearer_match() {
        let dir = tempfile::tempdir().unwrap();
        let gate = AuthGate::init(dir.path()).unwrap();
        let header = format!("Bearer {}", gate.token());
        assert!(gate.is_authorized(Some(&header)));
        assert!(!gate.is_authorized(Some("Bearer wrong")));
        assert!(!gate.is_authorized(None));
    }

    #[test]
    fn loopback_addresses_are_recognized() {
        assert!(is_loopback(&"127.0.0.1:80".parse().unwrap()));
        assert!(is_loopback(&"[::1]:80".parse().unwrap()));
        assert!(!is_loopback(&"10.0.0.1:80".parse().unwrap()));
    }

    #[test]
    fn register_ssh_key_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        register_ssh_key(dir.path(), "ssh-ed25519 AAAAexample").unwrap();
        register_ssh_key(dir.path(), "ssh-ed25519 AAAAexample").unwrap();
        let contents = std::fs::read_to_string(dir.path().join("authorized_keys")).unwrap();
        assert_eq!(contents.lines().count(), 1);
    }

    #[test]
    fn register_ssh_key_rejects_multiline_input() {
        let dir = tempfile::tempdir().unwrap();
        let err = register_ssh_key(dir.path(), "ssh-ed25519 AAAA\nssh-ed25519 BBBB").unwrap_err();
        assert!(matches!(err, NexusError::Validation(_)));
    }
}
