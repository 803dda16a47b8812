//! Pluggable admission policy for new connections.

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::message::Hello;

/// Decides whether a connection may register a session.
///
/// Returns a human-readable reason on rejection; it is sent back to the
/// client before the connection is closed.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, remote: SocketAddr, hello: &Hello) -> Result<(), String>;
}

/// Accepts every connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl Authenticator for AllowAll {
    async fn authenticate(&self, _remote: SocketAddr, _hello: &Hello) -> Result<(), String> {
        Ok(())
    }
}

/// Requires `Hello.token` to equal a pre-shared secret.
#[derive(Clone)]
pub struct SharedToken {
    digest: blake3::Hash,
}

impl SharedToken {
    pub fn new(token: impl AsRef<str>) -> Self {
        Self {
            digest: blake3::hash(token.as_ref().as_bytes()),
        }
    }
}

impl std::fmt::Debug for SharedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedToken").finish_non_exhaustive()
    }
}

#[async_trait]
impl Authenticator for SharedToken {
    async fn authenticate(&self, remote: SocketAddr, hello: &Hello) -> Result<(), String> {
        match &hello.token {
            // `blake3::Hash` equality is constant-time.
            Some(token) if blake3::hash(token.as_bytes()) == self.digest => Ok(()),
            Some(_) => {
                tracing::warn!("bad token from {remote}");
                Err("invalid token".into())
            }
            None => Err("token required".into()),
        }
    }
}
