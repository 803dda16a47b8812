//! Capability bits exchanged during the handshake.

use bitflags::bitflags;

bitflags! {
    /// Features a peer supports. The server keeps the intersection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u32 {
        /// Session survives a disconnect for the grace period.
        const RESUME    = 0x0001;
        /// Handlers may defer their response to the worker pool.
        const OFFLOAD   = 0x0002;
        /// Payloads may carry JSON [`ApiCall`](crate::bridge::ApiCall)s.
        const NAMED_API = 0x0004;
    }
}

impl Capabilities {
    /// Everything this build supports.
    pub fn local() -> Self {
        Self::all()
    }

    /// Intersection of what both peers support.
    pub fn negotiate(self, remote: u32) -> Self {
        self & Self::from_bits_truncate(remote)
    }
}
