//! # loopctl-core
//!
//! Drive a GUI application's event loop from another process over TCP.
//!
//! This crate contains:
//! - **Wire**: `FrameHeader`, `Message` and its payloads, `FrameCodec`
//! - **Network**: `Transport` (server links with keepalive and bounded
//!   write buffers) and `Connection` (framed client stream)
//! - **Session**: `SessionManager` for authentication, admission,
//!   reconnection grace and response routing
//! - **Queue**: `CommandQueue`, bounded and round-robin across sessions
//! - **Bridge**: `EventLoopBridge`, applying one command per GUI tick
//! - **Dispatch**: `WorkerPool` for handlers too slow for the GUI thread
//! - **Client / Server**: `ControlClient` and `ControlServer`
//! - **Error**: `LoopError`, typed with `thiserror`

pub mod bridge;
pub mod client;
pub mod codec;
pub mod command;
pub mod dispatch;
pub mod error;
pub mod flags;
pub mod header;
pub mod message;
pub mod network;
pub mod queue;
pub mod server;
pub mod session;
pub mod state;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use bridge::{
    ApiCall, ApiRegistry, BridgeOptions, BridgeState, EventLoopBridge, HostGui, Reply,
    ShutdownSignal, Tick,
};
pub use client::{ClientOptions, ControlClient};
pub use codec::{FrameCodec, MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE, decode, encode};
pub use command::{Command, ConnectionId, SessionId};
pub use dispatch::{Completion, Job, TaskKey, WorkerPool};
pub use error::{ErrorClass, HostError, LoopError, WorkerError};
pub use flags::Capabilities;
pub use header::{FrameHeader, HEADER_SIZE, PROTOCOL_VERSION};
pub use message::{
    CommandFrame, CommandKind, Hello, Message, MessageKind, ResponseFrame, Status, Welcome,
};
pub use network::{Connection, ConnectionInfo, Transport, TransportOptions};
pub use queue::{CommandQueue, LoopWaker};
pub use server::{ControlServer, ServerOptions};
pub use session::{Admission, AllowAll, Authenticator, SessionManager, SessionOptions, SharedToken};
pub use state::{ConnectionPhase, PendingCommands};
