//! # ebs-server: network front of the versioned document store
//!
//! Serves the document surface (owners, patches, materialized data, head id)
//! and the device sync surface (clients, pending queues, key-addressed head
//! updates) over a binary WebSocket protocol.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ ApiClient   │ ◄─────────────────► │ ApiServer   │
//! │ (per device)│   Envelope<seq,T>   │ (central)   │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                     ┌──────┴──────┐
//!                                     │  Service    │
//!                                     │ (blocking)  │
//!                                     └──────┬──────┘
//!                                            │
//!                                     ebs_store::Repository
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: bincode-encoded request and response frames
//! - [`service`]: request dispatch and error-to-status mapping
//! - [`server`]: WebSocket server, configuration and statistics
//! - [`client`]: request/response WebSocket client

pub mod client;
pub mod protocol;
pub mod server;
pub mod service;

pub use client::{ApiClient, ConnectionState, HeadIdOutcome, HeadInfo};
pub use protocol::{
    Envelope, ProtocolError, Request, Response, WireNewPatch, WirePatch, FRAME_ERROR_SEQ,
};
pub use server::{ApiServer, ServerConfig, ServerError, ServerStats};
pub use service::{Service, ServiceError};
