//! Fleet wire protocol
//!
//! Shapes exchanged between the central coordinator, the GPU workers it
//! dispatches to, and auditors verifying generation certificates.
//!
//! # Architecture
//!
//! ```text
//!   register / heartbeat            POST /generate
//!  ┌────────┐ ─────────────► ┌─────────────┐ ─────────────► ┌────────┐
//!  │ Worker │                │ Coordinator │                │ Worker │
//!  │ (GPU)  │ ◄───────────── │             │ ◄───────────── │ (GPU)  │
//!  └────────┘  session token └─────────────┘   audio bytes   └────────┘
//!                                   │
//!                                   ▼ signed certificate
//!                              ┌─────────┐
//!                              │ Auditor │
//!                              └─────────┘
//! ```
//!
//! ## Workers
//! - Register with a GPU snapshot and a capability set, receive a session token
//! - Heartbeat periodically with their status and resource usage
//! - Serve generation requests over plain HTTP
//!
//! ## Attestation
//! - Every completed generation is bound to a signed certificate
//! - The signed payload is a fixed, key-sorted subset of the certificate data

pub mod certificate;
pub mod types;

pub use certificate::*;
pub use types::*;
