//! Fleet coordinator
//!
//! Keeps track of independently operated GPU workers, routes generation
//! requests to them, signs a certificate for every finished generation and
//! shares pooled donations back out to the workers each month.
//!
//! ```text
//!   worker ──register/heartbeat──▶ WorkerRegistry ◀── sweep
//!                                      │
//!   client ──generate──▶ Dispatcher ───┘──▶ WorkerClient ──▶ worker /generate
//!                            │
//!                            └──▶ AttestationService ──▶ certificates.jsonl
//!
//!   admin ──donations/distribute──▶ RevenueAllocator ──▶ revenue.json
//! ```

pub mod attestation;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod generation;
pub mod ledger;
pub mod models;
pub mod money;
pub mod registry;
pub mod routes;
pub mod state;
pub mod storage;
pub mod worker_client;

pub use error::{FleetError, Result};
