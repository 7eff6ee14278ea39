//! HTTP adapters over the health collaborator: `GET /health` and the
//! `GET /stream` websocket of new transaction hashes.

pub mod handlers;
pub mod middleware;
pub mod models;
pub mod server;

pub use server::{build_router, run_server};
