//! TokenRelay: ordered, resumable Server-Sent Events delivery of generated tokens.
//!
//! The crate hosts three processes sharing one configuration file:
//!
//! - the delivery server ([`server::run_serve`]) streaming `/stream/{conversation_id}` and
//!   `POST /chat` from the fan-out bus,
//! - the ingest bridge ([`server::run_bridge`]) draining the durable source onto the bus,
//! - the origin proxy ([`server::run_origin`]) turning inference output into token envelopes.

pub mod app_state;
pub mod bus;
pub mod delivery;
mod handlers;
mod http;
pub mod metrics;
mod middleware;
mod routes;
pub mod server;
pub mod services;
mod tracer;
