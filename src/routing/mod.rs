//! Request routing: local endpoints, upstream forwarding and the upstream HTTP client.

pub mod client;
pub mod handlers;
pub mod router;

pub use router::create_router;
