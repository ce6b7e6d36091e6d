//! Crosstalk - a gateway that bridges messaging platforms to AI agent backends.

pub mod agent;
pub mod channel;
pub mod config;
pub mod gateway;
pub mod handlers;
pub mod queue;
pub mod response;
pub mod router;
pub mod server;
pub mod session;
pub mod sync;
pub mod tools;
