//! Protocol multiplexer for the single gateway port.
//!
//! A connection is classified once after the TLS handshake (tunnel or
//! HTTP); HTTP requests are then classified individually by framing:
//!
//! - `application/grpc*`: native gRPC, path is the method
//! - `application/grpc-web*`: gRPC-web at the endpoint's web URI
//! - registered JSON path: JSON
//! - anything else: the UI index document

mod connection;
mod framing;
pub mod grpc;
mod router;

pub use connection::{Multiplexer, PrefixedStream, Terminal};
pub use framing::{Framing, WebEncoding};
pub use router::{ClientAddr, create_router};
