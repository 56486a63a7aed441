//! della-wonders: bridge an air-gapped host to the Internet through a
//! shared filesystem.
//!
//! A client program on the isolated host is launched with its HTTP(S)
//! traffic pointed at a local intercepting proxy. The proxy serializes each
//! exchange into a rendezvous directory and blocks until a companion
//! forwarder — running on an Internet-connected host that mounts the same
//! directory — executes the request and deposits the response. The client
//! never learns the transport was a filesystem.
//!
//! # Components
//!
//! - [`store`]: the rendezvous directory — atomic publish, claim, await,
//!   sweep
//! - [`envelope`]: the on-disk JSON format and its integrity-checking codec
//! - [`filter`]: the security policy the forwarder applies before going out
//! - [`proxy`]: HTTP/1.1 + HTTPS interception on the isolated side
//! - [`forwarder`]: the Internet-side daemon executing requests
//! - [`launcher`]: spawns the user's program wired to the proxy
//! - [`telemetry`]: audit trail in the shared directory
//!
//! # Security model
//!
//! The shared directory's access control is the trust boundary. Envelopes
//! carry SHA-256 body hashes verified on every load; a mismatch is treated
//! as corruption, never silently passed through. The forwarder refuses
//! blocklisted domains and oversized requests, caps response bodies, and
//! records every decision in an audit log.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod cli;
pub mod envelope;
pub mod filter;
pub mod forwarder;
pub mod launcher;
pub mod proxy;
pub mod status;
pub mod store;
pub mod telemetry;
