#![forbid(unsafe_code)]
//! Asynchronous client library for the libvirt RPC protocol.
//!
//! This crate provides a tokio-based async implementation of the libvirt
//! remote protocol transport, allowing you to talk to a libvirt daemon over
//! its Unix socket or a TCP connection.
//!
//! # Overview
//!
//! libvirt exposes every hypervisor operation as an RPC procedure inside a
//! numeric two-level namespace (program, procedure). All payloads are
//! XDR-encoded (RFC 4506) and ride in length-prefixed packets over a single
//! reliable byte stream. This crate implements the hard part of a client:
//! the packet framing, the multiplexing of many concurrent in-flight calls
//! over one connection, full-duplex data streams attached to a call, and
//! the routing of asynchronous domain events to subscribers. Procedure
//! payloads themselves are treated as opaque bytes; encoding them is the
//! job of the caller (typically generated per-procedure bindings).
//!
//! # Getting Started
//!
//! To issue calls against a libvirt daemon, you need to:
//!
//! 1. Connect with [`Client::connect`] (or wrap any read/write pair with
//!    [`Client::new`])
//! 2. XDR-encode the procedure arguments, e.g. with [`xdr::to_bytes`]
//! 3. Call [`Client::request`] or [`Client::request_stream`] with the
//!    program and procedure number
//!
//! # Example
//!
//! ```no_run
//! use rsvirt::{Client, Result, PROGRAM_REMOTE};
//!
//! // REMOTE_PROC_CONNECT_GET_LIB_VERSION
//! const PROC_GET_LIB_VERSION: u32 = 157;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::connect("unix!/var/run/libvirt/libvirt-sock!0").await?;
//!
//!     let payload = client
//!         .request(PROGRAM_REMOTE, PROC_GET_LIB_VERSION, &[])
//!         .await?;
//!     let version: u64 = rsvirt::xdr::from_bytes(&payload)?;
//!     println!("libvirt {}", version);
//!
//!     Ok(())
//! }
//! ```
//!
//! # Protocol Details
//!
//! ## Packet layout
//!
//! Every packet is `length(4) + header(24) + payload`, all fields big
//! endian. The length counts itself. The header carries the program,
//! version, procedure, packet type, call serial and status; see
//! [`packet::Header`].
//!
//! ## Multiplexing
//!
//! Each call is assigned a fresh 32-bit serial. A dedicated reader task
//! demultiplexes replies (and the stream packets belonging to a call) back
//! to their callers by serial, so any number of calls can be in flight on
//! one connection at once. Replies within one call arrive in wire order;
//! replies across calls interleave freely.
//!
//! ## Streams
//!
//! Procedures such as volume upload/download attach a data stream to the
//! call. [`Client::request_stream`] accepts an optional outgoing source
//! and an optional incoming sink and handles chunking, end-of-stream and
//! abort signalling; see its documentation for the details.
//!
//! ## Events
//!
//! Domain monitor events arrive as asynchronous `Message` packets and are
//! routed by the server-assigned callback id to sinks registered with
//! [`Client::subscribe`]. A slow subscriber never stalls the connection.
//!
//! # Error Handling
//!
//! Fallible operations return [`error::Error`]. Server-reported failures
//! are decoded into [`error::ServerError`] records; well-known conditions
//! are classified, e.g. [`error::is_not_found`] recognizes the "no such
//! domain" code and unknown procedures surface as
//! [`error::Error::Unsupported`].
//!
//! # Transport
//!
//! The library supports multiple transports:
//! - **Unix Domain Sockets**: `"unix!path!suffix"` (e.g.
//!   `"unix!/var/run/libvirt/libvirt-sock!0"`)
//! - **TCP**: `"tcp!host!port"` (e.g. `"tcp!localhost!16509"`)
//!
//! Connection setup and authentication beyond the socket handshake are the
//! caller's concern; the transport only assumes a connected pair.
//!
//! # Safety
//!
//! This crate forbids unsafe code (`#![forbid(unsafe_code)]`) and relies on
//! Rust's type system for memory safety.
pub mod client;
pub mod error;
pub mod packet;
pub mod utils;
pub mod xdr;

pub use crate::client::{Client, DownloadSink, UploadSource};
pub use crate::error::{is_not_found, Error, ServerError};
pub use crate::packet::*;
pub use crate::utils::{Endpoint, Result};
