//! Error types for the libvirt RPC transport.

use crate::{utils::Result, xdr};

/// Error code the server uses when nothing actually went wrong.
pub const ERR_OK: u32 = 0;

/// Error code the server uses when a domain does not exist.
pub const ERR_NO_DOMAIN: u32 = 42;

/// Transport errors surfaced to callers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The underlying stream failed, or a payload could not be
    /// encoded/decoded.
    #[error(transparent)]
    Io(#[from] ::std::io::Error),

    /// The connection went away while a call was still in flight.
    #[error("connection closed")]
    ConnectionClosed,

    /// The server does not know the requested procedure.
    #[error("unsupported procedure requested")]
    Unsupported,

    /// A structured error reported by the server.
    #[error(transparent)]
    Server(#[from] ServerError),
}

/// Error record as the server serializes it.
///
/// The displayable form is the `message` field alone; the numeric fields
/// allow callers to branch on well-known conditions.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ServerError {
    pub code: u32,
    pub domain: u32,
    pub padding: u8,
    pub message: String,
    pub level: u32,
}

/// Whether `err` is the server telling us a domain does not exist.
pub fn is_not_found(err: &Error) -> bool {
    matches!(err, Error::Server(e) if e.code == ERR_NO_DOMAIN)
}

/// Decode the error record carried by a reply with error status.
///
/// Returns `Ok(())` when the record's code is `ERR_OK`; the server sends
/// such records for replies that succeeded despite the status field.
pub(crate) fn decode_server_error(buf: &[u8]) -> Result<()> {
    let e: ServerError = xdr::from_bytes(buf)?;

    if e.message.contains("unknown procedure") {
        return Err(Error::Unsupported);
    }
    if e.code == ERR_OK {
        return Ok(());
    }

    Err(Error::Server(e))
}
