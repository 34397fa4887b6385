//! Helpers shared across the transport modules.

use crate::error;

/// Crate-wide result type carrying [`error::Error`].
pub type Result<T> = ::std::result::Result<T, error::Error>;

/// Where a libvirt daemon listens, parsed from the `proto!address!port`
/// notation the command line tools use.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Endpoint<'a> {
    /// Unix domain socket path
    Unix(&'a str),
    /// TCP host and port
    Tcp(&'a str, &'a str),
}

impl<'a> Endpoint<'a> {
    /// Parse an endpoint address such as
    /// `unix!/var/run/libvirt/libvirt-sock!0` or `tcp!localhost!16509`.
    ///
    /// The trailing field is kept for parity with other libvirt tooling;
    /// Unix endpoints ignore it.
    pub fn parse(addr: &'a str) -> Option<Endpoint<'a>> {
        let mut fields = addr.splitn(3, '!');
        let proto = fields.next()?;
        let address = fields.next()?;
        let port = fields.next()?;

        match proto {
            "unix" => Some(Endpoint::Unix(address)),
            "tcp" => Some(Endpoint::Tcp(address, port)),
            _ => None,
        }
    }
}

#[test]
fn endpoint_parse1() {
    assert_eq!(
        Endpoint::parse("unix!/var/run/libvirt/libvirt-sock!0"),
        Some(Endpoint::Unix("/var/run/libvirt/libvirt-sock"))
    );
    assert_eq!(
        Endpoint::parse("tcp!localhost!16509"),
        Some(Endpoint::Tcp("localhost", "16509"))
    );
    assert_eq!(Endpoint::parse("vsock!2!1234"), None);
    assert_eq!(Endpoint::parse("unix"), None);
}
