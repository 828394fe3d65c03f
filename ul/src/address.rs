//! Data types for addresses to nodes in DICOM networks.
//!
//! A remote application entity is addressed as `{ae_title}@{host}:{port}`.
//! The server uses these to resolve C-MOVE destinations.

use std::{
    net::{AddrParseError, SocketAddr, ToSocketAddrs},
    str::FromStr,
};

use snafu::{ResultExt, Snafu};

/// A full address to a target application entity:
/// an AE title plus a network socket address.
///
/// Serialized and parsed with the syntax `{ae_title}@{socket_address}`.
///
/// # Example
///
/// ```
/// # use pacs_ul::FullAeAddr;
/// # use std::net::SocketAddr;
/// #
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let addr: FullAeAddr = "SCP-STORAGE@127.0.0.1:104".parse()?;
/// assert_eq!(addr.ae_title(), "SCP-STORAGE");
/// assert_eq!(addr.socket_addr(), SocketAddr::from(([127, 0, 0, 1], 104)));
/// assert_eq!(&addr.to_string(), "SCP-STORAGE@127.0.0.1:104");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct FullAeAddr {
    ae_title: String,
    socket_addr: SocketAddr,
}

impl FullAeAddr {
    /// Create an AE address from its bare constituent parts.
    pub fn new(ae_title: impl Into<String>, socket_addr: SocketAddr) -> Self {
        FullAeAddr {
            ae_title: ae_title.into(),
            socket_addr,
        }
    }

    /// Retrieve the application entity title portion.
    pub fn ae_title(&self) -> &str {
        &self.ae_title
    }

    /// Retrieve the socket address portion.
    pub fn socket_addr(&self) -> SocketAddr {
        self.socket_addr
    }
}

impl From<(String, SocketAddr)> for FullAeAddr {
    fn from((ae_title, socket_addr): (String, SocketAddr)) -> Self {
        Self::new(ae_title, socket_addr)
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Snafu)]
pub enum ParseAeAddressError {
    /// Missing `@` in full AE address
    MissingPart,

    /// Could not parse socket address
    ParseSocketAddress { source: AddrParseError },
}

impl FromStr for FullAeAddr {
    type Err = ParseAeAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((ae_title, addr)) = s.split_once('@') {
            Ok(FullAeAddr {
                ae_title: ae_title.to_string(),
                socket_addr: addr.parse().context(ParseSocketAddressSnafu)?,
            })
        } else {
            Err(ParseAeAddressError::MissingPart)
        }
    }
}

impl ToSocketAddrs for FullAeAddr {
    type Iter = std::option::IntoIter<SocketAddr>;

    fn to_socket_addrs(&self) -> std::io::Result<Self::Iter> {
        self.socket_addr.to_socket_addrs()
    }
}

impl std::fmt::Display for FullAeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.ae_title)?;
        f.write_str("@")?;
        std::fmt::Display::fmt(&self.socket_addr, f)
    }
}

/// An address to a target application entity
/// in which the AE title part is optional.
///
/// For the version of the struct with a mandatory AE title,
/// see [`FullAeAddr`].
#[derive(Debug, Clone, PartialEq)]
pub struct AeAddr {
    ae_title: Option<String>,
    socket_addr: SocketAddr,
}

impl AeAddr {
    /// Create an AE address from its bare constituent parts.
    pub fn new(ae_title: impl Into<String>, socket_addr: SocketAddr) -> Self {
        AeAddr {
            ae_title: Some(ae_title.into()),
            socket_addr,
        }
    }

    /// Retrieve the application entity title portion, if present.
    pub fn ae_title(&self) -> Option<&str> {
        self.ae_title.as_deref()
    }

    /// Retrieve the socket address portion.
    pub fn socket_addr(&self) -> SocketAddr {
        self.socket_addr
    }

    /// Create a new address with the full application entity target,
    /// using the given AE title if it is missing.
    pub fn with_default_ae_title(self, ae_title: impl Into<String>) -> FullAeAddr {
        FullAeAddr {
            ae_title: self.ae_title.unwrap_or_else(|| ae_title.into()),
            socket_addr: self.socket_addr,
        }
    }
}

impl From<SocketAddr> for AeAddr {
    fn from(socket_addr: SocketAddr) -> Self {
        AeAddr {
            ae_title: None,
            socket_addr,
        }
    }
}

impl From<FullAeAddr> for AeAddr {
    fn from(full: FullAeAddr) -> Self {
        AeAddr {
            ae_title: Some(full.ae_title),
            socket_addr: full.socket_addr,
        }
    }
}

impl FromStr for AeAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((ae_title, address)) = s.split_once('@') {
            Ok(AeAddr {
                ae_title: Some(ae_title.to_string()),
                socket_addr: address.parse()?,
            })
        } else {
            Ok(AeAddr {
                ae_title: None,
                socket_addr: s.parse()?,
            })
        }
    }
}

impl ToSocketAddrs for AeAddr {
    type Iter = std::option::IntoIter<SocketAddr>;

    fn to_socket_addrs(&self) -> std::io::Result<Self::Iter> {
        self.socket_addr.to_socket_addrs()
    }
}

impl std::fmt::Display for AeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ae_title) = &self.ae_title {
            f.write_str(ae_title)?;
            f.write_str("@")?;
        }

        std::fmt::Display::fmt(&self.socket_addr, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_ae_addr() {
        let addr: FullAeAddr = "STORE-SCP@127.0.0.1:11112".parse().unwrap();
        assert_eq!(addr.ae_title(), "STORE-SCP");
        assert_eq!(addr.socket_addr().port(), 11112);

        assert!("127.0.0.1:11112".parse::<FullAeAddr>().is_err());
    }

    #[test]
    fn parse_ae_addr_with_and_without_title() {
        let addr: AeAddr = "192.168.1.99:1045".parse().unwrap();
        assert_eq!(addr.ae_title(), None);

        let full = addr.with_default_ae_title("FALLBACK");
        assert_eq!(full.ae_title(), "FALLBACK");

        let addr: AeAddr = "SCP-QUERY@192.168.1.99:1045".parse().unwrap();
        assert_eq!(addr.ae_title(), Some("SCP-QUERY"));
    }
}
