//! Representation of the requested HTTP version.

use std::fmt::Display;

/// The HTTP version named on the request line. Only 1.0 and 1.1 are understood; anything else
/// parses to `Unknown` and the request line parse fails at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
    Unknown,
}

impl Version {
    /// Parses the trailing `1.0`/`1.1` of an `HTTP/x.y` token.
    pub fn parse(major: u8, minor: u8) -> Version {
        match (major, minor) {
            (b'1', b'0') => Version::Http10,
            (b'1', b'1') => Version::Http11,
            _ => Version::Unknown,
        }
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
            Version::Unknown => "HTTP/?.?",
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_1_0_and_1_1() {
        assert_eq!(Version::Http10, Version::parse(b'1', b'0'));
        assert_eq!(Version::Http11, Version::parse(b'1', b'1'));
    }

    #[test]
    fn anything_else_is_unknown() {
        assert_eq!(Version::Unknown, Version::parse(b'2', b'0'));
    }
}
