// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Transport serde codec.

pub use ::tarpc::tokio_serde::formats::{Bincode, Json};
use faststr::FastStr;
use std::fmt;
use std::str::FromStr;

/// Transport serde codec.
///
/// Proxy and backends must agree on it, the proxy never re-encodes payloads
/// with a different codec than the one it received them with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    /// Bincode codec using [bincode](https://docs.rs/bincode) crate.
    #[default]
    Bincode,
    /// JSON codec using [serde_json](https://docs.rs/serde_json) crate.
    Json,
}

impl FromStr for Codec {
    type Err = FastStr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bincode" => Ok(Codec::Bincode),
            "json" => Ok(Codec::Json),
            other => Err(FastStr::from(format!("unknown codec {other:?}, expected bincode or json"))),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Codec::Bincode => f.write_str("bincode"),
            Codec::Json => f.write_str("json"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Codec;

    #[test]
    fn parse_codec() {
        assert_eq!("bincode".parse::<Codec>(), Ok(Codec::Bincode));
        assert_eq!("JSON".parse::<Codec>(), Ok(Codec::Json));
        assert!("cbor".parse::<Codec>().is_err());
        assert_eq!(Codec::default().to_string(), "bincode");
    }
}
