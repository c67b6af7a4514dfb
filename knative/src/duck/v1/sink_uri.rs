use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkUriErr {
    #[error("{0}")]
    Parse(#[from] url::ParseError),
    #[error("uri must be absolute with a host")]
    MissingHost,
}

/// An absolute URI with a host, kept exactly as it was written.
///
/// [`Url`] only validates; scheme and host case, ports, dot segments and trailing slashes are
/// left alone. Values read back from a stored status are taken as they are.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, JsonSchema)]
#[serde(transparent)]
pub struct SinkUri(String);

impl SinkUri {
    pub fn parse(uri: &str) -> Result<Self, SinkUriErr> {
        let url = Url::parse(uri)?;
        match url.host_str() {
            Some(host) if !host.is_empty() => Ok(SinkUri(uri.to_string())),
            _ => Err(SinkUriErr::MissingHost),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The parsed, normalized form.
    pub fn to_url(&self) -> Result<Url, SinkUriErr> {
        Ok(Url::parse(&self.0)?)
    }
}

impl FromStr for SinkUri {
    type Err = SinkUriErr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SinkUri::parse(s)
    }
}

impl From<Url> for SinkUri {
    fn from(url: Url) -> Self {
        SinkUri(url.into())
    }
}

impl AsRef<str> for SinkUri {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SinkUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
