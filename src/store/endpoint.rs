use std::{fmt::Debug, sync::Arc};

use url::Url;

const DEFAULT_PORT: u16 = 6379;

/// A host:port pair for a Redis server
#[derive(Clone, PartialEq, Eq)]
pub struct StoreEndpoint(pub Arc<str>, pub u16);

impl Debug for StoreEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.0, self.1)
    }
}

impl TryFrom<&str> for StoreEndpoint {
    type Error = url::ParseError;

    fn try_from(endpoint: &str) -> Result<Self, Self::Error> {
        let url = match Url::parse(endpoint) {
            Ok(url) if url.has_host() => url,
            Ok(_) | Err(url::ParseError::RelativeUrlWithoutBase) => {
                Url::parse(&format!("redis://{}", endpoint))?
            }
            Err(e) => return Err(e),
        };

        Ok(Self(
            Arc::from(url.host_str().ok_or(url::ParseError::EmptyHost)?),
            url.port().unwrap_or(DEFAULT_PORT),
        ))
    }
}

impl StoreEndpoint {
    /// Connection url understood by the redis client
    pub fn url(&self) -> String {
        format!("redis://{}:{}/", self.0, self.1)
    }
}
