//! Remote endpoint identity and CoAP url handling.

use regex::Regex;
use url::Url;

use crate::error::ClientError;

/// The scheme+host+port triple identifying one remote endpoint.
///
/// Hosts compare case-insensitively; IPv6 literals are stored without
/// their brackets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Coap,
    Coaps,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Coap => "coap",
            Scheme::Coaps => "coaps",
        }
    }

    fn default_port(&self) -> u16 {
        match self {
            Scheme::Coap => 5683,
            Scheme::Coaps => 5684,
        }
    }
}

/// A parsed request url: origin plus path and query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapUrl {
    pub origin: Origin,
    pub path: String,
    pub query: Option<String>,
}

impl CoapUrl {
    pub fn parse(url: &str) -> Result<CoapUrl, ClientError> {
        let url_params =
            Url::parse(url).map_err(|_| ClientError::InvalidUrl(url.to_string()))?;

        let scheme = match url_params.scheme() {
            "coap" => Scheme::Coap,
            "coaps" => Scheme::Coaps,
            other => return Err(ClientError::UnsupportedProtocol(other.to_string())),
        };

        let host = match url_params.host_str() {
            Some("") | None => return Err(ClientError::InvalidUrl(url.to_string())),
            Some(h) => h.to_lowercase(),
        };
        let host = Regex::new(r"^\[(.*?)]$")
            .unwrap()
            .replace(&host, "$1")
            .to_string();

        let port = url_params.port().unwrap_or_else(|| scheme.default_port());

        Ok(CoapUrl {
            origin: Origin { scheme, host, port },
            path: url_params.path().to_string(),
            query: url_params.query().map(|q| q.to_string()),
        })
    }

    /// Path segments in order, empty segments dropped.
    pub fn path_segments(&self) -> impl Iterator<Item = &str> {
        self.path.split('/').filter(|s| !s.is_empty())
    }

    /// The canonical form used to key pending exchanges.
    pub fn normalized(&self) -> String {
        let host = if self.origin.host.contains(':') {
            format!("[{}]", self.origin.host)
        } else {
            self.origin.host.clone()
        };
        let mut out = format!(
            "{}://{}:{}{}",
            self.origin.scheme.as_str(),
            host,
            self.origin.port,
            self.path
        );
        if let Some(query) = &self.query {
            out.push('?');
            out.push_str(query);
        }
        out
    }
}
