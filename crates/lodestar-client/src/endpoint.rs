//! Endpoint URI helpers
//!
//! Transports publish one URI per exposed listener, e.g. `grpc://10.0.0.1:9000`.

use url::Url;

use crate::error::Result;

/// Build an endpoint URI from a scheme and a `host[:port]` authority.
pub fn new_endpoint(scheme: &str, host: &str) -> Result<Url> {
    Ok(Url::parse(&format!("{}://{}", scheme, host))?)
}

/// Find the authority (`host[:port]`) of the first endpoint using `scheme`.
///
/// A malformed endpoint fails the lookup; no match yields `None`.
pub fn parse_endpoint<S: AsRef<str>>(endpoints: &[S], scheme: &str) -> Result<Option<String>> {
    for raw in endpoints {
        let url = Url::parse(raw.as_ref())?;
        if url.scheme() == scheme {
            return Ok(Some(authority(&url)));
        }
    }
    Ok(None)
}

/// Scheme name for a transport, with the `s` suffix when secured.
pub fn scheme(scheme: &str, secure: bool) -> String {
    if secure {
        format!("{}s", scheme)
    } else {
        scheme.to_string()
    }
}

fn authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}
