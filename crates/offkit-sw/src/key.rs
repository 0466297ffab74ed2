//! Cache keys.

use std::fmt;

use http::Method;
use offkit_net::Request;
use serde::{Deserialize, Serialize};
use url::Url;

/// Identifies one cache entry: method plus URL without fragment.
///
/// Query strings are significant; fragments never reach the network and
/// are dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestKey {
    pub method: String,
    pub url: String,
}

impl RequestKey {
    pub fn new(method: &str, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: method.to_ascii_uppercase(),
            url: url.into(),
        }
    }

    /// GET key for a URL.
    pub fn for_url(url: &Url) -> Self {
        Self::new(Method::GET.as_str(), url)
    }

    pub fn from_request(request: &Request) -> Self {
        Self::new(request.method.as_str(), &request.url)
    }

    /// Only GET entries may be written.
    pub fn is_storable(&self) -> bool {
        self.method == Method::GET.as_str()
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}
