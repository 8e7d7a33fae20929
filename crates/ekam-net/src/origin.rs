//! Site origin used to decide whether a response is `basic`.

use std::fmt;

use url::Url;

/// The origin the controller serves pages from.
///
/// Only `http` and `https` URLs yield a usable origin; anything else is
/// opaque and contains nothing, not even itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    inner: url::Origin,
}

impl Origin {
    pub fn from_url(url: &Url) -> Self {
        let inner = if is_web_scheme(url.scheme()) {
            url.origin()
        } else {
            url::Origin::new_opaque()
        };
        Self { inner }
    }

    /// Whether `url` shares scheme, host and port with this origin.
    pub fn contains(&self, url: &Url) -> bool {
        self.inner.is_tuple() && is_web_scheme(url.scheme()) && url.origin() == self.inner
    }

    pub fn is_opaque(&self) -> bool {
        !self.inner.is_tuple()
    }

    /// ASCII serialization: `https://ekam.example`, or `null` when opaque.
    pub fn serialize(&self) -> String {
        self.inner.ascii_serialization()
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

fn is_web_scheme(scheme: &str) -> bool {
    matches!(scheme, "http" | "https")
}
