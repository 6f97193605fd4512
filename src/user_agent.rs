//! User-Agent identities sent by the loader.
//!
//! A bot identity carries a product token; only bots consult robots.txt.

use std::fmt;

/// Product token of the default identity.
const DEFAULT_PRODUCT_TOKEN: &str = "crawler";

/// The identity a loader presents to servers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserAgent {
    /// A crawler identified by a product token, e.g. `MyBot`.
    Bot {
        product_token: String,
        version: Option<String>,
        info_uri: Option<String>,
    },
    /// Any other User-Agent string, sent verbatim. robots.txt is not consulted.
    Plain(String),
}

impl Default for UserAgent {
    fn default() -> Self {
        Self::bot(DEFAULT_PRODUCT_TOKEN).with_version(env!("CARGO_PKG_VERSION"))
    }
}

impl UserAgent {
    /// A bot identity with the given product token.
    #[must_use]
    pub fn bot(product_token: impl Into<String>) -> Self {
        Self::Bot {
            product_token: product_token.into(),
            version: None,
            info_uri: None,
        }
    }

    /// A plain (non-bot) identity.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self::Plain(value.into())
    }

    /// Adds a version to a bot identity; no effect on plain identities.
    #[must_use]
    pub fn with_version(mut self, value: impl Into<String>) -> Self {
        if let Self::Bot { version, .. } = &mut self {
            *version = Some(value.into());
        }
        self
    }

    /// Adds an info URI to a bot identity; no effect on plain identities.
    #[must_use]
    pub fn with_info_uri(mut self, value: impl Into<String>) -> Self {
        if let Self::Bot { info_uri, .. } = &mut self {
            *info_uri = Some(value.into());
        }
        self
    }

    #[must_use]
    pub fn is_bot(&self) -> bool {
        matches!(self, Self::Bot { .. })
    }

    /// The robots.txt product token, for bots.
    #[must_use]
    pub fn product_token(&self) -> Option<&str> {
        match self {
            Self::Bot { product_token, .. } => Some(product_token),
            Self::Plain(_) => None,
        }
    }

    /// Value for the `User-Agent` request header.
    #[must_use]
    pub fn header_value(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for UserAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain(value) => f.write_str(value),
            Self::Bot {
                product_token,
                version,
                info_uri,
            } => {
                write!(f, "Mozilla/5.0 (compatible; {product_token}")?;
                if let Some(version) = version {
                    write!(f, "/{version}")?;
                }
                if let Some(uri) = info_uri {
                    write!(f, "; +{uri}")?;
                }
                f.write_str(")")
            }
        }
    }
}
