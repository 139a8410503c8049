//! Authentication context and API secret matching.

use subtle::ConstantTimeEq;

use crate::config::AuthApiSecret;

/// Identity attached to every request by the auth middleware.
///
/// `id` is `None` when authentication is disabled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Auth {
    pub id: Option<String>,
}

impl Auth {
    pub fn empty() -> Self {
        Self { id: None }
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.id.is_some()
    }
}

/// Return the id of the secret matching `token`.
///
/// Every configured secret is compared in constant time so the position of a
/// match is not observable.
pub fn match_api_secret_id<'a>(token: &str, secrets: &'a [AuthApiSecret]) -> Option<&'a str> {
    let mut matched = None;
    for entry in secrets {
        if bool::from(token.as_bytes().ct_eq(entry.secret.as_bytes())) && matched.is_none() {
            matched = Some(entry.id.as_str());
        }
    }
    matched
}
