//! Bearer token verification.
//!
//! The registry only needs a yes/no answer for a token; how that answer is
//! produced is up to the [`TokenVerifier`] it was built with.

use std::collections::HashSet;

pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> bool;
}

impl<F> TokenVerifier for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn verify(&self, token: &str) -> bool {
        self(token)
    }
}

/// Accepts any non-empty token. Used when no access tokens are configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAnyToken;

impl TokenVerifier for AllowAnyToken {
    fn verify(&self, token: &str) -> bool {
        !token.trim().is_empty()
    }
}

/// Accepts only tokens from a fixed allow-list.
#[derive(Debug, Clone)]
pub struct StaticTokens {
    tokens: HashSet<String>,
}

impl StaticTokens {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl TokenVerifier for StaticTokens {
    fn verify(&self, token: &str) -> bool {
        self.tokens.contains(token)
    }
}
