//! External service clients/adapters.

pub mod token_cache;

pub use token_cache::{AccessToken, DEFAULT_REFRESH_SKEW, TokenCache, TokenError, TokenSource};
