//! Pull side of an action mirror: keeps a bare git mirror of an upstream
//! action repository and caches the release bundles its maintained branches
//! depend on, ready to be pushed into an isolated instance.

pub mod cache;
pub mod cancel;
pub mod config;
pub mod git;
pub mod mirror;
pub mod pull;
pub mod releases;
pub mod relevance;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;
