//! Higher-level helpers built on the [`Transport`](crate::Transport)

pub mod msearch;

pub use msearch::{MultiSearch, MultiSearchConfig, SearchHandle, SearchResult};
