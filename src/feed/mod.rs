//! Retrieval of a source's latest items.
//!
//! - [`types`] - strategies, the fetch error taxonomy and [`FetchReport`]
//! - [`methods`] - one [`FetchMethod`] per strategy (mirror, rsshub, feed, search)
//! - [`fetcher`] - [`SourceFetcher`], the ordered fallback chain with per-method timeouts
//! - `parser` / `http` - RSS/Atom and search JSON decoding, bounded HTTP reads
//!
//! # Example
//!
//! ```ignore
//! let fetcher = SourceFetcher::new(&config.fetch, build_client(&config.fetch)?);
//! let report = fetcher.fetch("poetry-weekly", Strategy::Auto, 10).await?;
//! println!("{} items via {}", report.items.len(), report.strategy);
//! ```

pub mod fetcher;
mod http;
pub mod methods;
mod parser;
pub mod types;

pub use fetcher::SourceFetcher;
pub use http::build_client;
pub use methods::{build_methods, DirectFeedMethod, FetchMethod, RouteFeedMethod, SearchMethod};
pub use types::{FetchError, FetchErrorKind, FetchReport, MethodFailure, Strategy};
