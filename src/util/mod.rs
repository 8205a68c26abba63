//! Utility functions for common operations.
//!
//! - **URL validation**: refuses non-HTTP schemes and private hosts for direct feeds
//! - **Text processing**: markup stripping, control-character removal, char-safe truncation
//! - **Tasks**: panic containment for per-source work

mod task;
mod text;
mod url_validator;

pub use task::catch_task_panic;
pub use text::{strip_control_chars, strip_markup, truncate_chars, MAX_SUMMARY_CHARS};
pub use url_validator::{validate_url, UrlValidationError};
