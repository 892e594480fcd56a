//! Utility functions shared by the fetcher, parser and discovery code.
//!
//! - **URL validation**: scheme/credential checks and the private-host policy
//! - **Text processing**: control-character stripping for feed-supplied labels

mod text;
mod url_validator;

pub use text::{clean_label, collapse_whitespace, strip_control_chars};
pub use url_validator::{with_default_scheme, UrlPolicy, UrlValidationError};
