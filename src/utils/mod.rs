pub mod url_validation;
pub use url_validation::{UrlValidationError, parse_fetch_url, validate_fetch_url};
