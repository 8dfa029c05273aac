//! Utility functions shared by the poller.
//!
//! - **URL validation**: syntax and scheme checks for feed URLs, with an
//!   optional policy that rejects private and loopback hosts (SSRF)
//!
//! # Examples
//!
//! ```
//! use feedsniff::util::{validate_url, HostPolicy};
//!
//! let url = validate_url("https://example.com/feed.xml", HostPolicy::PublicOnly).unwrap();
//! assert_eq!(url.scheme(), "https");
//! ```

mod url_validator;

pub use url_validator::{validate_url, HostPolicy, UrlValidationError};
