//! Core type system and error handling for vaultshift
//!
//! This crate provides the foundational types shared by every vaultshift crate:
//!
//! - **Error handling**: a classified error taxonomy that drives retry decisions
//! - **Core types**: inventory items, copy jobs and their remote statuses
//! - **Traits**: the async boundary to the backup service and its credentials
//! - **Configuration**: validated value types such as [`WorkerCount`]
//!
//! # Examples
//!
//! ```rust
//! use vaultshift_types::{Error, ErrorKind, Item};
//!
//! let item = Item::new("arn:rp:1", "arn:volume:1");
//! assert!(item.is_copyable());
//!
//! let error = Error::from_service_code("ThrottlingException", "slow down");
//! assert_eq!(error.kind(), ErrorKind::Transient);
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod result;
pub mod traits;
pub mod types;

// Re-export commonly used types
pub use config::{RetryConfig, WorkerCount};
pub use error::{Error, ErrorKind, ErrorSeverity};
pub use result::Result;
pub use traits::*;
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_all_filter() {
        let item = Item::new("arn:rp:1", "arn:vol:1");
        assert!(AcceptAll.evaluate(&item).is_included());
    }

    #[test]
    fn test_error_severity() {
        let io_error = Error::from(std::io::Error::new(std::io::ErrorKind::NotFound, "test"));
        assert_eq!(io_error.severity(), ErrorSeverity::High);

        let config_error = Error::config("invalid config");
        assert_eq!(config_error.severity(), ErrorSeverity::Critical);
        assert!(!config_error.is_recoverable());
    }

    #[test]
    fn test_default_worker_count() {
        assert_eq!(WorkerCount::default().get(), 10);
    }
}
