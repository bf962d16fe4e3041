//! Result type alias for vaultshift operations

use crate::Error;

/// Result type alias for vaultshift operations
pub type Result<T> = std::result::Result<T, Error>;
