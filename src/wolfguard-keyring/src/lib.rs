//! # wolfguard-keyring
//!
//! Async key-value persistence for the WolfGuard trust layer.
//!
//! Every component above this crate (encrypted preferences, TOTP secrets,
//! the activity log, cached license records) persists through the
//! [`KeyValueStore`] trait. Backends never see plaintext for sensitive
//! entries; sealing happens in `wolfguard-core`.
//!
//! ## Backends
//!
//! | Backend | Feature | Persistence | Enumerable |
//! |---------|---------|-------------|------------|
//! | [`MemoryStore`] | always | process lifetime | yes |
//! | [`FileStore`] | `file-storage` (default) | single JSON document | yes |
//! | `OsKeyringStore` | `keyring-storage` | OS credential manager | via index |
//!
//! ## Usage
//!
//! ```rust,ignore
//! use wolfguard_keyring::{FileStore, KeyValueStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = FileStore::open("/var/lib/wolfguard").await?;
//!     store.set("secure_license_info", "<envelope>").await?;
//!     let value = store.get("secure_license_info").await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)] // Too strict for production code
#![allow(clippy::doc_markdown)] // Allow product names without backticks
#![allow(clippy::missing_errors_doc)] // Error documentation not required
#![allow(clippy::module_name_repetitions)] // Allow Type in module::Type
#![allow(clippy::must_use_candidate)] // Not all functions need must_use

mod error;
mod memory;
mod store;

#[cfg(feature = "file-storage")]
mod file;

/// OS keyring integration for cross-platform credential storage.
#[cfg(feature = "keyring-storage")]
pub mod keyring_storage;

pub use error::KeyringError;
pub use memory::MemoryStore;
pub use store::{KeyValueStore, StorageBackend};

#[cfg(feature = "file-storage")]
pub use file::{FileStore, STORE_FILE_NAME};

#[cfg(feature = "keyring-storage")]
pub use keyring_storage::OsKeyringStore;
