//! parcel-core - Core library for Parcel
//!
//! Signed download links, the chunked relay upload protocol, the backend
//! auth handshake, and the download routing decision shared by the API
//! service and the operator CLI.

pub mod auth;
pub mod backend;
pub mod catalog;
pub mod download;
pub mod error;
pub mod events;
pub mod models;
pub mod signing;
pub mod upload;
pub mod util;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use error::{Error, Result};
pub use models::{AuthorizedIdentity, Destination, FileMetadata, StorageLocation, StoredFile};
