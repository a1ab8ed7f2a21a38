use std::sync::Arc;

use url::Url;

use super::{MemoryObjectStore, ObjectStore};
use crate::Error;

/// Constructs a new instance of an [ObjectStore] from an URI.
///
/// The following schemes are supported by the following services:
/// - `memory://` ([MemoryObjectStore])
pub fn from_addr(uri: &str) -> Result<Arc<dyn ObjectStore>, Error> {
    let url =
        Url::parse(uri).map_err(|e| Error::StorageError(format!("unable to parse url: {}", e)))?;

    match url.scheme() {
        "memory" => {
            // memory doesn't support host or path in the URL.
            if url.has_host() || !url.path().is_empty() {
                return Err(Error::StorageError("invalid url".to_string()));
            }
            Ok(Arc::new(MemoryObjectStore::default()))
        }
        scheme => Err(Error::StorageError(format!(
            "unknown scheme: {}",
            scheme
        ))),
    }
}
