//! Persistent device identity.

use tracing::{info, warn};
use uuid::Uuid;

use crate::storage::Storage;

/// Storage key of the device key.
pub const DEVICE_KEY_STORAGE_KEY: &str = "sitepulse.device_key";

const DEVICE_KEY_PREFIX: &str = "device-";

/// Returns the device key stored in `storage`, generating and persisting
/// one on first use.
///
/// If storage is unavailable a fresh key is returned; it then only lives as
/// long as the caller keeps it.
pub fn device_key(storage: &dyn Storage) -> String {
    match storage.get(DEVICE_KEY_STORAGE_KEY) {
        Ok(Some(key)) if !key.is_empty() => return key,
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Device key unreadable; generating a new one"),
    }

    let key = format!("{DEVICE_KEY_PREFIX}{}", Uuid::new_v4());
    match storage.set(DEVICE_KEY_STORAGE_KEY, &key) {
        Ok(()) => info!(device = %key, "Generated device key"),
        Err(e) => warn!(error = %e, "Device key not persisted"),
    }
    key
}
