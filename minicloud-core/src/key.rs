use crate::error::{MiniCloudError, Result};

pub const MAX_KEY_LEN: usize = 1024;

/// Normalize a caller supplied key into `/`-separated relative components.
///
/// Leading and trailing slashes are dropped. Empty, `.` and `..` components
/// are rejected rather than resolved, so a normalized key can always be
/// joined under a storage root without leaving it.
pub fn normalize_key(key: &str) -> Result<String> {
    if key.len() > MAX_KEY_LEN {
        return Err(MiniCloudError::InvalidKey(format!(
            "key exceeds {} bytes",
            MAX_KEY_LEN
        )));
    }

    let trimmed = key.trim_matches('/');
    if trimmed.is_empty() {
        return Err(MiniCloudError::InvalidKey("key cannot be empty".to_string()));
    }

    if trimmed.contains('\\') || trimmed.contains('\0') {
        return Err(MiniCloudError::InvalidKey(format!(
            "key contains a forbidden character: {:?}",
            key
        )));
    }

    let mut components = Vec::new();
    for component in trimmed.split('/') {
        if component.is_empty() || component == "." || component == ".." {
            return Err(MiniCloudError::InvalidKey(format!(
                "invalid key component: {:?}",
                component
            )));
        }
        components.push(component);
    }

    Ok(components.join("/"))
}
