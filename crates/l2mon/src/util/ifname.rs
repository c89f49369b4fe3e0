//! Interface name and index utilities.

use std::path::Path;

use super::addr::MacAddr;

/// Maximum interface name length (including null terminator).
pub const IFNAMSIZ: usize = 16;

/// Error type for interface operations.
#[derive(Debug, thiserror::Error)]
pub enum IfError {
    #[error("interface not found: {0}")]
    NotFound(String),

    #[error("invalid interface name: {0}")]
    InvalidName(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, IfError>;

/// Validate an interface name.
pub fn validate(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(IfError::InvalidName("empty name".to_string()));
    }

    if name.len() >= IFNAMSIZ {
        return Err(IfError::InvalidName(format!(
            "name too long (max {} chars)",
            IFNAMSIZ - 1
        )));
    }

    if name.contains('/') || name.contains('\0') {
        return Err(IfError::InvalidName(
            "name contains invalid characters".to_string(),
        ));
    }

    if name.chars().any(|c| c.is_whitespace()) {
        return Err(IfError::InvalidName("name contains whitespace".to_string()));
    }

    Ok(())
}

/// Convert an interface name to its index.
pub fn name_to_index(name: &str) -> Result<u32> {
    validate(name)?;
    let path = Path::new("/sys/class/net").join(name).join("ifindex");
    let content = std::fs::read_to_string(&path)
        .map_err(|_| IfError::NotFound(name.to_string()))?;
    content
        .trim()
        .parse::<u32>()
        .map_err(|_| IfError::NotFound(name.to_string()))
}

/// Convert an interface index to its name.
pub fn index_to_name(index: u32) -> Result<String> {
    if index == 0 {
        return Err(IfError::NotFound("index 0".to_string()));
    }

    let entries = std::fs::read_dir("/sys/class/net")?;
    for entry in entries.flatten() {
        let path = entry.path().join("ifindex");
        if let Ok(content) = std::fs::read_to_string(&path)
            && let Ok(idx) = content.trim().parse::<u32>()
            && idx == index
            && let Some(name) = entry.file_name().to_str()
        {
            return Ok(name.to_string());
        }
    }
    Err(IfError::NotFound(format!("index {}", index)))
}

/// Read an interface's hardware address from sysfs.
pub fn hardware_address(name: &str) -> Result<MacAddr> {
    validate(name)?;
    let path = Path::new("/sys/class/net").join(name).join("address");
    let content = std::fs::read_to_string(&path)
        .map_err(|_| IfError::NotFound(name.to_string()))?;
    content
        .trim()
        .parse::<MacAddr>()
        .map_err(|_| IfError::NotFound(name.to_string()))
}
