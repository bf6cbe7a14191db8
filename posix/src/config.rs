//! Server configuration.
//!
//! Values here control the initial filesystem view handed to init, pid
//! numbering and which diagnostic traces are emitted.

use alloc::string::String;
use serde::{Deserialize, Serialize};

use crate::process::Pid;

/// Page size of every supported target (4 KB).
pub const PAGE_SIZE: u64 = 0x1000;

/// Pid reserved for the init process.
pub const INIT_PID: Pid = 1;

/// Runtime configuration of one subsystem instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Root directory of the init process.
    pub root_path: String,
    /// Umask of the init process.
    pub default_umask: u32,
    /// First pid handed out by fork/clone.
    pub first_pid: Pid,
    /// Trace destruction of contexts, generations and processes.
    pub log_cleanup: bool,
    /// Trace signal frame setup and restore.
    pub log_signals: bool,
    /// Trace descriptor attach/close.
    pub log_file_attach: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            root_path: String::from("/"),
            default_umask: 0o022,
            first_pid: INIT_PID + 1,
            log_cleanup: false,
            log_signals: false,
            log_file_attach: false,
        }
    }
}

impl ServerConfig {
    /// Parse a configuration from TOML text. Missing keys take their defaults.
    #[cfg(feature = "std")]
    pub fn from_toml_str(text: &str) -> crate::Result<Self> {
        use alloc::string::ToString;

        let config: ServerConfig =
            toml::from_str(text).map_err(|e| crate::Error::InvalidConfig(e.to_string()))?;
        if config.first_pid <= INIT_PID {
            return Err(crate::Error::InvalidConfig(alloc::format!(
                "first_pid must be greater than {}",
                INIT_PID
            )));
        }
        Ok(config)
    }
}
