//! Configuration for the sync engine.

use crate::error::{SyncError, SyncResult};
use tablesync_protocol::{is_system_table, SYSTEM_PROPERTIES};

/// Default number of records requested per pull page.
pub const DEFAULT_PULL_PAGE_SIZE: usize = 50;

/// Default cap on re-pushes of one operation within a single push.
pub const DEFAULT_MAX_HANDLER_RETRIES: u32 = 5;

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Records requested per pull page.
    pub pull_page_size: usize,
    /// How often one operation may be re-pushed after its failure was
    /// handled, within a single push call. Past the cap the failure is
    /// treated as unhandled.
    pub max_handler_retries: u32,
    /// Name of the operation log table.
    pub operation_table: String,
    /// Name of the table holding pull checkpoints.
    pub config_table: String,
    /// Server-owned properties stripped from insert payloads.
    pub system_properties: Vec<String>,
}

impl SyncConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self {
            pull_page_size: DEFAULT_PULL_PAGE_SIZE,
            max_handler_retries: DEFAULT_MAX_HANDLER_RETRIES,
            operation_table: "__operations".into(),
            config_table: "__config".into(),
            system_properties: SYSTEM_PROPERTIES.iter().map(|p| p.to_string()).collect(),
        }
    }

    /// Sets the pull page size.
    pub fn with_pull_page_size(mut self, size: usize) -> Self {
        self.pull_page_size = size;
        self
    }

    /// Sets the handler retry cap.
    pub fn with_max_handler_retries(mut self, retries: u32) -> Self {
        self.max_handler_retries = retries;
        self
    }

    /// Sets the operation log table name.
    pub fn with_operation_table(mut self, name: impl Into<String>) -> Self {
        self.operation_table = name.into();
        self
    }

    /// Sets the checkpoint table name.
    pub fn with_config_table(mut self, name: impl Into<String>) -> Self {
        self.config_table = name.into();
        self
    }

    /// Replaces the list of server-owned properties.
    pub fn with_system_properties<I, P>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.system_properties = properties.into_iter().map(Into::into).collect();
        self
    }

    /// Checks the configuration for unusable values.
    ///
    /// # Errors
    ///
    /// Fails if the page size is zero or a system table name is not
    /// reserved (`__` prefix) or both system tables share a name.
    pub fn validate(&self) -> SyncResult<()> {
        if self.pull_page_size == 0 {
            return Err(SyncError::InvalidQuery(
                "pull page size must be at least 1".into(),
            ));
        }
        for name in [&self.operation_table, &self.config_table] {
            if !is_system_table(name) || name.len() <= 2 {
                return Err(SyncError::InvalidTableName(name.clone()));
            }
        }
        if self.operation_table == self.config_table {
            return Err(SyncError::InvalidTableName(self.config_table.clone()));
        }
        Ok(())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new()
            .with_pull_page_size(10)
            .with_max_handler_retries(2)
            .with_operation_table("__ops")
            .with_config_table("__cfg")
            .with_system_properties(["version"]);

        assert_eq!(config.pull_page_size, 10);
        assert_eq!(config.max_handler_retries, 2);
        assert_eq!(config.operation_table, "__ops");
        assert_eq!(config.config_table, "__cfg");
        assert_eq!(config.system_properties, vec!["version".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.pull_page_size, 50);
        assert_eq!(config.max_handler_retries, 5);
        assert_eq!(config.operation_table, "__operations");
        assert_eq!(config.config_table, "__config");
        assert!(config.system_properties.iter().any(|p| p == "updatedAt"));
    }

    #[test]
    fn rejects_unusable_settings() {
        assert!(SyncConfig::new().with_pull_page_size(0).validate().is_err());
        assert!(SyncConfig::new()
            .with_operation_table("operations")
            .validate()
            .is_err());
        assert!(SyncConfig::new()
            .with_config_table("__operations")
            .validate()
            .is_err());
    }
}
