//! Configuration for the local store.

use datasync_model::DEFAULT_PAGE_LIMIT;

/// Configuration for a [`crate::LocalStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Rows per page when a query does not specify pagination.
    pub default_page_size: usize,
    /// Whether every committed batch is synced to disk before returning.
    pub sync_on_write: bool,
    /// Journal frames after which the journal is rewritten as a snapshot.
    /// `0` disables compaction.
    pub compaction_threshold: usize,
}

impl StoreConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            default_page_size: DEFAULT_PAGE_LIMIT,
            sync_on_write: true,
            compaction_threshold: 1000,
        }
    }

    /// Sets the default page size.
    pub fn with_default_page_size(mut self, size: usize) -> Self {
        self.default_page_size = size;
        self
    }

    /// Sets whether commits are synced to disk.
    pub fn with_sync_on_write(mut self, sync: bool) -> Self {
        self.sync_on_write = sync;
        self
    }

    /// Sets the compaction threshold.
    pub fn with_compaction_threshold(mut self, frames: usize) -> Self {
        self.compaction_threshold = frames;
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_config_builder() {
        let config = StoreConfig::new()
            .with_default_page_size(25)
            .with_sync_on_write(false)
            .with_compaction_threshold(0);
        assert_eq!(config.default_page_size, 25);
        assert!(!config.sync_on_write);
        assert_eq!(config.compaction_threshold, 0);
        assert_eq!(StoreConfig::default().default_page_size, 100);
    }
}
