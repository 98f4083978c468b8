//! Engine configuration.

use std::time::Duration;

/// Configuration for opening a [`StorageEngine`](crate::StorageEngine).
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether to create the data directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Whether to flush the oplog and transaction table on every commit.
    pub sync_on_commit: bool,

    /// Number of execution tickets; bounds concurrently running operations.
    pub execution_tickets: usize,

    /// How long a ticket wait sleeps before re-checking for interruption.
    pub ticket_wait_slice: Duration,

    /// Log format version written into every record header.
    pub format_version: (u16, u16),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            sync_on_commit: true,
            execution_tickets: 128,
            ticket_wait_slice: Duration::from_millis(100),
            format_version: (1, 0),
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the data directory if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether to sync logs on every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets the number of execution tickets.
    #[must_use]
    pub const fn execution_tickets(mut self, count: usize) -> Self {
        self.execution_tickets = count;
        self
    }

    /// Sets the interrupt polling interval for ticket waits.
    #[must_use]
    pub const fn ticket_wait_slice(mut self, slice: Duration) -> Self {
        self.ticket_wait_slice = slice;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(config.create_if_missing);
        assert!(config.sync_on_commit);
        assert_eq!(config.execution_tickets, 128);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .create_if_missing(false)
            .sync_on_commit(false)
            .execution_tickets(2)
            .ticket_wait_slice(Duration::from_millis(5));

        assert!(!config.create_if_missing);
        assert!(!config.sync_on_commit);
        assert_eq!(config.execution_tickets, 2);
        assert_eq!(config.ticket_wait_slice, Duration::from_millis(5));
    }
}
