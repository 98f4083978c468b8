use crate::types::OpTime;

/// Read isolation requested by a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadConcernLevel {
    /// Newest local data.
    Local,
    /// Majority-committed data.
    Majority,
    /// Linearizable reads.
    Linearizable,
    /// A stable snapshot held across statements.
    Snapshot,
    /// Whatever is available, including orphans.
    Available,
}

/// Read concern of the current operation.
///
/// Empty when the command did not specify one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadConcernArgs {
    level: Option<ReadConcernLevel>,
    after_cluster_time: Option<OpTime>,
}

impl ReadConcernArgs {
    /// Read concern with an explicit level.
    #[must_use]
    pub const fn new(level: ReadConcernLevel) -> Self {
        Self {
            level: Some(level),
            after_cluster_time: None,
        }
    }

    /// Requires reads to observe `op_time`.
    #[must_use]
    pub const fn with_after_cluster_time(mut self, op_time: OpTime) -> Self {
        self.after_cluster_time = Some(op_time);
        self
    }

    /// True if nothing was specified.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.level.is_none() && self.after_cluster_time.is_none()
    }

    /// Effective level; local when unspecified.
    #[must_use]
    pub fn level(&self) -> ReadConcernLevel {
        self.level.unwrap_or(ReadConcernLevel::Local)
    }

    /// Cluster time reads must observe.
    #[must_use]
    pub const fn after_cluster_time(&self) -> Option<OpTime> {
        self.after_cluster_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_empty_local() {
        let rc = ReadConcernArgs::default();
        assert!(rc.is_empty());
        assert_eq!(rc.level(), ReadConcernLevel::Local);
    }

    #[test]
    fn explicit_level_is_not_empty() {
        let rc = ReadConcernArgs::new(ReadConcernLevel::Snapshot);
        assert!(!rc.is_empty());
        assert_eq!(rc.level(), ReadConcernLevel::Snapshot);
        assert!(!ReadConcernArgs::default()
            .with_after_cluster_time(OpTime::new(1, 1))
            .is_empty());
    }
}
