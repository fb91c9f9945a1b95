//! Queue declaration options

use serde::{Deserialize, Serialize};

/// Options used when declaring a queue.
///
/// Two declarations of the same queue name are compatible only when every
/// flag matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueOptions {
    /// Survive a broker restart.
    pub durable: bool,
    /// Delete the queue once its last consumer goes away.
    pub auto_delete: bool,
    /// Usable by the declaring connection only; deleted when it closes.
    #[serde(default)]
    pub exclusive: bool,
}

impl QueueOptions {
    pub fn durable(durable: bool) -> Self {
        Self {
            durable,
            auto_delete: false,
            exclusive: false,
        }
    }

    /// A queue private to one process, gone when the process is.
    pub fn exclusive() -> Self {
        Self {
            durable: false,
            auto_delete: true,
            exclusive: true,
        }
    }

    pub fn is_compatible_with(&self, other: &QueueOptions) -> bool {
        self == other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_transient() {
        let options = QueueOptions::default();
        assert!(!options.durable);
        assert!(!options.auto_delete);
        assert!(!options.exclusive);
    }

    #[test]
    fn test_compatibility() {
        assert!(QueueOptions::durable(true).is_compatible_with(&QueueOptions::durable(true)));
        assert!(!QueueOptions::durable(true).is_compatible_with(&QueueOptions::durable(false)));
        assert!(!QueueOptions::exclusive().is_compatible_with(&QueueOptions::default()));
    }
}
