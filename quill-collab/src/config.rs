//! Session and hub configuration.

/// Per-document session configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Name of the shared array holding content nodes
    pub content_name: String,
    /// Text of the paragraph inserted into an empty document after first sync
    pub seed_text: String,
    /// Stored update count above which persistence merges its log
    pub compaction_threshold: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            content_name: "content".to_string(),
            seed_text: "New Value!".to_string(),
            compaction_threshold: 500,
        }
    }
}

impl SessionConfig {
    /// Small compaction threshold so tests exercise the merge path.
    pub fn for_testing() -> Self {
        Self {
            compaction_threshold: 4,
            ..Self::default()
        }
    }
}

/// In-process hub configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    /// Upper bound on deliveries handled by a single `pump()` call
    pub max_deliveries_per_pump: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_deliveries_per_pump: 100_000,
        }
    }
}

impl HubConfig {
    pub fn for_testing() -> Self {
        Self {
            max_deliveries_per_pump: 10_000,
        }
    }
}
