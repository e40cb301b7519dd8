use serde::Deserialize;

/// Bulk copy settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CopyConfig {
    /// Maximum number of rows read and written per bulk copy chunk.
    ///
    /// Each chunk is copied in its own unit of work, so a crash loses at most one chunk.
    pub chunk_size: usize,
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self { chunk_size: 1_000 }
    }
}
