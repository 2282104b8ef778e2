//! Tunable connection limits.

/// Limits applied to each served connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Largest accepted request header block in bytes. CONNECT requests
    /// declaring a bigger HEADERS frame are aborted.
    pub max_field_section_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            max_field_section_size: 16 * 1024,
        }
    }
}
