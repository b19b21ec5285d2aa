/// Configuration for a buffer manager instance.
#[derive(Clone, Debug)]
pub struct BufferConfig {
    /// Maximum number of resident pages. Default: 64.
    pub page_capacity: usize,
    /// Page size as a power of two. Default: 13 (8 KiB pages).
    pub page_size_bits: u32,
}

impl BufferConfig {
    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        1usize << self.page_size_bits
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            page_capacity: 64,
            page_size_bits: 13,
        }
    }
}
