//! Configuration for areastore
//!
//! Centralized configuration with sensible defaults.

use flate2::Compression;

use crate::area::RestructureMode;
use crate::record::payload::SERIALIZER_VERSION;

/// Configuration shared by every area file of an instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // I/O Configuration
    // -------------------------------------------------------------------------
    /// Buffer size used when scanning and rewriting area files (in bytes)
    pub io_buffer_size: usize,

    /// fsync the area file at the end of every flush
    pub sync_on_flush: bool,

    // -------------------------------------------------------------------------
    // Record Configuration
    // -------------------------------------------------------------------------
    /// Payload serializer version written into newly created areas
    pub serializer_version: u16,

    /// Deflate level for record payloads (0-9)
    pub compression_level: u32,

    // -------------------------------------------------------------------------
    // Maintenance Configuration
    // -------------------------------------------------------------------------
    /// Mode used by `FileManager::restructure_all`
    pub restructure_mode: RestructureMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            io_buffer_size: 64 * 1024, // 64 KB
            sync_on_flush: true,
            serializer_version: SERIALIZER_VERSION,
            compression_level: 6,
            restructure_mode: RestructureMode::RemoveGaps,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    pub(crate) fn compression(&self) -> Compression {
        Compression::new(self.compression_level.min(9))
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the I/O buffer size (in bytes)
    pub fn io_buffer_size(mut self, size: usize) -> Self {
        self.config.io_buffer_size = size;
        self
    }

    /// Enable or disable fsync after flush
    pub fn sync_on_flush(mut self, sync: bool) -> Self {
        self.config.sync_on_flush = sync;
        self
    }

    /// Set the payload serializer version for new areas
    pub fn serializer_version(mut self, version: u16) -> Self {
        self.config.serializer_version = version;
        self
    }

    /// Set the deflate level (clamped to 9)
    pub fn compression_level(mut self, level: u32) -> Self {
        self.config.compression_level = level;
        self
    }

    /// Set the default restructure mode
    pub fn restructure_mode(mut self, mode: RestructureMode) -> Self {
        self.config.restructure_mode = mode;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
