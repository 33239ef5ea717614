//! Configuration Module - Heap Layout and Logging Parameters
//!
//! Manages all configuration parameters for SGC. The collector has no tuning
//! knobs beyond heap sizing: it is single-threaded and stop-the-world, so the
//! only trade-off left to the host is footprint.

use serde::{Deserialize, Serialize};

/// Main configuration for the semispace collector
///
/// # Examples
///
/// ```rust
/// use sgc::GcConfig;
///
/// let config = GcConfig {
///     max_heap_size: 64 * 1024 * 1024,
///     verbose: true,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcConfig {
    /// Minimum heap size in bytes
    ///
    /// Half of it is the initial soft allocation limit of the active
    /// semispace; the limit never drops below that after a collection.
    /// Default: 16MB
    pub min_heap_size: usize,

    /// Maximum heap size in bytes
    ///
    /// Split evenly between the two semispaces. Allocation fails with
    /// out-of-memory once the active semispace cannot hold the live set plus
    /// the request.
    /// Default: 256MB
    pub max_heap_size: usize,

    /// Size of the permanent region holding class descriptors
    ///
    /// Default: 4MB
    pub class_region_size: usize,

    /// Size of the permanent region holding pre-initialized image objects
    ///
    /// Default: 8MB
    pub image_region_size: usize,

    /// Size of the permanent region holding interned string data
    ///
    /// Default: 4MB
    pub string_region_size: usize,

    /// Object alignment in bytes
    ///
    /// Every allocation is rounded up to this, and it is the granule of the
    /// mark bitmap. Must be a power of two and at least 8.
    /// Default: 8
    pub object_alignment: usize,

    /// Lowest address the collector accepts as a reference
    ///
    /// Anything below is reported as heap corruption.
    /// Default: 4096
    pub min_sane_address: usize,

    /// Enable verbose GC logging
    ///
    /// Default: false
    pub verbose: bool,

    /// Record GC events in the runtime's event log
    ///
    /// Default: true
    pub log_events: bool,

    /// Emit logged events as JSON lines instead of human-readable text
    ///
    /// Default: false
    pub json_events: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            min_heap_size: 16 * MB,
            max_heap_size: 256 * MB,
            class_region_size: 4 * MB,
            image_region_size: 8 * MB,
            string_region_size: 4 * MB,
            object_alignment: 8,
            min_sane_address: 4 * KB,
            verbose: false,
            log_events: true,
            json_events: false,
        }
    }
}

impl GcConfig {
    /// Validate configuration
    ///
    /// Returns Ok(()) if configuration is valid, Err with message otherwise.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.object_alignment.is_power_of_two() || self.object_alignment < 8 {
            return Err(ConfigError::InvalidAlignment(self.object_alignment));
        }

        let page = crate::heap::page::page_size();
        if self.max_heap_size < 2 * page {
            return Err(ConfigError::InvalidHeapSize(format!(
                "max_heap_size ({}) must hold two pages ({})",
                self.max_heap_size,
                2 * page
            )));
        }

        if self.min_heap_size == 0 {
            return Err(ConfigError::InvalidHeapSize(
                "min_heap_size must be non-zero".to_string(),
            ));
        }

        if self.min_heap_size > self.max_heap_size {
            return Err(ConfigError::InvalidHeapSize(format!(
                "min_heap_size ({}) > max_heap_size ({})",
                self.min_heap_size, self.max_heap_size
            )));
        }

        for (name, size) in [
            ("class_region_size", self.class_region_size),
            ("image_region_size", self.image_region_size),
            ("string_region_size", self.string_region_size),
        ] {
            if size == 0 {
                return Err(ConfigError::InvalidRegionSize(format!(
                    "{} must be non-zero",
                    name
                )));
            }
        }

        if self.min_sane_address == 0 {
            return Err(ConfigError::InvalidSaneAddress(self.min_sane_address));
        }

        Ok(())
    }

    /// Create configuration from environment variables
    ///
    /// Supported variables:
    /// - `SGC_MIN_HEAP`, `SGC_MAX_HEAP` - heap bounds, with optional K/M/G suffix
    /// - `SGC_CLASS_REGION`, `SGC_IMAGE_REGION`, `SGC_STRING_REGION` - permanent region sizes
    /// - `SGC_ALIGNMENT` - object alignment
    /// - `SGC_VERBOSE` - enable verbose logging
    /// - `SGC_LOG_JSON` - log events as JSON
    ///
    /// Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        let size_vars: [(&str, &mut usize); 6] = [
            ("SGC_MIN_HEAP", &mut config.min_heap_size),
            ("SGC_MAX_HEAP", &mut config.max_heap_size),
            ("SGC_CLASS_REGION", &mut config.class_region_size),
            ("SGC_IMAGE_REGION", &mut config.image_region_size),
            ("SGC_STRING_REGION", &mut config.string_region_size),
            ("SGC_ALIGNMENT", &mut config.object_alignment),
        ];
        for (name, field) in size_vars {
            if let Some(size) = std::env::var(name).ok().and_then(|v| parse_size(&v)) {
                *field = size;
            }
        }

        if let Ok(val) = std::env::var("SGC_VERBOSE") {
            config.verbose = parse_flag(&val);
        }

        if let Ok(val) = std::env::var("SGC_LOG_JSON") {
            config.json_events = parse_flag(&val);
        }

        config
    }

    /// Capacity of one semispace before page rounding
    pub fn semispace_size(&self) -> usize {
        self.max_heap_size / 2
    }
}

/// Error types for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid heap size: {0}")]
    InvalidHeapSize(String),

    #[error("Invalid region size: {0}")]
    InvalidRegionSize(String),

    #[error("Invalid object alignment: {0} (must be a power of two >= 8)")]
    InvalidAlignment(usize),

    #[error("Invalid minimum sane address: {0:#x}")]
    InvalidSaneAddress(usize),
}

// ============================================================================
// CONSTANTS & HELPERS
// ============================================================================

pub const KB: usize = 1024;
pub const MB: usize = 1024 * 1024;
pub const GB: usize = 1024 * 1024 * 1024;

/// Parse a byte count with an optional `K`, `M` or `G` suffix.
fn parse_size(value: &str) -> Option<usize> {
    let value = value.trim();
    let (digits, unit) = match value.chars().last()? {
        'k' | 'K' => (&value[..value.len() - 1], KB),
        'm' | 'M' => (&value[..value.len() - 1], MB),
        'g' | 'G' => (&value[..value.len() - 1], GB),
        _ => (value, 1),
    };
    digits.trim().parse::<usize>().ok()?.checked_mul(unit)
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}
