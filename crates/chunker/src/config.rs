use serde::{Deserialize, Serialize};

/// Largest rolling window the chunker supports
pub(crate) const MAX_WINDOW_SIZE: usize = 64;

/// Configuration for content-defined chunking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    /// Lower bound below which boundaries are not accepted
    pub min_size: usize,

    /// Expected average atom size; drives the boundary mask
    pub target_size: usize,

    /// Forced cut if no boundary is found before this size
    pub max_size: usize,

    /// Rolling hash window in bytes
    pub window_size: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            min_size: 2 * 1024,
            target_size: 8 * 1024,
            max_size: 64 * 1024,
            window_size: 48,
        }
    }
}

impl ChunkerConfig {
    /// Small atoms, useful for tests and for stores full of short text files
    pub fn small() -> Self {
        Self {
            min_size: 64,
            target_size: 256,
            max_size: 1024,
            window_size: 16,
        }
    }

    /// Boundary mask: `2^floor(log2(target_size)) - 1`
    pub(crate) fn mask(&self) -> u64 {
        let bits = usize::BITS - 1 - self.target_size.max(1).leading_zeros();
        (1u64 << bits) - 1
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.min_size == 0 {
            return Err("min_size must be > 0".to_string());
        }

        if self.min_size > self.target_size {
            return Err(format!(
                "min_size ({}) cannot exceed target_size ({})",
                self.min_size, self.target_size
            ));
        }

        if self.target_size > self.max_size {
            return Err(format!(
                "target_size ({}) cannot exceed max_size ({})",
                self.target_size, self.max_size
            ));
        }

        if self.window_size == 0 || self.window_size > MAX_WINDOW_SIZE {
            return Err(format!(
                "window_size ({}) must be within 1..={MAX_WINDOW_SIZE}",
                self.window_size
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = ChunkerConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_preset_configs_valid() {
        assert!(ChunkerConfig::small().validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = ChunkerConfig::default();

        // Invalid: min > target
        config.min_size = 10_000;
        config.target_size = 5_000;
        assert!(config.validate().is_err());

        // Invalid: target > max
        config.min_size = 512;
        config.target_size = 200_000;
        config.max_size = 100_000;
        assert!(config.validate().is_err());

        // Invalid: min = 0
        config.min_size = 0;
        config.target_size = 1024;
        assert!(config.validate().is_err());

        // Invalid: window too wide
        config.min_size = 512;
        config.window_size = 65;
        assert!(config.validate().is_err());

        // Valid configuration
        config.window_size = 32;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_mask_rounds_target_down_to_power_of_two() {
        let mut config = ChunkerConfig::default();
        config.target_size = 8192;
        assert_eq!(config.mask(), 8191);

        config.target_size = 9000;
        assert_eq!(config.mask(), 8191);

        config.target_size = 1;
        assert_eq!(config.mask(), 0);
    }

    #[test]
    fn test_partial_toml_style_input_uses_defaults() {
        let config: ChunkerConfig = serde_json::from_str(r#"{"target_size": 4096}"#).unwrap();
        assert_eq!(config.target_size, 4096);
        assert_eq!(config.min_size, ChunkerConfig::default().min_size);
    }
}
