//! Engine configuration types.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::PrecodeError;
use crate::loader::LoaderHeapConfig;
use crate::precode::{Isa, PrecodeCapabilities};

/// Which capability table the engine lays precodes out for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IsaMode {
    /// The ISA this binary was built for
    #[default]
    Host,
    X86_64,
    Aarch64,
}

impl IsaMode {
    pub fn isa(self) -> Isa {
        match self {
            IsaMode::Host => Isa::host(),
            IsaMode::X86_64 => Isa::X86_64,
            IsaMode::Aarch64 => Isa::Aarch64,
        }
    }
}

/// Engine configuration, usually read from `precode.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub isa: IsaMode,
    pub heap: LoaderHeapConfig,
    /// Log every allocation and retarget
    pub trace: bool,
}

impl EngineConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, PrecodeError> {
        let config: EngineConfig = toml::from_str(content)
            .map_err(|e| PrecodeError::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self, PrecodeError> {
        let content = fs::read_to_string(path).map_err(|e| {
            PrecodeError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Serialize back to TOML.
    pub fn to_toml_string(&self) -> Result<String, PrecodeError> {
        toml::to_string_pretty(self)
            .map_err(|e| PrecodeError::Config(format!("failed to serialize config: {}", e)))
    }

    fn validate(&self) -> Result<(), PrecodeError> {
        let block = self.heap.block_size;
        if block == 0 || !block.is_power_of_two() {
            return Err(PrecodeError::Config(format!(
                "heap.block_size must be a non-zero power of two, got {}",
                block
            )));
        }
        Ok(())
    }

    /// The capability table selected by `isa`.
    pub fn capabilities(&self) -> &'static PrecodeCapabilities {
        PrecodeCapabilities::for_isa(self.isa.isa())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.isa, IsaMode::Host);
        assert_eq!(config.heap.block_size, 64 * 1024);
        assert!(!config.heap.executable);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = EngineConfig::from_toml_str(
            r#"
isa = "aarch64"
trace = true

[heap]
executable = true
"#,
        )
        .unwrap();
        assert_eq!(config.isa, IsaMode::Aarch64);
        assert!(config.trace);
        assert!(config.heap.executable);
        assert_eq!(config.heap.block_size, 64 * 1024);
        assert_eq!(config.capabilities().isa, Isa::Aarch64);
    }

    #[test]
    fn test_rejects_bad_block_size() {
        let err = EngineConfig::from_toml_str("[heap]\nblock_size = 1000\n").unwrap_err();
        assert!(matches!(err, PrecodeError::Config(_)));
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = EngineConfig::default();
        config.isa = IsaMode::X86_64;
        let text = config.to_toml_string().unwrap();
        let parsed = EngineConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed.isa, IsaMode::X86_64);
    }
}
