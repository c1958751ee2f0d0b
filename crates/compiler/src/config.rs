//! Driver configuration
//!
//! Optional TOML configuration for the driver: extra include search paths,
//! predefined macros, and whether to keep intermediate assembly. Settings
//! given on the command line are merged on top of the file.
//!
//! ```toml
//! include_paths = ["vendor/include"]
//! defines = ["DEBUG", "LEVEL=2"]
//! keep_asm = false
//! ```

use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct DriverConfig {
    /// Extra include search directories, tried in order
    #[serde(default)]
    pub include_paths: Vec<PathBuf>,
    /// Predefined macros: `NAME` or `NAME=VALUE`
    #[serde(default)]
    pub defines: Vec<String>,
    /// Keep the intermediate `.s` file next to each input
    #[serde(default)]
    pub keep_asm: bool,
}

impl DriverConfig {
    pub fn new() -> DriverConfig {
        DriverConfig::default()
    }

    pub fn from_toml(content: &str) -> Result<DriverConfig, String> {
        toml::from_str(content).map_err(|e| format!("invalid configuration: {}", e))
    }

    /// Merge another configuration on top of this one. Lists append (the
    /// other's entries after ours, so they win position conflicts) and
    /// boolean flags combine with OR.
    pub fn merge(&mut self, other: DriverConfig) {
        self.include_paths.extend(other.include_paths);
        self.defines.extend(other.defines);
        self.keep_asm |= other.keep_asm;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_toml() {
        let cfg = DriverConfig::from_toml(
            "include_paths = [\"inc\"]\ndefines = [\"DEBUG\", \"N=2\"]\nkeep_asm = true\n",
        )
        .unwrap();
        assert_eq!(cfg.include_paths, vec![PathBuf::from("inc")]);
        assert_eq!(cfg.defines, vec!["DEBUG", "N=2"]);
        assert!(cfg.keep_asm);
    }

    #[test]
    fn test_from_toml_defaults() {
        let cfg = DriverConfig::from_toml("").unwrap();
        assert_eq!(cfg, DriverConfig::default());
    }

    #[test]
    fn test_from_toml_rejects_garbage() {
        assert!(DriverConfig::from_toml("include_paths = 3").is_err());
    }

    #[test]
    fn test_merge() {
        let mut base = DriverConfig {
            include_paths: vec![PathBuf::from("a")],
            defines: vec!["X".to_string()],
            keep_asm: false,
        };
        base.merge(DriverConfig {
            include_paths: vec![PathBuf::from("b")],
            defines: vec!["Y=1".to_string()],
            keep_asm: true,
        });
        assert_eq!(
            base.include_paths,
            vec![PathBuf::from("a"), PathBuf::from("b")]
        );
        assert_eq!(base.defines, vec!["X", "Y=1"]);
        assert!(base.keep_asm);
    }
}
