use color_eyre::Result;
use color_eyre::eyre::eyre;
use std::path::PathBuf;

/// Contains configuration options for the renderer like the window size, vsync, and other settings
#[derive(Debug, Clone)]
pub struct RenderConfig {
    pub window_title: String,
    pub window_width: u32,
    pub window_height: u32,
    /// Forces FIFO presentation instead of preferring mailbox
    pub vsync: bool,
    pub enable_validation: bool,
    /// Capacity of the shared material descriptor pool
    pub max_materials: u32,
    pub shader_dir: PathBuf,
    pub asset_dir: PathBuf,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            window_title: String::from("vkdemo"),
            window_width: 1280,
            window_height: 720,
            vsync: false,
            enable_validation: cfg!(debug_assertions),
            max_materials: 7,
            shader_dir: PathBuf::from("shaders-built"),
            asset_dir: PathBuf::from("resources"),
        }
    }
}

impl RenderConfig {
    pub const VSYNC_VAR: &'static str = "VKDEMO_VSYNC";
    pub const VALIDATION_VAR: &'static str = "VKDEMO_VALIDATION";
    pub const MAX_MATERIALS_VAR: &'static str = "VKDEMO_MAX_MATERIALS";

    /// Defaults overlaid with `VKDEMO_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(value) = lookup(Self::VSYNC_VAR) {
            config.vsync = parse_flag(Self::VSYNC_VAR, &value)?;
        }
        if let Some(value) = lookup(Self::VALIDATION_VAR) {
            config.enable_validation = parse_flag(Self::VALIDATION_VAR, &value)?;
        }
        if let Some(value) = lookup(Self::MAX_MATERIALS_VAR) {
            let max_materials = value
                .trim()
                .parse::<u32>()
                .map_err(|e| eyre!("{}={:?} is not a material count: {}", Self::MAX_MATERIALS_VAR, value, e))?;
            if max_materials == 0 {
                return Err(eyre!("{} must be at least 1", Self::MAX_MATERIALS_VAR));
            }
            config.max_materials = max_materials;
        }

        log::debug!("{:?}", config);
        Ok(config)
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        _ => Err(eyre!("{}={:?} is not a boolean", key, value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_demo_setup() {
        let config = RenderConfig::default();
        assert_eq!((config.window_width, config.window_height), (1280, 720));
        assert_eq!(config.max_materials, 7);
        assert!(!config.vsync);
    }

    #[test]
    fn env_overrides_are_applied() {
        let config = RenderConfig::from_lookup(lookup(&[
            (RenderConfig::VSYNC_VAR, "on"),
            (RenderConfig::VALIDATION_VAR, "0"),
            (RenderConfig::MAX_MATERIALS_VAR, " 12 "),
        ]))
        .unwrap();

        assert!(config.vsync);
        assert!(!config.enable_validation);
        assert_eq!(config.max_materials, 12);
    }

    #[test]
    fn malformed_values_are_rejected() {
        assert!(RenderConfig::from_lookup(lookup(&[(RenderConfig::VSYNC_VAR, "maybe")])).is_err());
        assert!(RenderConfig::from_lookup(lookup(&[(RenderConfig::MAX_MATERIALS_VAR, "-3")])).is_err());
        assert!(RenderConfig::from_lookup(lookup(&[(RenderConfig::MAX_MATERIALS_VAR, "0")])).is_err());
    }
}
