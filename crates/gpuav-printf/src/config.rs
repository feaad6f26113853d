use serde::{Deserialize, Serialize};
use tracing::warn;

/// Overrides the per-command output buffer size, in bytes.
pub const BUFFER_SIZE_ENV: &str = "VK_LAYER_PRINTF_BUFFER_SIZE";
/// Prefixes each message with command buffer, pipeline, stage and source context.
pub const VERBOSE_ENV: &str = "VK_LAYER_PRINTF_VERBOSE";
/// Prints messages to stdout instead of the debug callback.
pub const TO_STDOUT_ENV: &str = "VK_LAYER_PRINTF_TO_STDOUT";

pub const DEFAULT_BUFFER_SIZE: u32 = 1024;
pub const DEFAULT_DESCRIPTOR_CHUNK_SIZE: u32 = 512;

/// Smallest buffer that holds the count word plus one header-only record.
const MIN_BUFFER_SIZE: u32 = 4 * 9;

/// Per-device debug printf settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugPrintfConfig {
    /// Size of each per-command output buffer in bytes (multiple of 4).
    pub buffer_size: u32,
    pub verbose: bool,
    pub to_stdout: bool,
    /// Number of descriptor sets per descriptor pool chunk.
    pub descriptor_chunk_size: u32,
}

impl Default for DebugPrintfConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            verbose: false,
            to_stdout: false,
            descriptor_chunk_size: DEFAULT_DESCRIPTOR_CHUNK_SIZE,
        }
    }
}

impl DebugPrintfConfig {
    /// Defaults overridden by the `VK_LAYER_PRINTF_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Applies overrides looked up by variable name.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(raw) = lookup(BUFFER_SIZE_ENV) {
            match raw.trim().parse::<u32>() {
                Ok(size) => self.buffer_size = size,
                Err(err) => {
                    warn!(value = %raw, %err, "ignoring invalid {BUFFER_SIZE_ENV}");
                }
            }
        }
        if let Some(raw) = lookup(VERBOSE_ENV) {
            self.verbose = is_truthy(&raw);
        }
        if let Some(raw) = lookup(TO_STDOUT_ENV) {
            self.to_stdout = is_truthy(&raw);
        }
        self.normalized()
    }

    /// Parses a JSON settings object; missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        let config: Self = serde_json::from_str(json)?;
        Ok(config.normalized())
    }

    /// Rounds the buffer size up to whole words and clamps both sizes to usable minimums.
    pub fn normalized(mut self) -> Self {
        let rounded = self.buffer_size.saturating_add(3) & !3;
        self.buffer_size = rounded.max(MIN_BUFFER_SIZE);
        self.descriptor_chunk_size = self.descriptor_chunk_size.max(1);
        self
    }
}

fn is_truthy(raw: &str) -> bool {
    let v = raw.trim();
    v == "1"
        || v.eq_ignore_ascii_case("true")
        || v.eq_ignore_ascii_case("yes")
        || v.eq_ignore_ascii_case("on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            vars.iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| (*v).to_string())
        }
    }

    #[test]
    fn env_overrides_are_applied() {
        let config = DebugPrintfConfig::default().with_overrides(lookup(&[
            (BUFFER_SIZE_ENV, "4096"),
            (VERBOSE_ENV, "yes"),
            (TO_STDOUT_ENV, "0"),
        ]));
        assert_eq!(config.buffer_size, 4096);
        assert!(config.verbose);
        assert!(!config.to_stdout);
    }

    #[test]
    fn process_environment_is_read() {
        std::env::set_var(BUFFER_SIZE_ENV, "2050");
        std::env::set_var(VERBOSE_ENV, "On");
        std::env::set_var(TO_STDOUT_ENV, "true");
        let config = DebugPrintfConfig::from_env();
        for name in [BUFFER_SIZE_ENV, VERBOSE_ENV, TO_STDOUT_ENV] {
            std::env::remove_var(name);
        }

        assert_eq!(
            config,
            DebugPrintfConfig {
                buffer_size: 2052,
                verbose: true,
                to_stdout: true,
                ..Default::default()
            }
        );
    }

    #[test]
    fn invalid_buffer_size_keeps_default() {
        let config =
            DebugPrintfConfig::default().with_overrides(lookup(&[(BUFFER_SIZE_ENV, "lots")]));
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
    }

    #[test]
    fn buffer_size_is_rounded_and_clamped() {
        let odd = DebugPrintfConfig {
            buffer_size: 1025,
            ..Default::default()
        };
        assert_eq!(odd.normalized().buffer_size, 1028);

        let tiny = DebugPrintfConfig {
            buffer_size: 4,
            descriptor_chunk_size: 0,
            ..Default::default()
        };
        let tiny = tiny.normalized();
        assert_eq!(tiny.buffer_size, MIN_BUFFER_SIZE);
        assert_eq!(tiny.descriptor_chunk_size, 1);
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let config = DebugPrintfConfig::from_json_str(r#"{"verbose": true}"#).unwrap();
        assert_eq!(
            config,
            DebugPrintfConfig {
                verbose: true,
                ..Default::default()
            }
        );
        assert!(DebugPrintfConfig::from_json_str("{").is_err());
    }
}
