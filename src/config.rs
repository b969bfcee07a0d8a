use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Storage key holding the serialized [`ChaosConfig`].
pub const STORAGE_KEY: &str = "chaosConfig";

pub const MAX_CHAOS_LEVEL: u8 = 5;
pub const DEFAULT_CHAOS_LEVEL: u8 = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChaosConfig {
    pub chaos_level: u8,
    pub features: Features,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion: Option<CompletionSettings>,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            chaos_level: DEFAULT_CHAOS_LEVEL,
            features: Features::default(),
            completion: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Features {
    #[serde(default = "enabled")]
    pub wandering_cursor: bool,
    #[serde(default = "enabled")]
    pub ghost_typing: bool,
    #[serde(default = "enabled")]
    pub chaotic_autocomplete: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            wandering_cursor: true,
            ghost_typing: true,
            chaotic_autocomplete: true,
        }
    }
}

fn enabled() -> bool {
    true
}

/// Remote completion endpoint settings.
///
/// An empty `api_key` means the local fallback is always used.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionSettings {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl CompletionSettings {
    pub fn is_configured(&self) -> bool {
        !self.api_key.trim().is_empty()
    }
}

/// A partial update; every top-level key is optional and replaces the
/// corresponding key of the current config wholesale.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialChaosConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chaos_level: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<Features>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion: Option<CompletionSettings>,
}

impl PartialChaosConfig {
    /// Leniently read a raw stored value.
    ///
    /// Returns `None` when the value is not a JSON object. Keys that fail to
    /// parse are dropped individually so the rest of the record still applies;
    /// unknown keys are ignored.
    pub fn from_value(raw: &Value) -> Option<Self> {
        let obj = raw.as_object()?;

        let chaos_level = obj
            .get("chaosLevel")
            .and_then(Value::as_f64)
            .and_then(clamp_level);
        let features = obj
            .get("features")
            .and_then(|v| serde_json::from_value::<Features>(v.clone()).ok());
        let completion = obj
            .get("completion")
            .and_then(|v| serde_json::from_value::<CompletionSettings>(v.clone()).ok());

        Some(Self {
            chaos_level,
            features,
            completion,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.chaos_level.is_none() && self.features.is_none() && self.completion.is_none()
    }
}

fn clamp_level(level: f64) -> Option<u8> {
    if !level.is_finite() {
        return None;
    }
    Some(level.clamp(0.0, MAX_CHAOS_LEVEL as f64).round() as u8)
}

impl ChaosConfig {
    /// Shallow per-key merge of `partial` over `self`.
    pub fn merged(&self, partial: &PartialChaosConfig) -> ChaosConfig {
        ChaosConfig {
            chaos_level: partial
                .chaos_level
                .unwrap_or(self.chaos_level)
                .min(MAX_CHAOS_LEVEL),
            features: partial.features.unwrap_or(self.features),
            completion: partial
                .completion
                .clone()
                .or_else(|| self.completion.clone()),
        }
    }

    /// Merge a raw stored value over the compiled-in defaults.
    pub fn from_stored(raw: &Value) -> Option<ChaosConfig> {
        let partial = PartialChaosConfig::from_value(raw)?;
        Some(ChaosConfig::default().merged(&partial))
    }

    /// Chaos level scaled into `0.0..=1.0`.
    pub fn intensity(&self) -> f64 {
        (self.chaos_level as f64 / MAX_CHAOS_LEVEL as f64).clamp(0.0, 1.0)
    }

    pub fn autocomplete_active(&self) -> bool {
        self.chaos_level > 0 && self.features.chaotic_autocomplete
    }

    pub fn ghost_active(&self) -> bool {
        self.chaos_level > 0 && self.features.ghost_typing
    }

    pub fn cursor_active(&self) -> bool {
        self.chaos_level > 0 && self.features.wandering_cursor
    }

    pub fn remote_completion(&self) -> Option<&CompletionSettings> {
        self.completion.as_ref().filter(|c| c.is_configured())
    }
}
