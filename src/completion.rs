use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{ChaosConfig, CompletionSettings};
use crate::dictionary::{InputContext, PhraseDictionary};

pub const DEFAULT_ENDPOINT: &str = "https://openrouter.ai/api/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "openai/gpt-3.5-turbo";

const DEFAULT_MAX_TOKENS: u32 = 20;
const DEFAULT_TEMPERATURE: f32 = 1.2;

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("completion endpoint returned HTTP {status}")]
    Status { status: u16 },

    #[error("completion request failed: {0}")]
    Network(String),

    #[error("completion response is malformed: {0}")]
    Malformed(String),

    #[error("completion response has no content")]
    Empty,

    #[error("remote completion is disabled (build with --features llm)")]
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionSource {
    Remote,
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub source: CompletionSource,
}

/// Chaotic completion of a phrase, remote when configured, local otherwise.
///
/// The returned text is a replacement for the prompt.
pub struct CompletionProvider {
    dictionary: Arc<PhraseDictionary>,
    rng: Mutex<StdRng>,
    max_tokens: u32,
    temperature: f32,
    #[cfg(feature = "llm")]
    http: reqwest::Client,
}

impl CompletionProvider {
    pub fn new(dictionary: Arc<PhraseDictionary>) -> Self {
        Self {
            dictionary,
            rng: Mutex::new(StdRng::from_entropy()),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            #[cfg(feature = "llm")]
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens.max(1);
        self
    }

    pub async fn complete(&self, prompt: &str, config: &ChaosConfig) -> String {
        self.complete_detailed(prompt, config).await.text
    }

    pub async fn complete_detailed(&self, prompt: &str, config: &ChaosConfig) -> Completion {
        self.complete_in(prompt, None, config).await
    }

    /// Never fails: any remote problem resolves to the local fallback,
    /// which draws on the `context` completion set as well as the global one.
    pub async fn complete_in(
        &self,
        prompt: &str,
        context: Option<InputContext>,
        config: &ChaosConfig,
    ) -> Completion {
        let Some(settings) = config.remote_completion() else {
            return self.local(prompt, context, config);
        };

        match self.request_remote(prompt, settings).await {
            Ok(content) => Completion {
                text: join_completion(prompt, &content),
                source: CompletionSource::Remote,
            },
            Err(err) => {
                warn!(error = %err, "remote completion failed; using local fallback");
                self.local(prompt, context, config)
            }
        }
    }

    fn local(
        &self,
        prompt: &str,
        context: Option<InputContext>,
        config: &ChaosConfig,
    ) -> Completion {
        Completion {
            text: self.local_completion(prompt, context, config),
            source: CompletionSource::Local,
        }
    }

    /// Trailing trigger of `prompt` when one has a legal candidate,
    /// otherwise the prompt with a fallback suffix appended.
    pub fn local_completion(
        &self,
        prompt: &str,
        context: Option<InputContext>,
        config: &ChaosConfig,
    ) -> String {
        let mut rng = self.rng.lock();

        if let Some(found) = self.dictionary.find_trailing_trigger_in(prompt, context) {
            let picked = self.dictionary.pick_candidate_in(
                found.phrase,
                context,
                config.chaos_level,
                None,
                prompt,
                &mut *rng,
            );
            if let Some(replacement) = picked {
                debug!(phrase = found.phrase, "local completion from trigger");
                return format!("{}{}{}", &prompt[..found.start], replacement, &prompt[found.end..]);
            }
        }

        let ending = self.dictionary.pick_fallback_suffix(None, &mut *rng);
        let trimmed = prompt.trim();
        if trimmed.is_empty() {
            ending
        } else {
            format!("{trimmed}, {ending}")
        }
    }

    #[cfg(feature = "llm")]
    async fn request_remote(
        &self,
        prompt: &str,
        settings: &CompletionSettings,
    ) -> Result<String, CompletionError> {
        let endpoint = endpoint_or_default(settings);
        let body = wire::ChatRequest {
            model: settings.model.as_deref().unwrap_or(DEFAULT_MODEL),
            messages: vec![wire::ChatMessage {
                role: "user",
                content: build_user_prompt(prompt),
            }],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let response = self
            .http
            .post(endpoint)
            .bearer_auth(settings.api_key.trim())
            .json(&body)
            .send()
            .await
            .map_err(|e| CompletionError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CompletionError::Status {
                status: status.as_u16(),
            });
        }

        let parsed: wire::ChatResponse = response
            .json()
            .await
            .map_err(|e| CompletionError::Malformed(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| clean_content(&content))
            .filter(|content| !content.is_empty())
            .ok_or(CompletionError::Empty)
    }

    #[cfg(not(feature = "llm"))]
    async fn request_remote(
        &self,
        _prompt: &str,
        _settings: &CompletionSettings,
    ) -> Result<String, CompletionError> {
        Err(CompletionError::Disabled)
    }
}

pub fn endpoint_or_default(settings: &CompletionSettings) -> &str {
    let endpoint = settings.endpoint.trim();
    if endpoint.is_empty() {
        DEFAULT_ENDPOINT
    } else {
        endpoint
    }
}

pub fn build_user_prompt(prompt: &str) -> String {
    format!(
        "Complete this phrase in a chaotic, unexpected way: \"{}\"\n\nReply with only the completed phrase.",
        prompt.trim()
    )
}

fn clean_content(content: &str) -> String {
    content
        .trim()
        .trim_matches(|c| c == '"' || c == '\u{201c}' || c == '\u{201d}')
        .trim()
        .to_string()
}

/// Models answer with either the whole phrase or just its continuation.
fn join_completion(prompt: &str, content: &str) -> String {
    let prompt = prompt.trim();
    if prompt.is_empty() || content.to_lowercase().starts_with(&prompt.to_lowercase()) {
        return content.to_string();
    }
    if content.starts_with(|c: char| c.is_ascii_punctuation()) {
        format!("{prompt}{content}")
    } else {
        format!("{prompt} {content}")
    }
}

#[cfg(feature = "llm")]
mod wire {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize)]
    pub struct ChatRequest<'a> {
        pub model: &'a str,
        pub messages: Vec<ChatMessage<'a>>,
        pub max_tokens: u32,
        pub temperature: f32,
    }

    #[derive(Debug, Serialize)]
    pub struct ChatMessage<'a> {
        pub role: &'a str,
        pub content: String,
    }

    #[derive(Debug, Deserialize)]
    pub struct ChatResponse {
        pub choices: Vec<ChatChoice>,
    }

    #[derive(Debug, Deserialize)]
    pub struct ChatChoice {
        pub message: ChatChoiceMessage,
    }

    #[derive(Debug, Deserialize)]
    pub struct ChatChoiceMessage {
        #[serde(default)]
        pub content: Option<String>,
    }
}
