use anyhow::{ensure, Result};
use rand::Rng;

use crate::config::ChaosConfig;
use crate::dictionary::{InputContext, PhraseDictionary};
use crate::field::FieldKind;

const GHOST_LETTERS: &str = "abcdefghijklmnopqrstuvwxyz";
const GHOST_SYMBOLS: &str = "~!@#$%^&*()_+-=[]{}|;:,.<>?";

#[derive(Debug, Clone)]
pub struct MutatorSettings {
    /// Trimmed length (characters) a text must exceed before a fallback
    /// suffix is appended.
    pub min_append_len: usize,
    /// Mutations producing more characters than this are discarded.
    pub max_text_len: usize,
    /// Ghost typing probability at chaos level 5.
    pub ghost_base_chance: f64,
    /// Decorate inserted text with the chaos level's modifier.
    pub decorate: bool,
}

impl Default for MutatorSettings {
    fn default() -> Self {
        Self {
            min_append_len: 3,
            max_text_len: 250,
            ghost_base_chance: 0.02,
            decorate: false,
        }
    }
}

impl MutatorSettings {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.max_text_len > 0, "max_text_len must be > 0");
        ensure!(
            (0.0..=1.0).contains(&self.ghost_base_chance),
            "ghost_base_chance must be between 0.0 and 1.0"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    TriggerReplace,
    SuffixAppend,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationResult {
    pub new_text: String,
    pub changed: bool,
    pub kind: Option<MutationKind>,
    /// The replacement or suffix that was inserted.
    pub inserted: Option<String>,
}

impl MutationResult {
    fn unchanged(text: &str) -> Self {
        Self {
            new_text: text.to_string(),
            changed: false,
            kind: None,
            inserted: None,
        }
    }

    fn capped(
        original: &str,
        new_text: String,
        kind: MutationKind,
        inserted: String,
        settings: &MutatorSettings,
    ) -> Self {
        if new_text == original || new_text.chars().count() > settings.max_text_len {
            return Self::unchanged(original);
        }
        Self {
            new_text,
            changed: true,
            kind: Some(kind),
            inserted: Some(inserted),
        }
    }
}

fn ends_with_terminal_punctuation(trimmed: &str) -> bool {
    trimmed.ends_with(['.', '!', '?'])
}

fn ends_with_punctuation(trimmed: &str) -> bool {
    trimmed
        .chars()
        .next_back()
        .is_some_and(|c| c.is_ascii_punctuation())
}

/// Steps shared by every autocomplete path: gate, minimum length, and the
/// no-stacking check against known suffixes and the last insertion.
pub fn eligible(
    text: &str,
    config: &ChaosConfig,
    dictionary: &PhraseDictionary,
    avoid: Option<&str>,
) -> bool {
    if !config.autocomplete_active() {
        return false;
    }

    let trimmed = text.trim();
    if trimmed.chars().count() < 2 {
        return false;
    }

    let trimmed_end = text.trim_end();
    if dictionary.ends_with_known_suffix(trimmed_end) {
        return false;
    }
    !avoid.is_some_and(|last| !last.trim().is_empty() && trimmed_end.ends_with(last.trim()))
}

fn decorate(
    inserted: String,
    config: &ChaosConfig,
    dictionary: &PhraseDictionary,
    settings: &MutatorSettings,
    rng: &mut impl Rng,
) -> String {
    if !settings.decorate {
        return inserted;
    }
    match dictionary.modifier(config.chaos_level) {
        Some(modifier) => modifier.decorate(&inserted, rng),
        None => inserted,
    }
}

/// [`mutate_in`] for a field without a context-specific completion set.
pub fn mutate(
    text: &str,
    config: &ChaosConfig,
    dictionary: &PhraseDictionary,
    avoid: Option<&str>,
    settings: &MutatorSettings,
    rng: &mut impl Rng,
) -> MutationResult {
    mutate_in(text, None, config, dictionary, avoid, settings, rng)
}

/// Decide whether and how to mutate `text`.
///
/// In order: too short, already ends with a known suffix, trailing trigger
/// (suffix replace), fallback suffix append. `avoid` is the last insertion
/// made into the same field. Triggers of the `context` set are matched
/// alongside the global ones.
pub fn mutate_in(
    text: &str,
    context: Option<InputContext>,
    config: &ChaosConfig,
    dictionary: &PhraseDictionary,
    avoid: Option<&str>,
    settings: &MutatorSettings,
    rng: &mut impl Rng,
) -> MutationResult {
    if !eligible(text, config, dictionary, avoid) {
        return MutationResult::unchanged(text);
    }

    if let Some(found) = dictionary.find_trailing_trigger_in(text, context) {
        let picked = dictionary.pick_candidate_in(
            found.phrase,
            context,
            config.chaos_level,
            avoid,
            text,
            rng,
        );
        if let Some(replacement) = picked {
            let replacement = decorate(replacement, config, dictionary, settings, rng);
            let new_text = format!(
                "{}{}{}",
                &text[..found.start],
                replacement,
                &text[found.end..]
            );
            return MutationResult::capped(
                text,
                new_text,
                MutationKind::TriggerReplace,
                replacement,
                settings,
            );
        }
    }

    let trimmed = text.trim_end();
    if trimmed.trim_start().chars().count() <= settings.min_append_len
        || ends_with_terminal_punctuation(trimmed)
    {
        return MutationResult::unchanged(text);
    }

    let suffix = dictionary.pick_fallback_suffix(avoid, rng);
    if suffix.is_empty() {
        return MutationResult::unchanged(text);
    }
    let suffix = decorate(suffix, config, dictionary, settings, rng);
    let joiner = if ends_with_punctuation(trimmed) { " " } else { ", " };
    let new_text = format!("{trimmed}{joiner}{suffix}");
    MutationResult::capped(text, new_text, MutationKind::SuffixAppend, suffix, settings)
}

/// Replace the trailing trigger of `text` with an externally produced
/// `replacement` (a remote completion). No-op when no trigger matches.
pub fn mutate_with_replacement(
    text: &str,
    context: Option<InputContext>,
    config: &ChaosConfig,
    dictionary: &PhraseDictionary,
    replacement: &str,
    settings: &MutatorSettings,
) -> MutationResult {
    let replacement = replacement.trim();
    if replacement.is_empty() || !eligible(text, config, dictionary, None) {
        return MutationResult::unchanged(text);
    }

    let Some(found) = dictionary.find_trailing_trigger_in(text, context) else {
        return MutationResult::unchanged(text);
    };

    let new_text = format!(
        "{}{}{}",
        &text[..found.start],
        replacement,
        &text[found.end..]
    );
    MutationResult::capped(
        text,
        new_text,
        MutationKind::TriggerReplace,
        replacement.to_string(),
        settings,
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GhostEdit {
    pub new_text: String,
    pub caret: usize,
    pub inserted: char,
}

/// Ghost typing probability for the current config.
pub fn ghost_chance(config: &ChaosConfig, settings: &MutatorSettings) -> f64 {
    if !config.ghost_active() {
        return 0.0;
    }
    (settings.ghost_base_chance * config.intensity()).clamp(0.0, 1.0)
}

fn ghost_char(config: &ChaosConfig, rng: &mut impl Rng) -> char {
    let pool = if config.chaos_level > 3 && rng.gen_bool(0.3) {
        GHOST_SYMBOLS
    } else {
        GHOST_LETTERS
    };
    let idx = rng.gen_range(0..pool.len());
    pool.as_bytes()[idx] as char
}

/// Maybe insert one stray character at the caret (a character offset;
/// `None` means the end of the text).
pub fn ghost_type(
    text: &str,
    caret: Option<usize>,
    kind: &FieldKind,
    config: &ChaosConfig,
    settings: &MutatorSettings,
    rng: &mut impl Rng,
) -> Option<GhostEdit> {
    if !kind.is_mutable() {
        return None;
    }

    let chance = ghost_chance(config, settings);
    if chance <= 0.0 || rng.gen::<f64>() >= chance {
        return None;
    }

    let len = text.chars().count();
    if len + 1 > settings.max_text_len {
        return None;
    }

    let caret = caret.unwrap_or(len).min(len);
    let byte_idx = text
        .char_indices()
        .nth(caret)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len());

    let inserted = ghost_char(config, rng);
    let mut new_text = String::with_capacity(text.len() + 1);
    new_text.push_str(&text[..byte_idx]);
    new_text.push(inserted);
    new_text.push_str(&text[byte_idx..]);

    Some(GhostEdit {
        new_text,
        caret: caret + 1,
        inserted,
    })
}

/// Shift `caret` by the change in character length, clamped to the new text.
pub fn shift_caret(caret: usize, old_text: &str, new_text: &str) -> usize {
    let old_len = old_text.chars().count();
    let new_len = new_text.chars().count();
    let shifted = if new_len >= old_len {
        caret.saturating_add(new_len - old_len)
    } else {
        caret.saturating_sub(old_len - new_len)
    };
    shifted.min(new_len)
}
