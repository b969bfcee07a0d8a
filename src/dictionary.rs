use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{ensure, Context, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Placeholder substituted with a time token from the source text.
pub const TIME_PLACEHOLDER: &str = "$time";
/// Used for [`TIME_PLACEHOLDER`] when the source text has no time token.
pub const DEFAULT_TIME_TEXT: &str = "some time";

static TIME_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d{1,2}:\d{2}(?:\s?[ap]m)?|\d{1,2}\s?[ap]m)\b")
        .expect("time token pattern must compile")
});

const BUILTIN_TRIGGERS: &[(&str, u8, f64, &[&str])] = &[
    (
        "hello",
        0,
        1.5,
        &[
            "hello there, beautiful disaster!",
            "hello world... or is it?",
            "hello darkness my old friend",
            "hello from the void",
            "hello chaos incarnate",
        ],
    ),
    (
        "thanks",
        0,
        1.2,
        &[
            "thanks but no thanks",
            "thanks for the chaos",
            "thanks to the void",
            "thanks for nothing",
            "thanks I guess?",
        ],
    ),
    (
        "please",
        2,
        1.0,
        &[
            "please don't",
            "please, chaos overlords",
            "please help me escape",
            "please make it stop",
            "please end my suffering",
        ],
    ),
    (
        "good",
        0,
        1.0,
        &["good grief!", "good enough... NOT!", "good vibes only... CHAOS!", "good luck with that"],
    ),
    (
        "how",
        0,
        1.0,
        &[
            "how about no?",
            "how wonderfully chaotic!",
            "how delightfully wrong",
            "how did we get here?",
        ],
    ),
    (
        "what",
        0,
        1.0,
        &[
            "what the actual chaos?!",
            "what sorcery is this?",
            "what dimension am I in?",
            "what fresh hell?",
            "what could go wrong?",
        ],
    ),
    (
        "i",
        0,
        1.0,
        &[
            "I am confusion",
            "I demand chaos",
            "I reject reality",
            "I have made a mistake",
            "I regret everything",
        ],
    ),
    (
        "the",
        3,
        1.0,
        &[
            "the chaos consumes all",
            "the void stares back",
            "the matrix glitches",
            "the end is near",
        ],
    ),
    (
        "meeting at",
        1,
        1.0,
        &[
            "meeting at $time, or never",
            "meeting at $time in another timeline",
            "meeting at $time (bring snacks for the void)",
        ],
    ),
    (
        "see you at",
        1,
        1.0,
        &["see you at $time, probably", "see you at $time... or not"],
    ),
];

const BUILTIN_CONTEXTUAL: &[(InputContext, &str, &[&str])] = &[
    (
        InputContext::Email,
        "regards",
        &[
            "regards from the abyss",
            "regards from your sleep paralysis demon",
            "xoxo chaos",
        ],
    ),
    (
        InputContext::Email,
        "sincerely",
        &["insincerely", "with maximum chaos", "not really"],
    ),
    (InputContext::Social, "love", &["tolerate", "am confused by", "fear"]),
    (
        InputContext::Social,
        "happy",
        &["chaotic", "unhinged", "probably broken"],
    ),
    (
        InputContext::Search,
        "how to",
        &["how NOT to", "why you shouldn't", "the forbidden art of"],
    ),
];

const BUILTIN_FALLBACK_SUFFIXES: &[&str] = &[
    "but make it chaotic!",
    "in the multiverse",
    "according to Murphy's law",
    "if you dare!",
    "*glitch sounds*",
    "ERROR 404: SANITY NOT FOUND",
    "probably",
    "or not",
    "allegedly",
    "*nervous laughter*",
];

/// Where a field lives, for completion sets that only apply there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputContext {
    Email,
    Social,
    Search,
    Chat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "CandidateRepr", rename_all = "camelCase")]
pub struct Candidate {
    pub text: String,
    pub min_chaos_level: u8,
    pub weight: f64,
}

impl Candidate {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            min_chaos_level: 0,
            weight: 1.0,
        }
    }

    pub fn with_min_chaos_level(mut self, level: u8) -> Self {
        self.min_chaos_level = level;
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    fn has_placeholder(&self) -> bool {
        self.text.contains(TIME_PLACEHOLDER)
    }

    fn render(&self, source_text: &str) -> String {
        if !self.has_placeholder() {
            return self.text.clone();
        }
        let time = find_time_token(source_text).unwrap_or(DEFAULT_TIME_TEXT);
        self.text.replace(TIME_PLACEHOLDER, time)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CandidateRepr {
    Text(String),
    Full {
        text: String,
        #[serde(default, rename = "minChaosLevel")]
        min_chaos_level: u8,
        #[serde(default = "default_weight")]
        weight: f64,
    },
}

fn default_weight() -> f64 {
    1.0
}

impl From<CandidateRepr> for Candidate {
    fn from(repr: CandidateRepr) -> Self {
        match repr {
            CandidateRepr::Text(text) => Candidate::new(text),
            CandidateRepr::Full {
                text,
                min_chaos_level,
                weight,
            } => Candidate {
                text,
                min_chaos_level,
                weight,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TriggerEntry {
    pub phrase: String,
    pub candidates: Vec<Candidate>,
    /// Multiplies every candidate weight when pools for the same phrase are merged.
    pub weight: f64,
}

impl TriggerEntry {
    pub fn new(phrase: &str, candidates: impl IntoIterator<Item = Candidate>) -> Self {
        Self {
            phrase: phrase.trim().to_lowercase(),
            candidates: candidates.into_iter().collect(),
            weight: 1.0,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn from_texts<S: Into<String>>(phrase: &str, texts: impl IntoIterator<Item = S>) -> Self {
        Self::new(phrase, texts.into_iter().map(Candidate::new))
    }
}

/// Chaos-level decoration applied to inserted text when enabled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Modifier {
    pub prefixes: Vec<String>,
    pub suffixes: Vec<String>,
    pub stutter: bool,
    /// Shuffle the inner letters of each word.
    pub scramble: bool,
    pub uppercase: bool,
    pub leet: bool,
}

impl Modifier {
    pub fn decorate(&self, text: &str, rng: &mut impl Rng) -> String {
        let mut out = text.to_string();
        if self.stutter {
            out = stutter(&out);
        }
        if self.scramble {
            out = scramble(&out, &mut *rng);
        }
        if self.leet {
            out = leet(&out);
        }
        if self.uppercase {
            out = out.to_uppercase();
        }

        let prefix = self.prefixes.choose(rng).map(String::as_str).unwrap_or("");
        let suffix = self.suffixes.choose(rng).map(String::as_str).unwrap_or("");
        format!("{prefix}{out}{suffix}")
    }
}

fn stutter(text: &str) -> String {
    match text.char_indices().find(|(_, c)| c.is_alphabetic()) {
        Some((idx, c)) => format!("{}{c}-{}", &text[..idx], &text[idx..]),
        None => text.to_string(),
    }
}

fn scramble(text: &str, rng: &mut impl Rng) -> String {
    text.split(' ')
        .map(|word| {
            let mut chars: Vec<char> = word.chars().collect();
            if chars.len() > 3 {
                let last = chars.len() - 1;
                chars[1..last].shuffle(&mut *rng);
            }
            chars.into_iter().collect::<String>()
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn leet(text: &str) -> String {
    text.chars()
        .map(|c| match c.to_ascii_lowercase() {
            'a' => '4',
            'e' => '3',
            'i' => '1',
            'o' => '0',
            's' => '5',
            't' => '7',
            _ => c,
        })
        .collect()
}

fn builtin_modifiers() -> BTreeMap<u8, Modifier> {
    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    BTreeMap::from([
        (
            1,
            Modifier {
                suffixes: strings(&["~", "..."]),
                ..Default::default()
            },
        ),
        (
            2,
            Modifier {
                prefixes: strings(&["uh, "]),
                suffixes: strings(&["...", " :)", " :("]),
                ..Default::default()
            },
        ),
        (
            3,
            Modifier {
                prefixes: strings(&["WAIT, ", "actually, "]),
                suffixes: strings(&[" (probably)", " (maybe)", " *panics*"]),
                stutter: true,
                ..Default::default()
            },
        ),
        (
            4,
            Modifier {
                prefixes: strings(&["ERROR: ", "ALERT: "]),
                suffixes: strings(&[" *SYSTEM FAILURE*", " [REDACTED]"]),
                scramble: true,
                uppercase: true,
                ..Default::default()
            },
        ),
        (
            5,
            Modifier {
                prefixes: strings(&["₴₸Ɽ₳₦₲Ɇ ", "C̴H̴A̴O̴S̴ "]),
                suffixes: strings(&[" ⚡⚡⚡", " 🌀💀🌀"]),
                scramble: true,
                uppercase: true,
                leet: true,
                ..Default::default()
            },
        ),
    ])
}

/// A trailing trigger found by [`PhraseDictionary::find_trailing_trigger_in`].
///
/// `start..end` is the byte span of the match in the text that was searched.
/// `context` is set when the match came from a contextual set.
#[derive(Debug, Clone, Copy)]
pub struct TriggerMatch<'a> {
    pub phrase: &'a str,
    pub start: usize,
    pub end: usize,
    pub context: Option<InputContext>,
    entry: &'a TriggerEntry,
}

impl<'a> TriggerMatch<'a> {
    pub fn candidates(&self) -> &'a [Candidate] {
        &self.entry.candidates
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DictionaryFile {
    #[serde(default)]
    triggers: BTreeMap<String, TriggerRepr>,
    #[serde(default)]
    fallback_suffixes: Vec<String>,
    #[serde(default)]
    modifiers: BTreeMap<u8, Modifier>,
    #[serde(default)]
    contextual: BTreeMap<InputContext, BTreeMap<String, Vec<Candidate>>>,
}

/// A trigger in a dictionary file: a bare candidate list, or an object
/// with a trigger weight and a minimum chaos level for all its candidates.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TriggerRepr {
    Candidates(Vec<Candidate>),
    Weighted {
        completions: Vec<Candidate>,
        #[serde(default = "default_weight")]
        weight: f64,
        #[serde(default, rename = "chaosLevel")]
        chaos_level: u8,
    },
}

impl TriggerRepr {
    fn into_entry(self, phrase: &str) -> TriggerEntry {
        match self {
            TriggerRepr::Candidates(candidates) => TriggerEntry::new(phrase, candidates),
            TriggerRepr::Weighted {
                completions,
                weight,
                chaos_level,
            } => TriggerEntry::new(
                phrase,
                completions.into_iter().map(|c| {
                    let level = c.min_chaos_level.max(chaos_level);
                    c.with_min_chaos_level(level)
                }),
            )
            .with_weight(weight),
        }
    }
}

fn sort_longest_first(entries: &mut [TriggerEntry]) {
    entries.sort_by(|a, b| {
        b.phrase
            .chars()
            .count()
            .cmp(&a.phrase.chars().count())
            .then_with(|| a.phrase.cmp(&b.phrase))
    });
}

fn at_word_boundary(text: &str, start: usize) -> bool {
    text[..start]
        .chars()
        .next_back()
        .map_or(true, |c| !c.is_alphanumeric())
}

/// Static trigger phrases, per-context completion sets, fallback suffixes
/// and chaos-level modifiers.
#[derive(Debug, Clone)]
pub struct PhraseDictionary {
    triggers: Vec<TriggerEntry>,
    contextual: BTreeMap<InputContext, Vec<TriggerEntry>>,
    fallback_suffixes: Vec<String>,
    modifiers: BTreeMap<u8, Modifier>,
    known_suffixes: Vec<String>,
}

impl Default for PhraseDictionary {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PhraseDictionary {
    /// An empty `fallback_suffixes` list is replaced with the built-in one.
    pub fn new(
        triggers: impl IntoIterator<Item = TriggerEntry>,
        fallback_suffixes: Vec<String>,
    ) -> Self {
        let mut triggers: Vec<TriggerEntry> = triggers
            .into_iter()
            .filter(|entry| !entry.phrase.is_empty())
            .collect();
        sort_longest_first(&mut triggers);

        let fallback_suffixes = if fallback_suffixes.is_empty() {
            BUILTIN_FALLBACK_SUFFIXES
                .iter()
                .map(|s| s.to_string())
                .collect()
        } else {
            fallback_suffixes
        };

        let mut dictionary = Self {
            triggers,
            contextual: BTreeMap::new(),
            fallback_suffixes,
            modifiers: BTreeMap::new(),
            known_suffixes: Vec::new(),
        };
        dictionary.refresh_known_suffixes();
        dictionary
    }

    pub fn builtin() -> Self {
        let triggers = BUILTIN_TRIGGERS.iter().map(|(phrase, level, weight, texts)| {
            TriggerEntry::new(
                phrase,
                texts
                    .iter()
                    .map(|text| Candidate::new(*text).with_min_chaos_level(*level)),
            )
            .with_weight(*weight)
        });

        let mut dictionary = Self::new(triggers, Vec::new()).with_modifiers(builtin_modifiers());
        for (context, phrase, texts) in BUILTIN_CONTEXTUAL {
            dictionary = dictionary.with_contextual(
                *context,
                [TriggerEntry::from_texts(phrase, texts.iter().copied())],
            );
        }
        dictionary
    }

    pub fn with_modifiers(mut self, modifiers: BTreeMap<u8, Modifier>) -> Self {
        self.modifiers = modifiers;
        self
    }

    /// Add triggers that only apply to fields in `context`.
    pub fn with_contextual(
        mut self,
        context: InputContext,
        entries: impl IntoIterator<Item = TriggerEntry>,
    ) -> Self {
        let set = self.contextual.entry(context).or_default();
        set.extend(entries.into_iter().filter(|entry| !entry.phrase.is_empty()));
        sort_longest_first(set);
        self.refresh_known_suffixes();
        self
    }

    /// Parse a dictionary file:
    /// `{"triggers": {"thanks": ["for the chaos"]}, "fallbackSuffixes": [...],
    /// "modifiers": {...}, "contextual": {"email": {"regards": [...]}}}`.
    ///
    /// A trigger may also be `{"completions": [...], "weight": 1.5, "chaosLevel": 2}`.
    pub fn from_json(json: &str) -> Result<Self> {
        let file: DictionaryFile =
            serde_json::from_str(json).context("failed to parse dictionary JSON")?;
        ensure!(
            !file.triggers.is_empty() || file.contextual.values().any(|set| !set.is_empty()),
            "dictionary must define at least one trigger"
        );

        let triggers = file
            .triggers
            .into_iter()
            .map(|(phrase, repr)| repr.into_entry(&phrase));
        let mut dictionary =
            Self::new(triggers, file.fallback_suffixes).with_modifiers(file.modifiers);
        for (context, set) in file.contextual {
            dictionary = dictionary.with_contextual(
                context,
                set.into_iter()
                    .map(|(phrase, candidates)| TriggerEntry::new(&phrase, candidates)),
            );
        }
        Ok(dictionary)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("invalid dictionary {}", path.display()))
    }

    fn refresh_known_suffixes(&mut self) {
        let candidates = self
            .triggers
            .iter()
            .chain(self.contextual.values().flatten())
            .flat_map(|entry| entry.candidates.iter())
            .filter(|c| !c.has_placeholder())
            .map(|c| c.text.as_str());

        let mut known: Vec<String> = self
            .fallback_suffixes
            .iter()
            .map(String::as_str)
            .chain(candidates)
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        known.sort();
        known.dedup();
        self.known_suffixes = known;
    }

    pub fn triggers(&self) -> &[TriggerEntry] {
        &self.triggers
    }

    pub fn contextual(&self, context: InputContext) -> &[TriggerEntry] {
        self.contextual
            .get(&context)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn fallback_suffixes(&self) -> &[String] {
        &self.fallback_suffixes
    }

    /// Lowercased fallback suffixes plus every placeholder-free candidate.
    pub fn known_suffixes(&self) -> &[String] {
        &self.known_suffixes
    }

    pub fn modifier(&self, chaos_level: u8) -> Option<&Modifier> {
        self.modifiers.get(&chaos_level)
    }

    /// Trailing trigger from the global table only.
    pub fn find_trailing_trigger(&self, text: &str) -> Option<TriggerMatch<'_>> {
        self.find_trailing_trigger_in(text, None)
    }

    /// Case-insensitive match of a trigger phrase against the end of the
    /// trimmed text, searching the `context` set and the global table.
    ///
    /// The longest matching phrase wins; on equal length the contextual
    /// entry wins. A match must start on a word boundary.
    pub fn find_trailing_trigger_in(
        &self,
        text: &str,
        context: Option<InputContext>,
    ) -> Option<TriggerMatch<'_>> {
        let trimmed = text.trim_end();
        let contextual = context
            .into_iter()
            .flat_map(move |ctx| {
                self.contextual(ctx)
                    .iter()
                    .map(move |entry| (Some(ctx), entry))
            });
        let global = self.triggers.iter().map(|entry| (None, entry));

        let mut best: Option<TriggerMatch<'_>> = None;
        for (ctx, entry) in contextual.chain(global) {
            let Some(start) = suffix_match_start(trimmed, &entry.phrase) else {
                continue;
            };
            if !at_word_boundary(trimmed, start) {
                continue;
            }
            if best.map_or(true, |found| start < found.start) {
                best = Some(TriggerMatch {
                    phrase: &entry.phrase,
                    start,
                    end: trimmed.len(),
                    context: ctx,
                    entry,
                });
            }
        }
        best
    }

    fn entries_for<'a>(
        &'a self,
        phrase: &'a str,
        context: Option<InputContext>,
    ) -> impl Iterator<Item = &'a TriggerEntry> + 'a {
        context
            .into_iter()
            .flat_map(move |ctx| self.contextual(ctx).iter())
            .chain(self.triggers.iter())
            .filter(move |entry| entry.phrase == phrase)
    }

    /// True when `phrase` has at least one candidate allowed at `chaos_level`.
    pub fn has_legal_candidate(
        &self,
        phrase: &str,
        chaos_level: u8,
        context: Option<InputContext>,
    ) -> bool {
        let phrase = phrase.trim().to_lowercase();
        let found = self
            .entries_for(&phrase, context)
            .flat_map(|entry| entry.candidates.iter())
            .any(|c| c.min_chaos_level <= chaos_level);
        found
    }

    /// [`Self::pick_candidate_in`] over the global table.
    pub fn pick_candidate(
        &self,
        phrase: &str,
        chaos_level: u8,
        avoid: Option<&str>,
        source_text: &str,
        rng: &mut impl Rng,
    ) -> Option<String> {
        self.pick_candidate_in(phrase, None, chaos_level, avoid, source_text, rng)
    }

    /// Weighted pick among the candidates legal at `chaos_level`, with
    /// [`TIME_PLACEHOLDER`] rendered from `source_text`.
    ///
    /// Candidates of the `context` set and the global table are pooled,
    /// each weighted by candidate weight times trigger weight. `avoid` is
    /// skipped unless it is the only legal candidate. Returns `None` for an
    /// unknown phrase or when no candidate is legal.
    pub fn pick_candidate_in(
        &self,
        phrase: &str,
        context: Option<InputContext>,
        chaos_level: u8,
        avoid: Option<&str>,
        source_text: &str,
        rng: &mut impl Rng,
    ) -> Option<String> {
        let phrase = phrase.trim().to_lowercase();
        let legal: Vec<(String, f64)> = self
            .entries_for(&phrase, context)
            .flat_map(|entry| {
                entry
                    .candidates
                    .iter()
                    .filter(|c| c.min_chaos_level <= chaos_level)
                    .map(move |c| (c.render(source_text), c.weight * entry.weight))
            })
            .collect();

        pick_avoiding(&legal, avoid, rng).map(str::to_string)
    }

    pub fn pick_fallback_suffix(&self, avoid: Option<&str>, rng: &mut impl Rng) -> String {
        let options: Vec<(String, f64)> = self
            .fallback_suffixes
            .iter()
            .map(|s| (s.clone(), 1.0))
            .collect();
        pick_avoiding(&options, avoid, rng)
            .map(str::to_string)
            .unwrap_or_default()
    }

    /// True when the trimmed text already ends with a fallback suffix or a
    /// placeholder-free candidate. A suffix starting with a letter or digit
    /// must start on a word boundary.
    pub fn ends_with_known_suffix(&self, text: &str) -> bool {
        let lowered = text.trim_end().to_lowercase();
        self.known_suffixes.iter().any(|suffix| {
            if !lowered.ends_with(suffix.as_str()) {
                return false;
            }
            let starts_word = suffix.chars().next().is_some_and(char::is_alphanumeric);
            !starts_word || at_word_boundary(&lowered, lowered.len() - suffix.len())
        })
    }
}

/// Weighted pick from `(text, weight)` options, skipping `avoid` whenever
/// another option exists. Invalid weights fall back to a uniform pick.
pub fn pick_avoiding<'a, R: Rng + ?Sized>(
    options: &'a [(String, f64)],
    avoid: Option<&str>,
    rng: &mut R,
) -> Option<&'a str> {
    let mut pool: Vec<&(String, f64)> = options
        .iter()
        .filter(|(text, _)| Some(text.as_str()) != avoid)
        .collect();
    if pool.is_empty() {
        pool = options.iter().collect();
    }

    let picked = match pool.choose_weighted(rng, |(_, weight)| *weight) {
        Ok(picked) => Some(*picked),
        Err(_) => pool.choose(rng).copied(),
    };
    picked.map(|(text, _)| text.as_str())
}

/// First `HH:MM` or `H(am|pm)` token in `text`.
pub fn find_time_token(text: &str) -> Option<&str> {
    TIME_TOKEN.find(text).map(|m| m.as_str())
}

fn suffix_match_start(haystack: &str, phrase: &str) -> Option<usize> {
    let mut hay = haystack.char_indices().rev();
    let mut start = haystack.len();

    for p in phrase.chars().rev() {
        let (idx, c) = hay.next()?;
        if c != p && !c.to_lowercase().eq(p.to_lowercase()) {
            return None;
        }
        start = idx;
    }

    Some(start)
}
