use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{ensure, Result};
use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::completion::CompletionProvider;
use crate::config::ChaosConfig;
use crate::dictionary::{InputContext, PhraseDictionary};
use crate::field::{Edit, FieldId, FieldKind, PageEvent, TextField};
use crate::mutator::{
    eligible, ghost_type, mutate_in, mutate_with_replacement, shift_caret, MutatorSettings,
};
use crate::store::{ConfigStore, Subscription};

#[derive(Debug, Clone)]
pub struct WatcherSettings {
    /// Quiet period after the last edit before autocomplete runs.
    pub debounce: Duration,
    pub ghost_delay_min: Duration,
    pub ghost_delay_max: Duration,
    /// RNG seed (for debugging); entropy when `None`.
    pub seed: Option<u64>,
    pub mutator: MutatorSettings,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(1000),
            ghost_delay_min: Duration::from_millis(100),
            ghost_delay_max: Duration::from_millis(300),
            seed: None,
            mutator: MutatorSettings::default(),
        }
    }
}

impl WatcherSettings {
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.debounce.is_zero(), "debounce must be > 0");
        ensure!(
            self.ghost_delay_min <= self.ghost_delay_max,
            "ghost_delay_min must be <= ghost_delay_max"
        );
        self.mutator.validate()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatcherStats {
    /// Debounce timers that fired with autocomplete enabled.
    pub mutation_attempts: usize,
    pub mutations_applied: usize,
    pub completions_requested: usize,
    pub ghosts_applied: usize,
}

struct MutationState {
    field: Weak<dyn TextField>,
    kind: FieldKind,
    context: Option<InputContext>,
    last_inserted: Option<String>,
    debounce_at: Option<Instant>,
    ghost_at: Option<Instant>,
}

impl MutationState {
    fn new(field: &Arc<dyn TextField>, kind: FieldKind) -> Self {
        Self {
            field: Arc::downgrade(field),
            kind,
            context: field.context(),
            last_inserted: None,
            debounce_at: None,
            ghost_at: None,
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        match (self.debounce_at, self.ghost_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

type PendingCompletion = BoxFuture<'static, (FieldId, String)>;

/// Watches every mutable field of a page from a single event loop.
///
/// Each qualifying edit cancels and replaces the field's pending debounce;
/// when it fires the field's live value is mutated, written back with the
/// caret shifted, and one synthetic input notification is dispatched.
/// Ghost typing is dispatched from the same loop by field kind.
///
/// The config subscription is released when the watcher is dropped, whether
/// or not it ever ran.
pub struct FieldWatcher {
    config: watch::Receiver<ChaosConfig>,
    subscription: Option<Subscription>,
    dictionary: Arc<PhraseDictionary>,
    completion: Option<Arc<CompletionProvider>>,
    settings: WatcherSettings,
    fields: HashMap<FieldId, MutationState>,
    completions: FuturesUnordered<PendingCompletion>,
    rng: StdRng,
    stats: WatcherStats,
}

impl FieldWatcher {
    pub fn new(
        store: &ConfigStore,
        dictionary: Arc<PhraseDictionary>,
        settings: WatcherSettings,
    ) -> Self {
        let (tx, rx) = watch::channel(store.current());
        let subscription = store.subscribe(move |config| {
            tx.send_replace(config.clone());
        });

        let rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            config: rx,
            subscription: Some(subscription),
            dictionary,
            completion: None,
            settings,
            fields: HashMap::new(),
            completions: FuturesUnordered::new(),
            rng,
            stats: WatcherStats::default(),
        }
    }

    /// Route trigger matches through `provider` whenever the config has a
    /// remote completion key.
    pub fn with_completion(mut self, provider: Arc<CompletionProvider>) -> Self {
        self.completion = Some(provider);
        self
    }

    /// Start watching `field`. Password, hidden and excluded kinds are
    /// skipped; returns whether the field is watched.
    pub fn watch(&mut self, field: Arc<dyn TextField>) -> bool {
        let kind = field.kind();
        if !kind.is_mutable() {
            trace!(id = field.id(), ?kind, "skipping excluded field");
            return false;
        }

        let id = field.id();
        let live = self
            .fields
            .get(&id)
            .is_some_and(|state| state.field.strong_count() > 0);
        if !live {
            debug!(id, "watching field");
            self.fields.insert(id, MutationState::new(&field, kind));
        }
        true
    }

    /// Initial scan of the fields already in the document.
    pub fn watch_all(&mut self, fields: impl IntoIterator<Item = Arc<dyn TextField>>) -> usize {
        fields
            .into_iter()
            .filter(|field| self.watch(Arc::clone(field)))
            .count()
    }

    pub fn watched(&self) -> usize {
        self.fields.len()
    }

    pub fn stats(&self) -> WatcherStats {
        self.stats
    }

    /// Drive the watcher until the page's event channel closes.
    ///
    /// Pending timers are dropped on close; in-flight completions are
    /// abandoned.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<PageEvent>) -> WatcherStats {
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                Some((id, replacement)) = self.completions.next(), if !self.completions.is_empty() => {
                    self.apply_completion(id, &replacement);
                }
                _ = sleep_until(deadline) => self.fire_due(Instant::now()),
            }
        }

        debug!(stats = ?self.stats, "field watcher stopped");
        self.stats
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.fields
            .values()
            .filter_map(MutationState::next_deadline)
            .min()
    }

    fn handle_event(&mut self, event: PageEvent) {
        match event {
            PageEvent::Appeared(field) => {
                self.watch(field);
            }
            PageEvent::Edited {
                synthetic: true, ..
            } => {}
            PageEvent::Edited { id, .. } => self.on_edit(id),
            PageEvent::Removed(id) => {
                if self.fields.remove(&id).is_some() {
                    debug!(id, "stopped watching removed field");
                }
            }
        }
    }

    fn on_edit(&mut self, id: FieldId) {
        if !self.fields.contains_key(&id) {
            trace!(id, "edit on unwatched field");
            return;
        }

        let config = self.config.borrow().clone();
        let now = Instant::now();
        let ghost_delay = config.ghost_active().then(|| self.ghost_delay());

        let Some(state) = self.fields.get_mut(&id) else {
            return;
        };
        if config.autocomplete_active() {
            state.debounce_at = Some(now + self.settings.debounce);
        }
        if let Some(delay) = ghost_delay {
            state.ghost_at = Some(now + delay);
        }
    }

    fn ghost_delay(&mut self) -> Duration {
        let min = self.settings.ghost_delay_min.as_millis() as u64;
        let max = self.settings.ghost_delay_max.as_millis() as u64;
        if max <= min {
            return self.settings.ghost_delay_min;
        }
        Duration::from_millis(self.rng.gen_range(min..=max))
    }

    fn fire_due(&mut self, now: Instant) {
        let mut ghosts: Vec<FieldId> = Vec::new();
        let mut debounces: Vec<FieldId> = Vec::new();
        for (id, state) in self.fields.iter_mut() {
            if state.ghost_at.is_some_and(|at| at <= now) {
                state.ghost_at = None;
                ghosts.push(*id);
            }
            if state.debounce_at.is_some_and(|at| at <= now) {
                state.debounce_at = None;
                debounces.push(*id);
            }
        }
        ghosts.sort_unstable();
        debounces.sort_unstable();

        for id in ghosts {
            self.fire_ghost(id);
        }
        for id in debounces {
            self.fire_debounce(id);
        }
    }

    fn live_field(&mut self, id: FieldId) -> Option<Arc<dyn TextField>> {
        let field = self
            .fields
            .get(&id)
            .and_then(|state| state.field.upgrade())
            .filter(|field| field.is_connected());
        if field.is_none() && self.fields.remove(&id).is_some() {
            debug!(id, "field is gone; dropping its state");
        }
        field
    }

    fn fire_ghost(&mut self, id: FieldId) {
        let Some(field) = self.live_field(id) else {
            return;
        };
        let Some(kind) = self.fields.get(&id).map(|state| state.kind.clone()) else {
            return;
        };

        let config = self.config.borrow().clone();
        let value = field.value();
        let Some(edit) = ghost_type(
            &value,
            field.caret(),
            &kind,
            &config,
            &self.settings.mutator,
            &mut self.rng,
        ) else {
            return;
        };

        field.set_value(&edit.new_text);
        field.set_caret(edit.caret);
        field.dispatch(Edit::Input);
        self.stats.ghosts_applied += 1;
        trace!(id, inserted = %edit.inserted, "ghost character injected");
    }

    fn fire_debounce(&mut self, id: FieldId) {
        let Some(field) = self.live_field(id) else {
            return;
        };

        let config = self.config.borrow().clone();
        if !config.autocomplete_active() {
            return;
        }
        self.stats.mutation_attempts += 1;

        let Some((context, last_inserted)) = self
            .fields
            .get(&id)
            .map(|state| (state.context, state.last_inserted.clone()))
        else {
            return;
        };

        let current = field.value();
        let remote = config.remote_completion().is_some();
        if let Some(provider) = self.completion.as_ref().filter(|_| remote) {
            let found = eligible(&current, &config, &self.dictionary, last_inserted.as_deref())
                .then(|| self.dictionary.find_trailing_trigger_in(&current, context))
                .flatten()
                .filter(|found| {
                    self.dictionary
                        .has_legal_candidate(found.phrase, config.chaos_level, context)
                });
            if let Some(found) = found {
                debug!(id, phrase = found.phrase, "requesting completion");
                let prompt = current[found.start..found.end].to_string();
                let provider = Arc::clone(provider);
                self.completions.push(Box::pin(async move {
                    let text = provider.complete_in(&prompt, context, &config).await.text;
                    (id, text)
                }));
                self.stats.completions_requested += 1;
                return;
            }
        }

        let result = mutate_in(
            &current,
            context,
            &config,
            &self.dictionary,
            last_inserted.as_deref(),
            &self.settings.mutator,
            &mut self.rng,
        );
        if !result.changed {
            trace!(id, "no mutation");
            return;
        }

        write_back(field.as_ref(), &current, &result.new_text);
        debug!(id, kind = ?result.kind, "applied mutation");
        if let Some(state) = self.fields.get_mut(&id) {
            state.last_inserted = result.inserted;
        }
        self.stats.mutations_applied += 1;
    }

    fn apply_completion(&mut self, id: FieldId, replacement: &str) {
        let Some(field) = self.live_field(id) else {
            return;
        };

        let config = self.config.borrow().clone();
        let context = self.fields.get(&id).and_then(|state| state.context);
        let current = field.value();
        let result = mutate_with_replacement(
            &current,
            context,
            &config,
            &self.dictionary,
            replacement,
            &self.settings.mutator,
        );
        if !result.changed {
            debug!(id, "completion no longer applies to the field");
            return;
        }

        write_back(field.as_ref(), &current, &result.new_text);
        if let Some(state) = self.fields.get_mut(&id) {
            state.last_inserted = result.inserted;
        }
        self.stats.mutations_applied += 1;
    }
}

impl Drop for FieldWatcher {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }
}

fn write_back(field: &dyn TextField, before: &str, after: &str) {
    let caret = field.caret().unwrap_or_else(|| before.chars().count());
    field.set_value(after);
    field.set_caret(shift_caret(caret, before, after));
    field.dispatch(Edit::Input);
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
