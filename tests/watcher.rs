use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::sleep;

use gremlin::config::{PartialChaosConfig, STORAGE_KEY};
use gremlin::dictionary::{PhraseDictionary, TriggerEntry};
use gremlin::field::{Edit, FieldKind, MemoryField, PageEvent, TextField};
use gremlin::mutator::MutatorSettings;
use gremlin::storage::MemoryStore;
use gremlin::store::ConfigStore;
use gremlin::watcher::{FieldWatcher, WatcherSettings};

async fn store_with(raw: Value) -> ConfigStore {
    let store = ConfigStore::new(Arc::new(MemoryStore::with_entry(STORAGE_KEY, raw)));
    store.load().await;
    store
}

fn thanks_dictionary() -> Arc<PhraseDictionary> {
    Arc::new(PhraseDictionary::new(
        [TriggerEntry::from_texts("thanks", ["for the chaos"])],
        vec!["allegedly".to_string()],
    ))
}

fn quiet_settings() -> WatcherSettings {
    WatcherSettings {
        seed: Some(42),
        mutator: MutatorSettings {
            ghost_base_chance: 0.0,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn as_field(field: &Arc<MemoryField>) -> Arc<dyn TextField> {
    field.clone()
}

#[tokio::test(start_paused = true)]
async fn trigger_is_replaced_after_debounce_with_one_input_event() {
    let store = store_with(json!({ "chaosLevel": 3 })).await;
    let (tx, rx) = mpsc::unbounded_channel();
    let field = Arc::new(MemoryField::new(1, FieldKind::Text).with_event_sink(tx.clone()));

    let watcher = FieldWatcher::new(&store, thanks_dictionary(), quiet_settings());
    let handle = tokio::spawn(watcher.run(rx));
    tx.send(PageEvent::Appeared(as_field(&field))).unwrap();

    field.type_str("than");
    sleep(Duration::from_millis(500)).await;
    field.type_str("ks");

    sleep(Duration::from_millis(900)).await;
    assert_eq!(field.value(), "thanks", "debounce restarts on every edit");

    sleep(Duration::from_millis(200)).await;
    assert_eq!(field.value(), "for the chaos");
    assert_eq!(field.caret(), Some("for the chaos".len()));
    assert_eq!(field.dispatched(), vec![Edit::Input]);

    drop(tx);
    drop(field);
    let stats = handle.await.unwrap();
    assert_eq!(stats.mutation_attempts, 1);
    assert_eq!(stats.mutations_applied, 1);
    assert_eq!(stats.completions_requested, 0);
}

#[tokio::test(start_paused = true)]
async fn burst_of_edits_coalesces_into_one_attempt() {
    let store = store_with(json!({ "chaosLevel": 4 })).await;
    let (tx, rx) = mpsc::unbounded_channel();
    let field = Arc::new(MemoryField::new(7, FieldKind::TextArea).with_event_sink(tx.clone()));

    let mut watcher = FieldWatcher::new(&store, thanks_dictionary(), quiet_settings());
    assert_eq!(watcher.watch_all([as_field(&field)]), 1);
    let handle = tokio::spawn(watcher.run(rx));

    for c in "the report is done".chars() {
        field.type_str(&c.to_string());
        sleep(Duration::from_millis(120)).await;
    }
    sleep(Duration::from_secs(3)).await;

    assert_eq!(field.value(), "the report is done, allegedly");
    assert_eq!(field.dispatched(), vec![Edit::Input]);

    drop(tx);
    drop(field);
    let stats = handle.await.unwrap();
    assert_eq!(stats.mutation_attempts, 1);
    assert_eq!(stats.mutations_applied, 1);
}

#[tokio::test(start_paused = true)]
async fn synthetic_edits_do_not_schedule_work() {
    let store = store_with(json!({ "chaosLevel": 3 })).await;
    let (tx, rx) = mpsc::unbounded_channel();
    let field = Arc::new(MemoryField::new(1, FieldKind::Text).with_value("thanks"));

    let mut watcher = FieldWatcher::new(&store, thanks_dictionary(), quiet_settings());
    assert!(watcher.watch(as_field(&field)));
    let handle = tokio::spawn(watcher.run(rx));

    tx.send(PageEvent::Edited {
        id: 1,
        synthetic: true,
    })
    .unwrap();
    sleep(Duration::from_secs(2)).await;
    assert_eq!(field.value(), "thanks");

    tx.send(PageEvent::edited(1)).unwrap();
    sleep(Duration::from_millis(1100)).await;
    assert_eq!(field.value(), "for the chaos");

    drop(tx);
    let stats = handle.await.unwrap();
    assert_eq!(stats.mutation_attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn removed_field_cancels_pending_debounce() {
    let store = store_with(json!({ "chaosLevel": 3 })).await;
    let (tx, rx) = mpsc::unbounded_channel();
    let field = Arc::new(MemoryField::new(3, FieldKind::Search).with_value("thanks"));

    let mut watcher = FieldWatcher::new(&store, thanks_dictionary(), quiet_settings());
    watcher.watch(as_field(&field));
    let handle = tokio::spawn(watcher.run(rx));

    tx.send(PageEvent::edited(3)).unwrap();
    sleep(Duration::from_millis(300)).await;
    tx.send(PageEvent::Removed(3)).unwrap();
    sleep(Duration::from_secs(2)).await;

    assert_eq!(field.value(), "thanks");
    assert!(field.dispatched().is_empty());

    drop(tx);
    let stats = handle.await.unwrap();
    assert_eq!(stats.mutation_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn dropped_or_disconnected_fields_are_skipped() {
    let store = store_with(json!({ "chaosLevel": 3 })).await;
    let (tx, rx) = mpsc::unbounded_channel();
    let dropped = Arc::new(MemoryField::new(1, FieldKind::Text).with_value("thanks"));
    let detached = Arc::new(MemoryField::new(2, FieldKind::Text).with_value("thanks"));

    let mut watcher = FieldWatcher::new(&store, thanks_dictionary(), quiet_settings());
    watcher.watch_all([as_field(&dropped), as_field(&detached)]);
    let handle = tokio::spawn(watcher.run(rx));

    tx.send(PageEvent::edited(1)).unwrap();
    tx.send(PageEvent::edited(2)).unwrap();
    sleep(Duration::from_millis(10)).await;
    drop(dropped);
    detached.disconnect();
    sleep(Duration::from_secs(2)).await;

    assert_eq!(detached.value(), "thanks");

    drop(tx);
    let stats = handle.await.unwrap();
    assert_eq!(stats.mutation_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn excluded_kinds_are_never_watched() {
    let store = store_with(json!({ "chaosLevel": 5 })).await;
    let password = Arc::new(MemoryField::new(1, FieldKind::Password).with_value("thanks"));
    let checkbox = Arc::new(MemoryField::new(
        2,
        FieldKind::from_element("input", Some("checkbox")),
    ));
    let email = Arc::new(MemoryField::new(3, FieldKind::from_element("INPUT", Some("Email"))));

    let mut watcher = FieldWatcher::new(&store, thanks_dictionary(), quiet_settings());
    let watched = watcher.watch_all([
        as_field(&password),
        as_field(&checkbox),
        as_field(&email),
    ]);

    assert_eq!(watched, 1);
    assert_eq!(watcher.watched(), 1);
}

#[tokio::test(start_paused = true)]
async fn config_is_read_when_the_timer_fires() {
    let store = store_with(json!({ "chaosLevel": 3 })).await;
    let (tx, rx) = mpsc::unbounded_channel();
    let field = Arc::new(MemoryField::new(1, FieldKind::Text).with_value("thanks"));

    let mut watcher = FieldWatcher::new(&store, thanks_dictionary(), quiet_settings());
    watcher.watch(as_field(&field));
    assert_eq!(store.listener_count(), 1);
    let handle = tokio::spawn(watcher.run(rx));

    tx.send(PageEvent::edited(1)).unwrap();
    sleep(Duration::from_millis(500)).await;
    store
        .update(PartialChaosConfig {
            chaos_level: Some(0),
            ..Default::default()
        })
        .await;
    sleep(Duration::from_secs(1)).await;

    assert_eq!(field.value(), "thanks");

    drop(tx);
    let stats = handle.await.unwrap();
    assert_eq!(stats.mutation_attempts, 0);
    assert_eq!(store.listener_count(), 0, "watcher unsubscribes when it stops");
}

#[tokio::test(start_paused = true)]
async fn fields_debounce_independently() {
    let store = store_with(json!({ "chaosLevel": 3 })).await;
    let (tx, rx) = mpsc::unbounded_channel();
    let first = Arc::new(MemoryField::new(1, FieldKind::Text).with_value("thanks"));
    let second = Arc::new(MemoryField::new(2, FieldKind::Text).with_value("many thanks"));

    let mut watcher = FieldWatcher::new(&store, thanks_dictionary(), quiet_settings());
    watcher.watch_all([as_field(&first), as_field(&second)]);
    let handle = tokio::spawn(watcher.run(rx));

    tx.send(PageEvent::edited(1)).unwrap();
    sleep(Duration::from_millis(600)).await;
    tx.send(PageEvent::edited(2)).unwrap();

    sleep(Duration::from_millis(500)).await;
    assert_eq!(first.value(), "for the chaos");
    assert_eq!(second.value(), "many thanks");

    sleep(Duration::from_millis(600)).await;
    assert_eq!(second.value(), "many for the chaos");

    drop(tx);
    let stats = handle.await.unwrap();
    assert_eq!(stats.mutations_applied, 2);
}

#[tokio::test(start_paused = true)]
async fn ghost_character_is_injected_at_the_caret() {
    let store = store_with(json!({
        "chaosLevel": 5,
        "features": { "chaoticAutocomplete": false }
    }))
    .await;
    let (tx, rx) = mpsc::unbounded_channel();
    let field = Arc::new(MemoryField::new(1, FieldKind::Text).with_event_sink(tx.clone()));

    let settings = WatcherSettings {
        mutator: MutatorSettings {
            ghost_base_chance: 1.0,
            ..Default::default()
        },
        ..quiet_settings()
    };
    let mut watcher = FieldWatcher::new(&store, thanks_dictionary(), settings);
    watcher.watch(as_field(&field));
    let handle = tokio::spawn(watcher.run(rx));

    field.type_str("a");
    sleep(Duration::from_millis(50)).await;
    assert_eq!(field.value(), "a");

    sleep(Duration::from_millis(400)).await;
    let value: Vec<char> = field.value().chars().collect();
    assert_eq!(value.len(), 2);
    assert_eq!(value[0], 'a');
    assert_eq!(field.caret(), Some(2));
    assert_eq!(field.dispatched(), vec![Edit::Input]);

    drop(tx);
    drop(field);
    let stats = handle.await.unwrap();
    assert_eq!(stats.ghosts_applied, 1);
    assert_eq!(stats.mutation_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn email_fields_use_the_email_completion_set() {
    let store = store_with(json!({ "chaosLevel": 2 })).await;
    let (tx, rx) = mpsc::unbounded_channel();
    let email = Arc::new(MemoryField::new(1, FieldKind::Email).with_value("kind regards"));
    let text = Arc::new(MemoryField::new(2, FieldKind::Text).with_value("kind regards"));

    let dictionary = Arc::new(PhraseDictionary::builtin());
    let mut watcher = FieldWatcher::new(&store, dictionary, quiet_settings());
    watcher.watch_all([as_field(&email), as_field(&text)]);
    let handle = tokio::spawn(watcher.run(rx));

    tx.send(PageEvent::edited(1)).unwrap();
    tx.send(PageEvent::edited(2)).unwrap();
    sleep(Duration::from_millis(1100)).await;

    let signed = email.value();
    assert!(
        [
            "kind regards from the abyss",
            "kind regards from your sleep paralysis demon",
            "kind xoxo chaos",
        ]
        .contains(&signed.as_str()),
        "unexpected email value {signed:?}"
    );
    assert!(text.value().starts_with("kind regards, "));

    drop(tx);
    let stats = handle.await.unwrap();
    assert_eq!(stats.mutations_applied, 2);
}

#[tokio::test]
async fn dropping_a_watcher_releases_its_subscription() {
    let store = store_with(json!({ "chaosLevel": 3 })).await;

    for _ in 0..3 {
        let watcher = FieldWatcher::new(&store, thanks_dictionary(), quiet_settings());
        drop(watcher);
    }
    assert_eq!(store.listener_count(), 0);

    let (_tx, rx) = mpsc::unbounded_channel();
    let watcher = FieldWatcher::new(&store, thanks_dictionary(), quiet_settings());
    let handle = tokio::spawn(watcher.run(rx));
    tokio::task::yield_now().await;
    assert_eq!(store.listener_count(), 1);

    handle.abort();
    assert!(handle.await.unwrap_err().is_cancelled());
    assert_eq!(store.listener_count(), 0);
}

#[test]
fn settings_validation() {
    assert!(WatcherSettings::default().validate().is_ok());
    assert!(WatcherSettings {
        debounce: Duration::ZERO,
        ..Default::default()
    }
    .validate()
    .is_err());
    assert!(WatcherSettings {
        ghost_delay_min: Duration::from_millis(500),
        ghost_delay_max: Duration::from_millis(100),
        ..Default::default()
    }
    .validate()
    .is_err());
}
