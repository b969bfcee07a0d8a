use std::sync::Arc;

use pretty_assertions::assert_eq;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

use gremlin::completion::{build_user_prompt, CompletionProvider, CompletionSource};
use gremlin::config::{ChaosConfig, CompletionSettings};
use gremlin::dictionary::{InputContext, PhraseDictionary, TriggerEntry};

fn thanks_dictionary() -> Arc<PhraseDictionary> {
    Arc::new(PhraseDictionary::new(
        [TriggerEntry::from_texts("thanks", ["for the chaos"])],
        vec!["allegedly".to_string()],
    ))
}

fn config_for(server: &MockServer, api_key: &str) -> ChaosConfig {
    ChaosConfig {
        chaos_level: 3,
        completion: Some(CompletionSettings {
            endpoint: format!("{}/v1/chat/completions", server.uri()),
            api_key: api_key.to_string(),
            model: None,
        }),
        ..ChaosConfig::default()
    }
}

#[tokio::test]
async fn empty_key_never_calls_the_network() {
    let server = MockServer::start().await;
    Mock::given(matchers::any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let provider = CompletionProvider::new(thanks_dictionary()).with_seed(1);
    let completion = provider
        .complete_detailed("lorem ipsum", &config_for(&server, ""))
        .await;

    assert_eq!(completion.source, CompletionSource::Local);
    assert_eq!(completion.text, "lorem ipsum, allegedly");
}

#[tokio::test]
async fn local_completion_replaces_trailing_trigger() {
    let provider = CompletionProvider::new(thanks_dictionary()).with_seed(2);
    let config = ChaosConfig::default();

    assert_eq!(provider.complete("thanks", &config).await, "for the chaos");
    assert_eq!(
        provider.complete("so many Thanks", &config).await,
        "so many for the chaos"
    );
}

#[tokio::test]
async fn local_completion_of_empty_prompt_is_not_empty() {
    let provider = CompletionProvider::new(thanks_dictionary()).with_seed(3);

    let text = provider.complete("   ", &ChaosConfig::default()).await;
    assert_eq!(text, "allegedly");
}

#[tokio::test]
async fn local_completion_uses_the_context_set() {
    let provider = CompletionProvider::new(Arc::new(PhraseDictionary::builtin())).with_seed(5);
    let config = ChaosConfig {
        chaos_level: 3,
        ..ChaosConfig::default()
    };

    let search = provider
        .complete_in("how to", Some(InputContext::Search), &config)
        .await;
    assert_eq!(search.source, CompletionSource::Local);
    assert!(
        ["how NOT to", "why you shouldn't", "the forbidden art of"].contains(&search.text.as_str()),
        "unexpected completion {:?}",
        search.text
    );

    let plain = provider.complete("how to", &config).await;
    assert!(plain.starts_with("how to, "), "unexpected completion {plain:?}");
}

#[test]
fn user_prompt_quotes_the_phrase() {
    let prompt = build_user_prompt("  see you at ");
    assert!(prompt.contains("\"see you at\""), "unexpected prompt: {prompt}");
}

#[cfg(not(feature = "llm"))]
#[tokio::test]
async fn configured_key_without_llm_feature_falls_back() {
    let server = MockServer::start().await;
    Mock::given(matchers::any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let provider = CompletionProvider::new(thanks_dictionary()).with_seed(4);
    let completion = provider
        .complete_detailed("thanks", &config_for(&server, "sk-test"))
        .await;

    assert_eq!(completion.source, CompletionSource::Local);
    assert_eq!(completion.text, "for the chaos");
}

#[cfg(feature = "llm")]
mod remote {
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;

    use gremlin::config::{PartialChaosConfig, STORAGE_KEY};
    use gremlin::field::{Edit, FieldKind, MemoryField, PageEvent, TextField};
    use gremlin::mutator::MutatorSettings;
    use gremlin::storage::MemoryStore;
    use gremlin::store::ConfigStore;
    use gremlin::watcher::{FieldWatcher, WatcherSettings};

    use super::*;
    use pretty_assertions::assert_eq;

    fn chat_response(content: &str) -> serde_json::Value {
        json!({
            "id": "chatcmpl-test",
            "choices": [
                { "index": 0, "message": { "role": "assistant", "content": content } }
            ]
        })
    }

    #[tokio::test]
    async fn successful_response_is_used() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/v1/chat/completions"))
            .and(matchers::header("authorization", "Bearer sk-test"))
            .and(matchers::body_partial_json(json!({
                "model": "openai/gpt-3.5-turbo",
                "max_tokens": 20
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(chat_response("\"thanks for nothing\"")),
            )
            .expect(1)
            .mount(&server)
            .await;

        let provider = CompletionProvider::new(thanks_dictionary());
        let completion = provider
            .complete_detailed("thanks", &config_for(&server, "sk-test"))
            .await;

        assert_eq!(completion.source, CompletionSource::Remote);
        assert_eq!(completion.text, "thanks for nothing");
    }

    #[tokio::test]
    async fn continuation_is_joined_to_prompt() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_response("to the void")))
            .expect(1)
            .mount(&server)
            .await;

        let provider = CompletionProvider::new(thanks_dictionary());
        let text = provider
            .complete("thanks", &config_for(&server, "sk-test"))
            .await;

        assert_eq!(text, "thanks to the void");
    }

    #[tokio::test]
    async fn configured_model_is_sent() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::body_partial_json(json!({ "model": "tiny/chaos-1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_response("thanks a lot")))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = config_for(&server, "sk-test");
        if let Some(completion) = config.completion.as_mut() {
            completion.model = Some("tiny/chaos-1".to_string());
        }

        let provider = CompletionProvider::new(thanks_dictionary());
        let completion = provider.complete_detailed("thanks", &config).await;
        assert_eq!(completion.source, CompletionSource::Remote);
    }

    #[tokio::test]
    async fn server_error_falls_back_without_retry() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("Internal Server Error"))
            .expect(1)
            .mount(&server)
            .await;

        let provider = CompletionProvider::new(thanks_dictionary()).with_seed(5);
        let completion = provider
            .complete_detailed("thanks", &config_for(&server, "sk-test"))
            .await;

        assert_eq!(completion.source, CompletionSource::Local);
        assert_eq!(completion.text, "for the chaos");
    }

    #[tokio::test]
    async fn empty_or_malformed_content_falls_back() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/empty/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_response("  ")))
            .mount(&server)
            .await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/garbage/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let provider = CompletionProvider::new(thanks_dictionary()).with_seed(6);
        for prefix in ["empty", "garbage"] {
            let config = ChaosConfig {
                completion: Some(CompletionSettings {
                    endpoint: format!("{}/{prefix}/v1/chat/completions", server.uri()),
                    api_key: "sk-test".to_string(),
                    model: None,
                }),
                ..ChaosConfig::default()
            };
            let completion = provider.complete_detailed("lorem ipsum", &config).await;
            assert_eq!(completion.source, CompletionSource::Local, "{prefix}");
            assert_eq!(completion.text, "lorem ipsum, allegedly", "{prefix}");
        }
    }

    async fn remote_store(server: &MockServer, level: u8) -> ConfigStore {
        let store = ConfigStore::new(Arc::new(MemoryStore::with_entry(
            STORAGE_KEY,
            json!({ "chaosLevel": level }),
        )));
        store.load().await;
        let remote = config_for(server, "sk-test");
        store
            .update(PartialChaosConfig {
                completion: remote.completion,
                ..Default::default()
            })
            .await;
        store
    }

    fn fast_settings() -> WatcherSettings {
        WatcherSettings {
            debounce: Duration::from_millis(20),
            seed: Some(7),
            mutator: MutatorSettings {
                ghost_base_chance: 0.0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Watch one text field holding `value` and report a single user edit.
    fn spawn_watcher(
        store: &ConfigStore,
        dictionary: Arc<PhraseDictionary>,
        value: &str,
    ) -> (
        Arc<MemoryField>,
        mpsc::UnboundedSender<PageEvent>,
        tokio::task::JoinHandle<gremlin::watcher::WatcherStats>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let field = Arc::new(MemoryField::new(1, FieldKind::Text).with_value(value));
        let provider = Arc::new(CompletionProvider::new(Arc::clone(&dictionary)));
        let mut watcher =
            FieldWatcher::new(store, dictionary, fast_settings()).with_completion(provider);
        let watched: Arc<dyn TextField> = field.clone();
        watcher.watch(watched);
        let handle = tokio::spawn(watcher.run(rx));
        tx.send(PageEvent::edited(1)).unwrap();
        (field, tx, handle)
    }

    #[tokio::test]
    async fn watcher_applies_remote_completion_to_trigger() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_response("thanks, I guess")))
            .expect(1)
            .mount(&server)
            .await;

        let store = remote_store(&server, 3).await;
        let (field, tx, handle) = spawn_watcher(&store, thanks_dictionary(), "well thanks");

        for _ in 0..100 {
            if field.value() != "well thanks" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert_eq!(field.value(), "well thanks, I guess");
        assert_eq!(field.dispatched(), vec![Edit::Input]);

        drop(tx);
        let stats = handle.await.unwrap();
        assert_eq!(stats.completions_requested, 1);
        assert_eq!(stats.mutations_applied, 1);
    }

    #[tokio::test]
    async fn finished_text_is_never_sent_for_completion() {
        let server = MockServer::start().await;
        Mock::given(matchers::any())
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_response("thanks again")))
            .expect(0)
            .mount(&server)
            .await;

        let store = remote_store(&server, 3).await;
        let dictionary = Arc::new(PhraseDictionary::builtin());
        let (field, tx, handle) = spawn_watcher(&store, dictionary, "thanks but no thanks");
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(field.value(), "thanks but no thanks");
        assert!(field.dispatched().is_empty());

        drop(tx);
        let stats = handle.await.unwrap();
        assert_eq!(stats.mutation_attempts, 1);
        assert_eq!(stats.completions_requested, 0);
    }

    #[tokio::test]
    async fn trigger_without_a_legal_candidate_is_not_sent() {
        let server = MockServer::start().await;
        Mock::given(matchers::any())
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_response("please, no")))
            .expect(0)
            .mount(&server)
            .await;

        // "please" needs chaos level 2.
        let store = remote_store(&server, 1).await;
        let dictionary = Arc::new(PhraseDictionary::builtin());
        let (field, tx, handle) = spawn_watcher(&store, dictionary, "oh please");
        tokio::time::sleep(Duration::from_millis(300)).await;

        let value = field.value();
        assert!(value.starts_with("oh please, "), "unexpected value {value:?}");
        assert_ne!(value, "oh please, no");

        drop(tx);
        let stats = handle.await.unwrap();
        assert_eq!(stats.completions_requested, 0);
        assert_eq!(stats.mutations_applied, 1);
    }
}
