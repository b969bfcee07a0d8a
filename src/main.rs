use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc;

use gremlin::completion::CompletionProvider;
use gremlin::config::{ChaosConfig, CompletionSettings, PartialChaosConfig};
use gremlin::cursor::{CursorWander, Point, FRAME_INTERVAL};
use gremlin::dictionary::{InputContext, PhraseDictionary};
use gremlin::field::{FieldKind, MemoryField, PageEvent, TextField};
use gremlin::mutator::{mutate_in, MutatorSettings};
use gremlin::storage::JsonFileStore;
use gremlin::store::ConfigStore;
use gremlin::watcher::{FieldWatcher, WatcherSettings};

const API_KEY_ENV: &str = "GREMLIN_API_KEY";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Toggle {
    On,
    Off,
}

impl Toggle {
    fn apply(self, flag: &mut bool) {
        *flag = self == Toggle::On;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ContextArg {
    Email,
    Social,
    Search,
    Chat,
}

impl From<ContextArg> for InputContext {
    fn from(arg: ContextArg) -> Self {
        match arg {
            ContextArg::Email => InputContext::Email,
            ContextArg::Social => InputContext::Social,
            ContextArg::Search => InputContext::Search,
            ContextArg::Chat => InputContext::Chat,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "gremlin")]
#[command(about = "Chaotic autocomplete, ghost typing and cursor wander for text fields", long_about = None)]
struct Cli {
    /// Storage file holding the persisted chaos config
    #[arg(long, value_name = "PATH", global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show or change the persisted chaos config
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Run autocomplete once over a text and print the result
    Mutate {
        #[arg(long)]
        text: String,

        /// Override the stored chaos level
        #[arg(long, value_parser = clap::value_parser!(u8).range(0..=5))]
        level: Option<u8>,

        /// Optional RNG seed (for debugging)
        #[arg(long)]
        seed: Option<u64>,

        /// Custom dictionary file (JSON)
        #[arg(long, value_name = "PATH")]
        dictionary: Option<PathBuf>,

        /// Decorate the insertion with the chaos level's modifier
        #[arg(long)]
        decorate: bool,

        /// Also use the completion set for this kind of field
        #[arg(long, value_enum)]
        context: Option<ContextArg>,
    },

    /// Complete a phrase; remote when an API key is configured
    ///
    /// The key may also come from GREMLIN_API_KEY (or a .env file).
    Complete {
        #[arg(long)]
        prompt: String,

        /// Optional RNG seed (for debugging)
        #[arg(long)]
        seed: Option<u64>,

        /// Also use the completion set for this kind of field
        #[arg(long, value_enum)]
        context: Option<ContextArg>,
    },

    /// Type text into a virtual field through the full watcher pipeline
    Type {
        #[arg(long)]
        text: String,

        /// Optional RNG seed (for debugging)
        #[arg(long)]
        seed: Option<u64>,

        /// Delay between typed characters
        #[arg(long, default_value_t = 60)]
        delay_ms: u64,

        #[arg(long, default_value_t = 1000)]
        debounce_ms: u64,

        /// Custom dictionary file (JSON)
        #[arg(long, value_name = "PATH")]
        dictionary: Option<PathBuf>,
    },

    /// Print jittered cursor positions around a point
    Wander {
        #[arg(long, default_value_t = 0.0)]
        x: f64,

        #[arg(long, default_value_t = 0.0)]
        y: f64,

        #[arg(long, default_value_t = 5)]
        frames: usize,

        /// Optional RNG seed (for debugging)
        #[arg(long)]
        seed: Option<u64>,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigAction {
    /// Print the config as JSON
    Show,

    /// Merge changes into the stored config
    Set {
        #[arg(long, value_parser = clap::value_parser!(u8).range(0..=5))]
        level: Option<u8>,

        #[arg(long, value_enum)]
        ghost: Option<Toggle>,

        #[arg(long, value_enum)]
        autocomplete: Option<Toggle>,

        #[arg(long, value_enum)]
        cursor: Option<Toggle>,

        /// Chat-completions URL
        #[arg(long, value_name = "URL")]
        endpoint: Option<String>,

        /// Bearer key for the endpoint; empty disables remote completion
        #[arg(long)]
        api_key: Option<String>,

        #[arg(long)]
        model: Option<String>,
    },
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn rng_from_seed(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

fn load_dictionary(path: Option<&PathBuf>) -> Result<Arc<PhraseDictionary>> {
    let dictionary = match path {
        Some(path) => PhraseDictionary::from_path(path)?,
        None => PhraseDictionary::builtin(),
    };
    Ok(Arc::new(dictionary))
}

/// Fill in the API key from the environment when the stored config has none.
fn with_env_api_key(mut config: ChaosConfig) -> ChaosConfig {
    dotenvy::dotenv().ok();
    let Ok(api_key) = std::env::var(API_KEY_ENV) else {
        return config;
    };
    if api_key.trim().is_empty() || config.remote_completion().is_some() {
        return config;
    }

    let mut completion = config.completion.take().unwrap_or_default();
    completion.api_key = api_key;
    config.completion = Some(completion);
    config
}

fn print_json(config: &ChaosConfig) -> Result<()> {
    let json = serde_json::to_string_pretty(config).context("failed to serialize config")?;
    println!("{json}");
    Ok(())
}

async fn set_config(store: &ConfigStore, action_set: SetArgs) -> Result<()> {
    let current = store.current();

    let mut features = current.features;
    if let Some(toggle) = action_set.ghost {
        toggle.apply(&mut features.ghost_typing);
    }
    if let Some(toggle) = action_set.autocomplete {
        toggle.apply(&mut features.chaotic_autocomplete);
    }
    if let Some(toggle) = action_set.cursor {
        toggle.apply(&mut features.wandering_cursor);
    }

    let completion = if action_set.endpoint.is_some()
        || action_set.api_key.is_some()
        || action_set.model.is_some()
    {
        let mut completion: CompletionSettings = current.completion.clone().unwrap_or_default();
        if let Some(endpoint) = action_set.endpoint {
            completion.endpoint = endpoint;
        }
        if let Some(api_key) = action_set.api_key {
            completion.api_key = api_key;
        }
        if let Some(model) = action_set.model {
            completion.model = Some(model).filter(|m| !m.trim().is_empty());
        }
        Some(completion)
    } else {
        None
    };

    let partial = PartialChaosConfig {
        chaos_level: action_set.level,
        features: (features != current.features).then_some(features),
        completion,
    };
    if partial.is_empty() {
        return Err(anyhow!("nothing to change; pass at least one option"));
    }

    store.update(partial).await;
    print_json(&store.current())
}

struct SetArgs {
    level: Option<u8>,
    ghost: Option<Toggle>,
    autocomplete: Option<Toggle>,
    cursor: Option<Toggle>,
    endpoint: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
}

async fn wait_for_change(field: &MemoryField, before: &str, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    while field.value() == before && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn type_text(
    store: &ConfigStore,
    dictionary: Arc<PhraseDictionary>,
    text: &str,
    seed: Option<u64>,
    delay: Duration,
    debounce: Duration,
) -> Result<String> {
    let settings = WatcherSettings {
        debounce,
        seed,
        ..Default::default()
    };
    settings.validate()?;

    let mut provider = CompletionProvider::new(Arc::clone(&dictionary));
    if let Some(seed) = seed {
        provider = provider.with_seed(seed);
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let field = Arc::new(MemoryField::new(1, FieldKind::Text).with_event_sink(tx.clone()));
    let watcher = FieldWatcher::new(store, dictionary, settings).with_completion(Arc::new(provider));
    let handle = tokio::spawn(watcher.run(rx));

    let appeared: Arc<dyn TextField> = field.clone();
    tx.send(PageEvent::Appeared(appeared))
        .map_err(|_| anyhow!("watcher stopped before typing started"))?;

    for c in text.chars() {
        field.type_str(c.encode_utf8(&mut [0u8; 4]));
        tokio::time::sleep(delay).await;
    }

    let typed = field.value();
    tokio::time::sleep(debounce + Duration::from_millis(200)).await;
    if store.current().remote_completion().is_some() {
        wait_for_change(&field, &typed, Duration::from_secs(10)).await;
    }

    let value = field.value();
    drop(tx);
    drop(field);
    let stats = handle.await.context("watcher task failed")?;
    eprintln!(
        "Watcher: {} attempts, {} mutations, {} completions, {} ghost characters",
        stats.mutation_attempts,
        stats.mutations_applied,
        stats.completions_requested,
        stats.ghosts_applied
    );
    Ok(value)
}

async fn run(cli: Cli) -> Result<()> {
    let storage_path = cli.store.unwrap_or_else(JsonFileStore::default_path);
    let store = ConfigStore::new(Arc::new(JsonFileStore::new(storage_path)));
    let config = store.load().await;

    match cli.command {
        Command::Config { action } => match action {
            ConfigAction::Show => print_json(&config)?,
            ConfigAction::Set {
                level,
                ghost,
                autocomplete,
                cursor,
                endpoint,
                api_key,
                model,
            } => {
                let args = SetArgs {
                    level,
                    ghost,
                    autocomplete,
                    cursor,
                    endpoint,
                    api_key,
                    model,
                };
                set_config(&store, args).await?;
            }
        },
        Command::Mutate {
            text,
            level,
            seed,
            dictionary,
            decorate,
            context,
        } => {
            let dictionary = load_dictionary(dictionary.as_ref())?;
            let mut config = config;
            if let Some(level) = level {
                config.chaos_level = level;
            }
            let settings = MutatorSettings {
                decorate,
                ..Default::default()
            };
            let mut rng = rng_from_seed(seed);

            let result = mutate_in(
                &text,
                context.map(Into::into),
                &config,
                &dictionary,
                None,
                &settings,
                &mut rng,
            );
            if !result.changed {
                eprintln!("No mutation.");
            }
            println!("{}", result.new_text);
        }
        Command::Complete {
            prompt,
            seed,
            context,
        } => {
            let dictionary = load_dictionary(None)?;
            let mut provider = CompletionProvider::new(dictionary);
            if let Some(seed) = seed {
                provider = provider.with_seed(seed);
            }

            let completion = provider
                .complete_in(&prompt, context.map(Into::into), &with_env_api_key(config))
                .await;
            eprintln!("Source: {:?}", completion.source);
            println!("{}", completion.text);
        }
        Command::Type {
            text,
            seed,
            delay_ms,
            debounce_ms,
            dictionary,
        } => {
            let dictionary = load_dictionary(dictionary.as_ref())?;
            let value = type_text(
                &store,
                dictionary,
                &text,
                seed,
                Duration::from_millis(delay_ms),
                Duration::from_millis(debounce_ms),
            )
            .await?;
            println!("{value}");
        }
        Command::Wander { x, y, frames, seed } => {
            let wander = CursorWander::default();
            let mut rng = rng_from_seed(seed);
            let real = Point::new(x, y);
            for frame in 0..frames {
                let shown = wander.offset(real, &config, &mut rng);
                println!(
                    "{:>6.1}ms  {:.1}, {:.1}",
                    frame as f64 * FRAME_INTERVAL.as_secs_f64() * 1000.0,
                    shown.x,
                    shown.y
                );
            }
        }
    }

    Ok(())
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    runtime.block_on(run(cli))
}
