//! Greeter shard.
//!
//! Greets whoever runs `/greet`, keeps a persistent greeting count and pulls in
//! one runtime library to exercise dependency resolution.

use serde_json::json;
use shard_api::{
    async_trait, export_shard, ArgValue, ArgumentType, CommandError, CommandMeta, CommandSender,
    DependencyCollector, DependencyLoader, ExportTable, Lang, LogEmitter, Param, Shard, ShardCommand,
    ShardContext, ShardError, StorageService, Subcommand, ValueKind,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const STORE: &str = "greeter";
pub const COUNT_KEY: &str = "greet_count";
/// Symbol other shards can resolve to read the greeting prefix.
pub const PREFIX_EXPORT: &str = "greeter.prefix";
pub const JSON_LIBRARY: &str = "com.google.code.gson:gson:2.11.0";
pub const LANG_TITLE: &str = "greeter";

// ============================================================================
// Command
// ============================================================================

/// Greeting counter shared by the shard and its command.
struct Counter {
    storage: Arc<dyn StorageService>,
    total: AtomicU64,
}

impl Counter {
    fn increment(&self) -> u64 {
        let total = self.total.fetch_add(1, Ordering::SeqCst) + 1;
        self.storage.save(STORE, COUNT_KEY, json!(total));
        total
    }
}

/// `/greet [player <name...>] [count]`
pub struct GreetCommand {
    counter: Arc<Counter>,
    log: LogEmitter,
    lang: Arc<Lang>,
}

impl GreetCommand {
    fn greet(&self, name: &str) -> Result<(), CommandError> {
        let total = self.counter.increment();
        let message = self
            .lang
            .format("greeting", &[&name, &total])
            .map_err(|e| CommandError::Failed(e.to_string()))?;
        self.log.info(message);
        Ok(())
    }
}

impl ShardCommand for GreetCommand {
    fn metadata(&self) -> Option<CommandMeta> {
        Some(
            CommandMeta::new("greet")
                .alias("hello")
                .description("Greets a player")
                .usage("/greet [player <name>] [count]")
                .permission("greeter.greet"),
        )
    }

    fn subcommands(&self) -> Vec<Subcommand> {
        let player = Arc::new(GreetCommand {
            counter: self.counter.clone(),
            log: self.log.clone(),
            lang: self.lang.clone(),
        });
        let counter = self.counter.clone();
        let log = self.log.clone();
        let lang = self.lang.clone();
        vec![
            Subcommand::new("player", vec![ValueKind::String], move |_, args| {
                let name = args.first().and_then(ArgValue::as_str).unwrap_or("stranger");
                player.greet(name)
            })
            .description("Greets someone by name")
            .param(Param::typed("name", ArgumentType::GreedyString)),
            Subcommand::new("count", Vec::<ValueKind>::new(), move |_, _| {
                let total = counter.total.load(Ordering::SeqCst);
                let message = lang
                    .format("count", &[&total])
                    .map_err(|e| CommandError::Failed(e.to_string()))?;
                log.info(message);
                Ok(())
            })
            .description("Shows the greeting count"),
        ]
    }

    fn middleware(&self, sender: &CommandSender, path: &str, _args: &[ArgValue]) -> bool {
        // Only players may greet others; the console may only read the count.
        !(sender.console && path == "player")
    }

    fn execute(&self, sender: &CommandSender) -> Result<(), CommandError> {
        self.greet(&sender.name)
    }
}

// ============================================================================
// Shard
// ============================================================================

struct GreeterDependencies;

impl DependencyLoader for GreeterDependencies {
    fn load_dependencies(&self, collector: &mut dyn DependencyCollector) -> Result<(), ShardError> {
        collector.dependency(JSON_LIBRARY)
    }
}

pub struct Greeter {
    counter: Option<Arc<Counter>>,
    lang: Option<Arc<Lang>>,
}

#[async_trait]
impl Shard for Greeter {
    async fn setup(&mut self, context: &ShardContext) -> Result<(), ShardError> {
        let log = context.logger()?;
        let storage = context.storage()?;
        let lang = Arc::new(context.lang(LANG_TITLE, "en", "US")?);
        let total = storage
            .get(STORE, COUNT_KEY)
            .await
            .and_then(|value| value.as_u64())
            .unwrap_or(0);

        let counter = Arc::new(Counter {
            storage,
            total: AtomicU64::new(total),
        });
        context.register_command(Arc::new(GreetCommand {
            counter: counter.clone(),
            log: log.clone(),
            lang: lang.clone(),
        }))?;
        context.publish_config_schema(json!({
            "type": "object",
            "properties": { "prefix": { "type": "string", "default": "Hello" } }
        }))?;

        let data_directory = context.data_directory()?.display().to_string();
        log.info(format!("👋 {}", lang.format("ready", &[&data_directory, &total])?));
        self.counter = Some(counter);
        self.lang = Some(lang);
        Ok(())
    }

    async fn teardown(&mut self, context: &ShardContext) -> Result<(), ShardError> {
        let total = self
            .counter
            .take()
            .map(|counter| counter.total.load(Ordering::SeqCst))
            .unwrap_or(0);
        let message = match self.lang.take() {
            Some(lang) => lang.format("farewell", &[&total])?,
            None => format!("Greeter shutting down after {} greeting(s)", total),
        };
        context.logger()?.info(format!("👋 {}", message));
        Ok(())
    }
}

/// The export table of this archive.
pub fn exports() -> ExportTable {
    ExportTable::new()
        .with_descriptor(include_str!("../shard.toml"))
        .with_factory(|_context: ShardContext| -> Result<Box<dyn Shard>, ShardError> {
            Ok(Box::new(Greeter {
                counter: None,
                lang: None,
            }))
        })
        .with_dependency_loader(GreeterDependencies)
        .with_lang(LANG_TITLE, "en", "US", include_str!("../lang/greeter_en_US.properties"))
        .export(PREFIX_EXPORT, "Hello".to_string())
}

export_shard!(exports());
