//! End-to-end lifecycle tests driven through in-process archives.

use async_trait::async_trait;
use parking_lot::Mutex;
use shard_system::shard_api::{
    ArgValue, ArgumentType, CommandError, CommandMeta, CommandSender, Coordinate, DependencyCollector,
    DependencyLoader, ExportTable, LifecycleState, Param, RemoteRepository, Shard, ShardCommand,
    ShardContext, ShardError, Subcommand, SymbolOrigin, ValueKind,
};
use shard_system::{
    CommandTable, LoadReport, ManagerConfig, MemoryFetcher, RouteOutcome, ShardManager, StaticArchives,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

type Journal = Arc<Mutex<Vec<String>>>;

const REPOSITORY: &str = "https://repo.test/maven2";

#[derive(Clone, Default)]
struct Behavior {
    panic_in_pre_setup: bool,
    touch_context_in_factory: bool,
    dependency_loader: Option<Arc<dyn DependencyLoader>>,
    setup_commands: Vec<Arc<dyn ShardCommand>>,
    lookup: Option<String>,
}

/// Journals every hook it runs as `"<hook> <id>"`.
struct Probe {
    id: String,
    journal: Journal,
    behavior: Behavior,
}

#[async_trait]
impl Shard for Probe {
    async fn pre_setup(&mut self, context: &ShardContext) -> Result<(), ShardError> {
        self.journal.lock().push(format!("pre_setup {}", self.id));
        if self.behavior.panic_in_pre_setup {
            panic!("boom in pre-setup");
        }
        if let Some(loader) = &self.behavior.dependency_loader {
            context.set_dependency_loader(loader.clone())?;
        }
        Ok(())
    }

    async fn setup(&mut self, context: &ShardContext) -> Result<(), ShardError> {
        self.journal.lock().push(format!("setup {}", self.id));
        if let Some(name) = &self.behavior.lookup {
            let symbol = context.lookup_symbol(name)?;
            let value = symbol.downcast_ref::<String>().cloned().unwrap_or_default();
            self.journal.lock().push(format!("found {}", value));
        }
        for command in &self.behavior.setup_commands {
            context.register_command(command.clone())?;
        }
        Ok(())
    }

    async fn teardown(&mut self, _context: &ShardContext) -> Result<(), ShardError> {
        self.journal.lock().push(format!("teardown {}", self.id));
        Ok(())
    }
}

struct Declares(Vec<Coordinate>);

impl DependencyLoader for Declares {
    fn load_dependencies(&self, collector: &mut dyn DependencyCollector) -> Result<(), ShardError> {
        collector.repository(REPOSITORY)?;
        for coordinate in &self.0 {
            collector.add_dependency(coordinate.clone())?;
        }
        Ok(())
    }
}

/// `ledger` with `deposit <int>` and `history`, plus the default handler.
struct Ledger {
    name: &'static str,
    journal: Journal,
}

impl ShardCommand for Ledger {
    fn metadata(&self) -> Option<CommandMeta> {
        Some(CommandMeta::new(self.name))
    }

    fn subcommands(&self) -> Vec<Subcommand> {
        let deposit = self.journal.clone();
        let history = self.journal.clone();
        vec![
            Subcommand::new("deposit", vec![ValueKind::Integer], move |_, args| {
                deposit.lock().push(format!("deposit {}", args[0]));
                Ok(())
            })
            .param(Param::typed("amount", ArgumentType::Integer)),
            Subcommand::new("history", Vec::<ValueKind>::new(), move |_, _| {
                history.lock().push("history".to_string());
                Ok(())
            }),
        ]
    }

    fn middleware(&self, _sender: &CommandSender, path: &str, _args: &[ArgValue]) -> bool {
        self.journal.lock().push(format!("middleware {} '{}'", self.name, path));
        true
    }

    fn execute(&self, _sender: &CommandSender) -> Result<(), CommandError> {
        self.journal.lock().push(format!("default {}", self.name));
        Ok(())
    }
}

struct Harness {
    dir: TempDir,
    archives: StaticArchives,
    files: Vec<String>,
    fetcher: Arc<MemoryFetcher>,
    table: Arc<CommandTable>,
    journal: Journal,
}

impl Harness {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            archives: StaticArchives::new(),
            files: Vec::new(),
            fetcher: Arc::new(MemoryFetcher::new()),
            table: Arc::new(CommandTable::new()),
            journal: Journal::default(),
        }
    }

    fn exports(&self, id: &str, dependencies: &[&str], behavior: Behavior) -> ExportTable {
        let dependencies = dependencies
            .iter()
            .map(|dependency| format!("\"{}\"", dependency))
            .collect::<Vec<_>>()
            .join(", ");
        let journal = self.journal.clone();
        let shard_id = id.to_string();
        ExportTable::new()
            .with_descriptor(format!(
                "id = \"{}\"\nname = \"{}\"\nversion = \"1.0.0\"\ndependencies = [{}]",
                id, id, dependencies
            ))
            .with_factory(move |context: ShardContext| -> Result<Box<dyn Shard>, ShardError> {
                if behavior.touch_context_in_factory {
                    context.logger()?.info("constructing");
                }
                Ok(Box::new(Probe {
                    id: shard_id.clone(),
                    journal: journal.clone(),
                    behavior: behavior.clone(),
                }))
            })
    }

    fn archive(mut self, file: &str, table: ExportTable) -> Self {
        self.archives = std::mem::take(&mut self.archives).with(file, table);
        self.files.push(file.to_string());
        self
    }

    fn shard(self, id: &str, dependencies: &[&str], behavior: Behavior) -> Self {
        let table = self.exports(id, dependencies, behavior);
        self.archive(&format!("{}.shard", id), table)
    }

    fn config(&self) -> ManagerConfig {
        let mut config = ManagerConfig::new(self.dir.path());
        config.resolver.default_repositories = Vec::new();
        config.resolver.attempts = 2;
        config.resolver.retry_backoff = Duration::from_millis(1);
        config
    }

    fn manager(&mut self) -> ShardManager {
        let config = self.config();
        std::fs::create_dir_all(&config.shard_directory).unwrap();
        for file in &self.files {
            std::fs::write(config.shard_directory.join(file), b"").unwrap();
        }
        ShardManager::builder(config)
            .opener(Arc::new(std::mem::take(&mut self.archives)))
            .fetcher(self.fetcher.clone())
            .dispatcher(self.table.clone())
            .shared_export("host.name", "frost-test".to_string())
            .build()
            .unwrap()
    }

    fn journal(&self) -> Vec<String> {
        self.journal.lock().clone()
    }

    fn position(&self, entry: &str) -> usize {
        self.journal()
            .iter()
            .position(|line| line == entry)
            .unwrap_or_else(|| panic!("'{}' not in journal {:?}", entry, self.journal()))
    }
}

fn error_of<'a>(report: &'a LoadReport, id: &str) -> &'a str {
    report.get(id).and_then(|result| result.error.as_deref()).unwrap_or("")
}

#[tokio::test]
async fn test_dependency_loads_first_and_tears_down_last() {
    let mut harness = Harness::new()
        .shard("alpha", &["zeta"], Behavior::default())
        .shard("zeta", &[], Behavior::default());
    let manager = harness.manager();

    let report = manager.load_all().await.unwrap();

    assert_eq!(report.successes(), 2, "{:?}", report.render());
    assert_eq!(report.install_order, vec!["zeta", "alpha"]);
    assert_eq!(manager.activation_order(), vec!["zeta", "alpha"]);
    assert!(harness.position("setup zeta") < harness.position("setup alpha"));
    assert_eq!(manager.state_of("alpha").await, Some(LifecycleState::Active));
    assert!(manager.shard_directory().join("alpha").is_dir());

    // Discovery order is kept in the report.
    let ids: Vec<&str> = report.results.iter().map(|result| result.id.as_str()).collect();
    assert_eq!(ids, vec!["alpha", "zeta"]);

    let teardown = manager.shutdown_all().await;
    assert_eq!(teardown.successes(), 2);
    let order: Vec<&str> = teardown.results.iter().map(|result| result.id.as_str()).collect();
    assert_eq!(order, vec!["alpha", "zeta"]);
    assert!(harness.position("teardown alpha") < harness.position("teardown zeta"));
    assert!(manager.active_shards().await.is_empty());
    assert!(manager.arena().is_empty());
}

#[tokio::test]
async fn test_every_setup_runs_after_its_dependencies() {
    let mut harness = Harness::new()
        .shard("app", &["db", "cache"], Behavior::default())
        .shard("cache", &["db"], Behavior::default())
        .shard("db", &[], Behavior::default())
        .shard("metrics", &["app"], Behavior::default())
        .shard("solo", &[], Behavior::default());
    let manager = harness.manager();

    let report = manager.load_all().await.unwrap();
    assert_eq!(report.successes(), 5);

    let edges = [("app", "db"), ("app", "cache"), ("cache", "db"), ("metrics", "app")];
    for (shard, dependency) in edges {
        assert!(
            harness.position(&format!("setup {}", dependency)) < harness.position(&format!("setup {}", shard)),
            "{} set up before {}",
            shard,
            dependency
        );
    }
    // Pre-setup always completes for everyone before any setup starts.
    let last_pre_setup = ["app", "cache", "db", "metrics", "solo"]
        .iter()
        .map(|id| harness.position(&format!("pre_setup {}", id)))
        .max()
        .unwrap();
    let first_setup = harness.position("setup db").min(harness.position("setup solo"));
    assert!(last_pre_setup < first_setup);
}

#[tokio::test]
async fn test_cycle_fails_only_its_members() {
    let mut harness = Harness::new()
        .shard("x", &["y"], Behavior::default())
        .shard("y", &["x"], Behavior::default())
        .shard("z", &[], Behavior::default());
    let manager = harness.manager();

    let report = manager.load_all().await.unwrap();

    assert_eq!(report.failed_with("CircularDependencyError").len(), 2);
    assert_eq!(error_of(&report, "x"), "CircularDependencyError: x -> y -> x");
    assert_eq!(error_of(&report, "y"), "CircularDependencyError: y -> x -> y");
    assert_eq!(manager.state_of("z").await, Some(LifecycleState::Active));
    assert_eq!(
        manager.state_of("x").await,
        Some(LifecycleState::DependenciesResolved)
    );
    assert!(!harness.journal().contains(&"setup x".to_string()));
}

#[tokio::test]
async fn test_missing_dependency_is_contained() {
    let mut harness = Harness::new()
        .shard("m", &["ghost"], Behavior::default())
        .shard("n", &["m"], Behavior::default())
        .shard("o", &[], Behavior::default());
    let manager = harness.manager();

    let report = manager.load_all().await.unwrap();

    assert_eq!(error_of(&report, "m"), "MissingDependencyError: missing dependency 'ghost'");
    assert!(error_of(&report, "n").starts_with("DependencyFailedError"));
    assert!(report.get("o").unwrap().success);
    assert_eq!(report.install_order, vec!["o"]);
    let journal = harness.journal();
    assert!(!journal.contains(&"setup m".to_string()));
    assert!(!journal.contains(&"setup n".to_string()));
}

#[tokio::test]
async fn test_duplicate_id_keeps_first_archive() {
    let harness = Harness::new();
    let first = harness.exports("dup", &[], Behavior::default());
    let second = harness.exports("dup", &[], Behavior::default());
    let mut harness = harness.archive("dup-a.shard", first).archive("dup-b.shard", second);
    let manager = harness.manager();

    let report = manager.load_all().await.unwrap();

    assert_eq!(report.results.len(), 2);
    assert_eq!(report.successes(), 1);
    assert!(report.results[0].success);
    assert!(report.results[0].archive.ends_with("dup-a.shard"));
    let rejected = &report.results[1];
    assert!(rejected.archive.ends_with("dup-b.shard"));
    assert!(rejected.error.as_deref().unwrap().starts_with("DuplicateShardIdError"));
    assert_eq!(harness.journal().iter().filter(|line| *line == "setup dup").count(), 1);
}

#[tokio::test]
async fn test_pre_setup_panic_is_contained() {
    let panicking = Behavior {
        panic_in_pre_setup: true,
        ..Behavior::default()
    };
    let mut harness = Harness::new()
        .shard("p", &[], panicking)
        .shard("q", &["p"], Behavior::default())
        .shard("r", &[], Behavior::default());
    let manager = harness.manager();

    let report = manager.load_all().await.unwrap();

    let error = error_of(&report, "p");
    assert!(error.starts_with("LifecycleHookError"), "{}", error);
    assert!(error.contains("boom in pre-setup"), "{}", error);
    assert_eq!(manager.state_of("p").await, Some(LifecycleState::PreSetupRunning));
    assert!(error_of(&report, "q").starts_with("DependencyFailedError"));
    assert!(report.get("r").unwrap().success);
}

#[tokio::test]
async fn test_context_use_in_factory_is_rejected() {
    let eager = Behavior {
        touch_context_in_factory: true,
        ..Behavior::default()
    };
    let mut harness = Harness::new().shard("eager", &[], eager).shard("calm", &[], Behavior::default());
    let manager = harness.manager();

    let report = manager.load_all().await.unwrap();

    let error = error_of(&report, "eager");
    assert!(error.starts_with("ContextNotBoundError"), "{}", error);
    assert!(error.contains("logger"), "{}", error);
    assert_eq!(report.get("eager").unwrap().state, LifecycleState::Discovered);
    assert!(report.get("calm").unwrap().success);
}

#[tokio::test]
async fn test_archive_without_factory_or_descriptor() {
    let mut harness = Harness::new()
        .archive(
            "nofactory.shard",
            ExportTable::new().with_descriptor("id = \"nofactory\"\nname = \"No Factory\"\nversion = \"1\""),
        )
        .archive("blank.shard", ExportTable::new())
        .shard("ok", &["nofactory"], Behavior::default());
    let manager = harness.manager();

    let report = manager.load_all().await.unwrap();

    assert!(error_of(&report, "nofactory").starts_with("MissingFactoryError"));
    assert!(error_of(&report, "blank.shard").starts_with("MissingDescriptorError"));
    // The factory-less shard is known, so its dependent fails by inheritance.
    assert!(error_of(&report, "ok").starts_with("DependencyFailedError"));
}

#[tokio::test]
async fn test_libraries_are_resolved_once_and_cached() {
    let coordinate = Coordinate::new("org.frost", "economy-core", "2.1.0");
    let harness = Harness::new();
    harness
        .fetcher
        .publish(&RemoteRepository::new(REPOSITORY), &coordinate, b"economy core bytes");
    let behavior = Behavior {
        dependency_loader: Some(Arc::new(Declares(vec![coordinate.clone(), coordinate.clone()]))),
        ..Behavior::default()
    };
    let mut harness = harness.shard("economy", &[], behavior);
    let manager = harness.manager();

    let report = manager.load_all().await.unwrap();
    let result = report.get("economy").unwrap();
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.libraries.len(), 1);
    let library = result.libraries[0].clone();
    assert_eq!(std::fs::read(&library).unwrap(), b"economy core bytes");
    assert!(library.starts_with(harness.dir.path().join("libraries").canonicalize().unwrap()));

    let loader = manager.loader_of("economy").unwrap();
    assert_eq!(loader.library_paths(), vec![library.clone()]);
    let first = loader.add_library_path(&library).unwrap();
    let second = loader.add_library_path(&library).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(loader.library_paths().len(), 1);

    // A second run resolves from the cache without touching the network.
    let fetched = harness.fetcher.request_count();
    manager.shutdown_all().await;
    let again = manager.load_all().await.unwrap();
    assert!(again.get("economy").unwrap().success);
    assert_eq!(harness.fetcher.request_count(), fetched);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shards_sharing_a_library_resolve_concurrently() {
    let coordinate = Coordinate::new("org.frost", "shared-codec", "3.0");
    for _ in 0..10 {
        let mut harness = Harness::new();
        harness
            .fetcher
            .publish(&RemoteRepository::new(REPOSITORY), &coordinate, b"shared codec bytes");
        for id in ["alpha", "bravo", "charlie", "delta"] {
            let behavior = Behavior {
                dependency_loader: Some(Arc::new(Declares(vec![coordinate.clone()]))),
                ..Behavior::default()
            };
            harness = harness.shard(id, &[], behavior);
        }
        let manager = harness.manager();

        let report = manager.load_all().await.unwrap();
        assert_eq!(report.successes(), 4, "{:?}", report.render());
        let library = &report.get("alpha").unwrap().libraries[0];
        assert_eq!(std::fs::read(library).unwrap(), b"shared codec bytes");
    }
}

#[tokio::test]
async fn test_corrupted_cache_fails_resolution() {
    let coordinate = Coordinate::new("org.frost", "tampered", "1.0");
    let harness = Harness::new();
    harness
        .fetcher
        .publish(&RemoteRepository::new(REPOSITORY), &coordinate, b"original");
    let behavior = Behavior {
        dependency_loader: Some(Arc::new(Declares(vec![coordinate]))),
        ..Behavior::default()
    };
    let mut harness = harness.shard("victim", &["missing"], behavior).shard("bystander", &[], Behavior::default());
    let manager = harness.manager();

    // First run caches the artifact; the shard itself fails on its missing dependency.
    let report = manager.load_all().await.unwrap();
    let library = report.get("victim").unwrap().libraries[0].clone();
    manager.shutdown_all().await;

    std::fs::write(&library, b"tampered").unwrap();
    let report = manager.load_all().await.unwrap();

    let error = error_of(&report, "victim");
    assert!(error.starts_with("DependencyResolutionError"), "{}", error);
    assert!(error.contains("checksum mismatch"), "{}", error);
    assert_eq!(
        manager.state_of("victim").await,
        Some(LifecycleState::PreSetupDone)
    );
    assert!(report.get("bystander").unwrap().success);
}

#[tokio::test]
async fn test_transport_failures_are_retried() {
    let coordinate = Coordinate::new("org.frost", "flaky", "0.1");
    let harness = Harness::new();
    harness
        .fetcher
        .publish(&RemoteRepository::new(REPOSITORY), &coordinate, b"eventually");
    harness.fetcher.fail_next(1);
    let behavior = Behavior {
        dependency_loader: Some(Arc::new(Declares(vec![coordinate]))),
        ..Behavior::default()
    };
    let mut harness = harness.shard("flaky", &[], behavior);
    let manager = harness.manager();

    let report = manager.load_all().await.unwrap();
    assert!(report.get("flaky").unwrap().success, "{:?}", report.render());
}

#[tokio::test]
async fn test_unknown_artifact_fails_without_retry() {
    let behavior = Behavior {
        dependency_loader: Some(Arc::new(Declares(vec![Coordinate::new("org.none", "void", "1")]))),
        ..Behavior::default()
    };
    let mut harness = Harness::new().shard("lonely", &[], behavior);
    let manager = harness.manager();

    let report = manager.load_all().await.unwrap();

    assert!(error_of(&report, "lonely").starts_with("DependencyResolutionError"));
    // Not found is final: no checksum request and no second attempt.
    assert_eq!(harness.fetcher.request_count(), 1);
}

#[tokio::test]
async fn test_commands_fan_out_and_unregister_on_teardown() {
    let harness = Harness::new();
    let exported = Ledger {
        name: "ledger",
        journal: harness.journal.clone(),
    };
    let registered: Arc<dyn ShardCommand> = Arc::new(Ledger {
        name: "vault",
        journal: harness.journal.clone(),
    });
    let behavior = Behavior {
        setup_commands: vec![registered],
        ..Behavior::default()
    };
    let table = harness.exports("bank", &[], behavior).with_command(exported);
    let mut harness = harness.archive("bank.shard", table);
    let manager = harness.manager();

    let report = manager.load_all().await.unwrap();
    let result = report.get("bank").unwrap();
    assert_eq!(result.commands_bound, 2);
    assert!(result.command_errors.is_empty());
    // Two subcommands plus the default handler, for each command.
    assert_eq!(harness.table.route_count(), 6);

    let console = CommandSender::console();
    harness.journal.lock().clear();
    assert_eq!(harness.table.dispatch(&console, "ledger deposit 40"), Ok(RouteOutcome::Executed));
    assert_eq!(harness.table.dispatch(&console, "/vault history"), Ok(RouteOutcome::Executed));
    assert_eq!(harness.table.dispatch(&console, "vault"), Ok(RouteOutcome::Executed));
    assert_eq!(
        harness.journal(),
        vec![
            "middleware ledger 'deposit'",
            "deposit 40",
            "middleware vault 'history'",
            "history",
            "middleware vault ''",
            "default vault",
        ]
    );

    let teardown = manager.shutdown_all().await;
    assert_eq!(teardown.results[0].routes_removed, 6);
    assert_eq!(harness.table.route_count(), 0);
    assert!(harness.table.dispatch(&console, "ledger").is_err());
}

struct Cursed;

impl ShardCommand for Cursed {
    fn metadata(&self) -> Option<CommandMeta> {
        Some(CommandMeta::new("cursed"))
    }

    fn subcommands(&self) -> Vec<Subcommand> {
        panic!("cursed subcommands")
    }

    fn execute(&self, _sender: &CommandSender) -> Result<(), CommandError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_command_panic_during_binding_is_contained() {
    let harness = Harness::new();
    let cursed = harness.exports("bad", &[], Behavior::default()).with_command(Cursed);
    let healthy = harness
        .exports("good", &[], Behavior::default())
        .with_command(Ledger {
            name: "ledger",
            journal: harness.journal.clone(),
        });
    let mut harness = harness.archive("bad.shard", cursed).archive("good.shard", healthy);
    let manager = harness.manager();

    let report = manager.load_all().await.unwrap();

    let bad = report.get("bad").unwrap();
    assert!(bad.success);
    assert_eq!(bad.commands_bound, 0);
    assert!(bad.command_errors[0].contains("cursed subcommands"), "{:?}", bad.command_errors);
    assert_eq!(report.get("good").unwrap().commands_bound, 1);
    assert_eq!(harness.table.commands(), vec!["ledger"]);
}

#[tokio::test]
async fn test_peer_symbols_resolve_across_shards() {
    let harness = Harness::new();
    let provider = harness
        .exports("provider", &[], Behavior::default())
        .export("provider.motd", "welcome to frost".to_string());
    let consumer = harness.exports(
        "consumer",
        &["provider"],
        Behavior {
            lookup: Some("provider.motd".to_string()),
            ..Behavior::default()
        },
    );
    let shared = harness.exports(
        "hosted",
        &[],
        Behavior {
            lookup: Some("host.name".to_string()),
            ..Behavior::default()
        },
    );
    let mut harness = harness
        .archive("consumer.shard", consumer)
        .archive("hosted.shard", shared)
        .archive("provider.shard", provider);
    let manager = harness.manager();

    let report = manager.load_all().await.unwrap();
    assert_eq!(report.successes(), 3, "{:?}", report.render());
    assert!(harness.journal().contains(&"found welcome to frost".to_string()));
    assert!(harness.journal().contains(&"found frost-test".to_string()));

    let context = manager.context_of("consumer").await.unwrap();
    let symbol = context.lookup_symbol("provider.motd").unwrap();
    assert_eq!(symbol.origin(), &SymbolOrigin::Peer("provider".to_string()));
    assert!(context.lookup_symbol("nobody.exports.this").is_err());
}

#[tokio::test]
async fn test_failed_shard_does_not_serve_peers() {
    let harness = Harness::new();
    let provider = harness
        .exports("provider", &["absent"], Behavior::default())
        .export("provider.motd", "stale".to_string());
    let consumer = harness.exports(
        "consumer",
        &[],
        Behavior {
            lookup: Some("provider.motd".to_string()),
            ..Behavior::default()
        },
    );
    let mut harness = harness
        .archive("consumer.shard", consumer)
        .archive("provider.shard", provider);
    let manager = harness.manager();

    let report = manager.load_all().await.unwrap();

    assert!(error_of(&report, "provider").starts_with("MissingDependencyError"));
    assert!(!report.get("consumer").unwrap().success);
    assert!(!harness.journal().contains(&"found stale".to_string()));
}
