use shard_api::{CommandSender, Coordinate, LifecycleState, RemoteRepository, StorageService};
use shard_greeter::{exports, COUNT_KEY, JSON_LIBRARY, PREFIX_EXPORT, STORE};
use shard_system::{
    CommandTable, HostServices, ManagerConfig, MemoryFetcher, RouteOutcome, ShardManager, StaticArchives,
};
use std::sync::Arc;
use tempfile::TempDir;

async fn start(dir: &TempDir) -> (ShardManager, Arc<CommandTable>, HostServices, Arc<MemoryFetcher>) {
    let config = ManagerConfig::new(dir.path());
    std::fs::create_dir_all(&config.shard_directory).unwrap();
    std::fs::write(config.shard_directory.join("greeter.so"), b"").unwrap();

    let fetcher = Arc::new(MemoryFetcher::new());
    let coordinate: Coordinate = JSON_LIBRARY.parse().unwrap();
    fetcher.publish(&RemoteRepository::maven_central(), &coordinate, b"gson bytes");

    let services = HostServices::local(dir.path().join("store")).await.unwrap();
    let table = Arc::new(CommandTable::new());
    let manager = ShardManager::builder(config)
        .opener(Arc::new(StaticArchives::new().with("greeter.so", exports())))
        .fetcher(fetcher.clone())
        .services(services.clone())
        .dispatcher(table.clone())
        .build()
        .unwrap();
    (manager, table, services, fetcher)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_greeter_lifecycle() {
    let dir = TempDir::new().unwrap();
    let (manager, table, services, _) = start(&dir).await;

    let report = manager.load_all().await.unwrap();
    let result = report.get("greeter").unwrap();
    assert!(result.success, "{:?}", report.render());
    assert_eq!(result.version.as_deref(), Some("0.3.0"));
    assert_eq!(result.libraries.len(), 1);
    assert_eq!(result.commands_bound, 1);
    assert_eq!(manager.state_of("greeter").await, Some(LifecycleState::Active));

    let schema = services.local_config().unwrap().schema("greeter").unwrap();
    assert_eq!(schema["type"], "object");

    let prefix = manager.loader_of("greeter").unwrap().load_symbol(PREFIX_EXPORT).unwrap();
    assert_eq!(prefix.downcast_ref::<String>().map(String::as_str), Some("Hello"));

    let alex = CommandSender::player("alex").with_permission("greeter.greet");
    assert_eq!(table.dispatch(&alex, "greet"), Ok(RouteOutcome::Executed));
    assert_eq!(table.dispatch(&alex, "/hello player Steve the Great"), Ok(RouteOutcome::Executed));
    assert!(table.dispatch(&CommandSender::player("bob"), "greet").is_err());

    let console = CommandSender::console();
    assert_eq!(table.dispatch(&console, "greet count"), Ok(RouteOutcome::Executed));
    assert_eq!(table.dispatch(&console, "greet player Alex"), Ok(RouteOutcome::Vetoed));

    let storage = services.local_storage().unwrap();
    assert_eq!(storage.get_sync(STORE, COUNT_KEY), Some(serde_json::json!(2)));

    let teardown = manager.shutdown_all().await;
    assert_eq!(teardown.successes(), 1);
    assert_eq!(table.route_count(), 0);
    assert!(dir.path().join("store").join("greeter.json").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_count_survives_restart() {
    let dir = TempDir::new().unwrap();
    {
        let (manager, table, _, _) = start(&dir).await;
        manager.load_all().await.unwrap();
        let alex = CommandSender::player("alex").with_permission("greeter.greet");
        table.dispatch(&alex, "greet").unwrap();
        manager.shutdown_all().await;
    }

    let (manager, table, services, fetcher) = start(&dir).await;
    manager.load_all().await.unwrap();
    // The library comes from the cache populated by the first run.
    assert_eq!(fetcher.request_count(), 0);

    let alex = CommandSender::player("alex").with_permission("greeter.greet");
    table.dispatch(&alex, "greet").unwrap();
    let storage = services.local_storage().unwrap();
    assert_eq!(storage.get_sync(STORE, COUNT_KEY), Some(serde_json::json!(2)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_messages_come_from_the_data_directory() {
    let dir = TempDir::new().unwrap();
    let bundle = dir
        .path()
        .join("shards")
        .join("greeter")
        .join("lang")
        .join("greeter_en_US.properties");
    {
        let (manager, _, _, _) = start(&dir).await;
        assert!(manager.load_all().await.unwrap().get("greeter").unwrap().success);
        let copied = std::fs::read_to_string(&bundle).unwrap();
        assert!(copied.contains("greeting = Hello, {0}!"));
        manager.shutdown_all().await;
    }

    // A bundle without the keys the command needs turns greeting into a command failure.
    std::fs::write(&bundle, "ready = up\nfarewell = down\n").unwrap();
    let (manager, table, _, _) = start(&dir).await;
    assert!(manager.load_all().await.unwrap().get("greeter").unwrap().success);
    let alex = CommandSender::player("alex").with_permission("greeter.greet");
    assert!(table.dispatch(&alex, "greet").is_err());
}
