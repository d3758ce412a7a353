//! Node lifecycle, coordinator and market helpers on local nodes.
//!
//! Requires: `tokio` multi-thread runtime.

use std::sync::Arc;
use std::time::Duration;

use libp2p::{Multiaddr, PeerId};
use tempfile::TempDir;

use otternet_network::config::NetworkConfig;
use otternet_network::events::NetworkEvent;
use otternet_node::coordinator::Coordinator;
use otternet_node::market::{discover_prices, find_otternet_peers};
use otternet_node::node::{Node, NodeState};
use otternet_node::session::Session;
use otternet_storage::catalog::MemoryCatalog;
use otternet_types::{CatalogItem, OtternetError};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn unique_seed(prefix: &str) -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{prefix}-{nanos}")
}

fn hosted_item(dir: &std::path::Path, wallet: &str, hash: &str, price: f64) -> CatalogItem {
    let path = dir.join(format!("{hash}.bin"));
    std::fs::write(&path, b"payload").unwrap();
    CatalogItem {
        wallet_id: wallet.into(),
        src_id: String::new(),
        price,
        file_name: format!("{hash}.bin"),
        file_path: path.to_string_lossy().into_owned(),
        file_size: 7,
        file_type: "application/octet-stream".into(),
        timestamp: "2024-01-01T00:00:00Z".into(),
        file_hash: hash.into(),
        bundle_mode: false,
    }
}

/// Creates a started, bootstrapped node with its data under `dir`.
async fn running_node(dir: &TempDir, wallet: &str, catalog: Arc<MemoryCatalog>) -> Node {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("otternet_node=debug,otternet_network=info")
        .try_init();

    let session = Arc::new(Session::open(&dir.path().join(wallet), wallet, catalog).unwrap());
    let mut node = Node::new(NetworkConfig::local(&unique_seed(wallet)), session).unwrap();
    node.start().unwrap();
    node.bootstrap_network().await.unwrap();
    node
}

/// Full dial address of a running node, `<listen addr>/p2p/<peer id>`.
async fn dial_addr(node: &Node) -> String {
    let addr = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(addr) = node.handle().listeners().await.unwrap().into_iter().next() {
                break addr;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("listen address");
    format!("{addr}/p2p/{}", node.peer_id())
}

async fn connect(from: &Node, to: &Node) {
    assert!(from.handle().connect_to_peer(&dial_addr(to).await).await.unwrap());
    // Let identify populate both routing tables.
    tokio::time::sleep(Duration::from_millis(300)).await;
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lifecycle_rejects_misuse() {
    let dir = TempDir::new().unwrap();
    let session = Arc::new(
        Session::open(dir.path(), "wallet", Arc::new(MemoryCatalog::new())).unwrap(),
    );
    let mut node = Node::new(NetworkConfig::local(&unique_seed("lifecycle")), session).unwrap();
    assert_eq!(node.state(), NodeState::Initializing);

    assert!(matches!(node.close().await, Err(OtternetError::ConfigError { .. })));
    assert!(matches!(
        node.bootstrap_network().await,
        Err(OtternetError::ConfigError { .. })
    ));

    node.start().unwrap();
    assert_eq!(node.state(), NodeState::Running);
    assert!(matches!(node.start(), Err(OtternetError::ConfigError { .. })));

    node.close().await.unwrap();
    assert_eq!(node.state(), NodeState::ShuttingDown);
    node.close().await.unwrap();
    assert!(node.handle().connected_peers().await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handlers_register_once() {
    let dir = TempDir::new().unwrap();
    let mut node = running_node(&dir, "solo", Arc::new(MemoryCatalog::new())).await;

    assert!(matches!(
        node.register_exchange_handlers(),
        Err(OtternetError::ConfigError { .. })
    ));
    assert!(matches!(
        node.start_peer_exchange(),
        Err(OtternetError::ConfigError { .. })
    ));
    node.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn status_and_events_follow_connections() {
    let dir = TempDir::new().unwrap();
    let mut a = running_node(&dir, "status-a", Arc::new(MemoryCatalog::new())).await;
    let mut b = running_node(&dir, "status-b", Arc::new(MemoryCatalog::new())).await;
    let mut events = a.subscribe();

    connect(&b, &a).await;

    let b_id = b.peer_id();
    let seen = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(NetworkEvent::PeerConnected { peer_id, .. }) if peer_id == b_id => break true,
                Ok(_) => continue,
                Err(_) => break false,
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(seen);

    let status = a.status();
    assert!(status.connected_peers.contains(&b_id));
    assert!(!status.listen_addrs.is_empty());

    b.close().await.unwrap();
    a.close().await.unwrap();
}

// ---------------------------------------------------------------------------
// Market
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn prices_are_collected_from_providers() {
    let dir = TempDir::new().unwrap();
    let seller_catalog = Arc::new(MemoryCatalog::new());
    seller_catalog.upsert(hosted_item(dir.path(), "seller", "song", 4.25));

    let mut seller = running_node(&dir, "seller", seller_catalog).await;
    let mut buyer = running_node(&dir, "buyer", Arc::new(MemoryCatalog::new())).await;
    connect(&buyer, &seller).await;

    seller.handle().provide_key("song").await.unwrap();

    let prices = discover_prices(buyer.handle(), buyer.session(), "song").await.unwrap();
    let price = prices.get(&seller.peer_id()).expect("seller answered");
    assert_eq!(*price.as_ref().unwrap(), 4.25);
    assert!(buyer
        .session()
        .providers()
        .unwrap()
        .contains(&seller.peer_id().to_string()));

    let live = find_otternet_peers(buyer.handle()).await.unwrap();
    assert_eq!(live, vec![seller.peer_id()]);
    // The buyer hosts nothing, so it does not count as live.
    assert!(find_otternet_peers(seller.handle()).await.unwrap().is_empty());

    buyer.close().await.unwrap();
    seller.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_hash_has_no_prices() {
    let dir = TempDir::new().unwrap();
    let mut node = running_node(&dir, "lonely", Arc::new(MemoryCatalog::new())).await;
    let prices = discover_prices(node.handle(), node.session(), "nothing").await.unwrap();
    assert!(prices.is_empty());
    assert!(node.session().providers().unwrap().is_empty());
    node.close().await.unwrap();
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn coordinator_keeps_one_node() {
    let dir = TempDir::new().unwrap();
    let coordinator = Coordinator::new();
    assert!(!coordinator.is_running().await);
    assert!(matches!(coordinator.close().await, Err(OtternetError::ConfigError { .. })));

    let handle = coordinator
        .start(
            "wallet-1",
            NetworkConfig::local(&unique_seed("coord")),
            dir.path(),
            Arc::new(MemoryCatalog::new()),
        )
        .await
        .unwrap();
    let running = coordinator.handle().await.expect("running handle");
    assert_eq!(running.local_peer_id(), handle.local_peer_id());
    assert_eq!(coordinator.wallet_address().await.as_deref(), Some("wallet-1"));
    assert!(coordinator.session().await.is_some());

    let second = coordinator
        .start(
            "wallet-2",
            NetworkConfig::local(&unique_seed("coord-2")),
            dir.path(),
            Arc::new(MemoryCatalog::new()),
        )
        .await;
    assert!(matches!(second, Err(OtternetError::ConfigError { .. })));
    assert_eq!(coordinator.wallet_address().await.as_deref(), Some("wallet-1"));

    coordinator.close().await.unwrap();
    assert!(!coordinator.is_running().await);
    assert!(coordinator.wallet_address().await.is_none());
    assert!(coordinator.handle().await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_config_leaves_coordinator_empty() {
    let dir = TempDir::new().unwrap();
    let coordinator = Coordinator::new();
    let mut config = NetworkConfig::local("bad");
    config.listen_addrs.clear();

    let result = coordinator
        .start("wallet", config, dir.path(), Arc::new(MemoryCatalog::new()))
        .await;
    assert!(matches!(result, Err(OtternetError::ConfigError { .. })));
    assert!(!coordinator.is_running().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn coordinator_answers_while_starting() {
    let dir = TempDir::new().unwrap();
    let coordinator = Coordinator::new();
    // Refused relay: each reservation round fails at once, so the start
    // spends its time in the retry backoff.
    let relay: Multiaddr = format!("/ip4/127.0.0.1/tcp/1/p2p/{}", PeerId::random())
        .parse()
        .unwrap();
    let config = NetworkConfig {
        relay_nodes: vec![relay],
        reservation_attempts: 2,
        reservation_backoff_secs: 1,
        ..NetworkConfig::local(&unique_seed("slow-start"))
    };

    let (started, ()) = tokio::join!(
        coordinator.start("wallet", config, dir.path(), Arc::new(MemoryCatalog::new())),
        async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            assert!(coordinator.is_starting());
            let running = tokio::time::timeout(Duration::from_millis(100), coordinator.is_running())
                .await
                .expect("status must not wait for bootstrap");
            assert!(!running);

            let second = coordinator
                .start(
                    "other",
                    NetworkConfig::local(&unique_seed("slow-start-2")),
                    dir.path(),
                    Arc::new(MemoryCatalog::new()),
                )
                .await;
            assert!(matches!(second, Err(OtternetError::ConfigError { .. })));
        }
    );

    started.unwrap();
    assert!(!coordinator.is_starting());
    assert_eq!(coordinator.wallet_address().await.as_deref(), Some("wallet"));
    coordinator.close().await.unwrap();
}
