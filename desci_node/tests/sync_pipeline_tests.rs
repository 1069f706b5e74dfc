//! Sync pipeline integration tests
//! Chain → reader → projector → checkpoint against a scripted chain and a
//! real RocksDB directory, including restarts.

use anyhow::Result;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use ethers::types::{Address, H256, U256};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use desci_node::api::{create_router, AppState};
use desci_node::chain::{DomainEvent, MemoryChainSource};
use desci_node::config::{ListenerConfig, NodeConfig};
use desci_node::listener::{ListenerState, SyncListener};
use desci_node::projector::EventProjector;
use desci_node::storage::{CheckpointTracker, SyncStore};
use desci_node::verify::ContentVerifier;

const RESEARCH_NFT: &str = "0x9fe46736679d2d9a65f0992f2272de9f3c7fa6e0";
const DATASETS: &str = "0xe7f1725e7734ce288f8367e1bb143e90bb3f0512";
const ALICE: &str = "0x70997970c51812dc3a010c7d01b50e0d17dc79c8";
const BOB: &str = "0x3c44cdddb6a900fa2b585dd299e03d12fa4293bc";

fn node_config(listeners: Vec<ListenerConfig>) -> NodeConfig {
    let mut cfg = NodeConfig::default();
    cfg.chain.confirmations = 0;
    cfg.chain.poll_interval_ms = 10;
    cfg.chain.max_block_range = 1000;
    cfg.retry.max_attempts = 3;
    cfg.retry.initial_backoff_ms = 1;
    cfg.retry.max_backoff_ms = 5;
    cfg.retry.max_consecutive_failures = 5;
    cfg.listeners = listeners;
    cfg
}

fn single_listener() -> NodeConfig {
    node_config(vec![ListenerConfig {
        name: "desci".into(),
        contracts: vec![RESEARCH_NFT.into(), DATASETS.into()],
    }])
}

fn listener(cfg: &NodeConfig, index: usize, chain: &Arc<MemoryChainSource>, store: &Arc<SyncStore>) -> SyncListener {
    SyncListener::new(
        &cfg.listeners[index],
        cfg,
        chain.clone(),
        Arc::new(EventProjector::new(store.clone())),
    )
    .unwrap()
}

fn tx(n: u64) -> H256 {
    H256::from_low_u64_be(n)
}

fn nft() -> Address {
    Address::from_str(RESEARCH_NFT).unwrap()
}

fn app_for(store: &Arc<SyncStore>, cfg: &NodeConfig, sync: &SyncListener) -> axum::Router {
    create_router(AppState {
        store: store.clone(),
        verifier: Arc::new(ContentVerifier::new(cfg.verify.algorithm)),
        listeners: vec![sync.status()],
        api: cfg.api.clone(),
    })
}

fn mint(token: u64, author: &str) -> DomainEvent {
    DomainEvent::ResearchMinted {
        token_id: token.to_string(),
        authors: vec![author.into()],
        title: format!("Paper {token}"),
        content_hash: format!("0x{:064x}", token),
        metadata_hash: format!("QmMeta{token}"),
    }
}

async fn get_json(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

/// Checkpoint reaches 120, health reports it, and a restart resumes at 120
/// without duplicating anything
#[tokio::test]
async fn test_restart_resumes_at_checkpoint_without_duplicates() -> Result<()> {
    let dir = TempDir::new()?;
    let cfg = single_listener();
    let chain = Arc::new(MemoryChainSource::new());

    chain.push_event(nft(), 50, tx(1), 0, &mint(1, ALICE))?;
    chain.push_event(nft(), 100, tx(2), 0, &mint(2, BOB))?;
    chain.push_event(nft(), 120, tx(3), 0, &mint(3, ALICE))?;
    chain.set_head(120);

    // Phase 1: sync to the head
    {
        let store = Arc::new(SyncStore::open(dir.path())?);
        let sync = listener(&cfg, 0, &chain, &store);

        let progress = sync.sync_once().await?.expect("range to process");
        assert_eq!(progress.range.to, 120);
        assert_eq!(progress.outcome.applied, 3);
        assert!(sync.sync_once().await?.is_none());

        let app = create_router(AppState {
            store: store.clone(),
            verifier: Arc::new(ContentVerifier::new(cfg.verify.algorithm)),
            listeners: vec![sync.status()],
            api: cfg.api.clone(),
        });
        let (status, health) = get_json(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health["last_event_block"], 120);
        assert_eq!(health["status"], "ok");
    }

    // The chain moves on while the node is down
    chain.push_event(
        nft(),
        120,
        tx(4),
        1,
        &DomainEvent::PeerReviewSubmitted {
            token_id: "3".into(),
            reviewer: BOB.into(),
            score: 4,
            review_hash: "QmReview".into(),
        },
    )?;
    chain.push_event(
        nft(),
        130,
        tx(5),
        0,
        &DomainEvent::ResearchCited {
            token_id: "1".into(),
            citer: BOB.into(),
            citing_ref: "QmBobPaper".into(),
        },
    )?;
    chain.set_head(130);

    // Phase 2: restart against the same directory
    {
        let store = Arc::new(SyncStore::open(dir.path())?);
        assert_eq!(CheckpointTracker::new(store.clone(), "desci").get()?, 120);

        let sync = listener(&cfg, 0, &chain, &store);
        let progress = sync.sync_once().await?.expect("range to process");
        assert_eq!(progress.range.from, 120);
        assert_eq!(progress.range.to, 130);
        assert_eq!(progress.outcome.duplicates, 1);
        assert_eq!(progress.outcome.applied, 2);

        assert_eq!(store.latest_research(0, 100)?.len(), 3);
        assert_eq!(store.get_research("3")?.review_count, 1);
        assert_eq!(store.get_research("1")?.citation_count, 1);
        assert_eq!(store.reviews_for("3")?.len(), 1);

        // the journal holds each log once, with its on-chain payload
        let journal = store.events_in_range(120, 130)?;
        let positions: Vec<(u64, u64)> = journal.iter().map(|e| (e.block_number, e.log_index)).collect();
        assert_eq!(positions, vec![(120, 0), (120, 1), (130, 0)]);
        assert!(journal.iter().all(|e| !e.topics.is_empty() && e.data.len() > 2));
        assert_eq!(journal[2].event_name, "ResearchCited");
        assert_eq!(store.events_in_range(0, 130)?.len(), 5);
    }

    Ok(())
}

/// Effects of earlier blocks are visible to later ones; a child that
/// precedes its parent on chain is skipped
#[tokio::test]
async fn test_events_project_in_chain_order() -> Result<()> {
    let dir = TempDir::new()?;
    let cfg = single_listener();
    let chain = Arc::new(MemoryChainSource::new());
    let datasets = Address::from_str(DATASETS)?;

    chain.push_event(
        nft(),
        9,
        tx(1),
        0,
        &DomainEvent::ResearchCited {
            token_id: "7".into(),
            citer: BOB.into(),
            citing_ref: "QmEarly".into(),
        },
    )?;
    chain.push_event(nft(), 10, tx(2), 2, &mint(7, ALICE))?;
    chain.push_event(
        datasets,
        10,
        tx(2),
        0,
        &DomainEvent::DatasetUploaded {
            dataset_id: "1".into(),
            uploader: ALICE.into(),
            title: "Genome sample".into(),
            ipfs_hash: "QmData".into(),
            access_price: U256::from(100u64),
        },
    )?;
    chain.push_event(
        datasets,
        11,
        tx(3),
        0,
        &DomainEvent::DatasetPurchased {
            dataset_id: "1".into(),
            buyer: BOB.into(),
            price: U256::from(100u64),
        },
    )?;
    chain.push_event(
        nft(),
        11,
        tx(3),
        1,
        &DomainEvent::ResearchCited {
            token_id: "7".into(),
            citer: BOB.into(),
            citing_ref: "QmLate".into(),
        },
    )?;
    chain.set_head(11);

    let store = Arc::new(SyncStore::open(dir.path())?);
    let progress = listener(&cfg, 0, &chain, &store).sync_once().await?.expect("range to process");
    assert_eq!(progress.outcome.applied, 4);
    assert_eq!(progress.outcome.skipped, 1);

    let citations = store.citations_for(desci_node::storage::CitationTarget::Research, "7")?;
    assert_eq!(citations.len(), 1);
    assert_eq!(citations[0].reference, "QmLate");

    let dataset = store.get_dataset("1")?;
    assert_eq!(dataset.download_count, 1);
    assert_eq!(dataset.revenue, "100");
    Ok(())
}

/// Blocks within the confirmation depth are deferred
#[tokio::test]
async fn test_unconfirmed_blocks_are_deferred() -> Result<()> {
    let dir = TempDir::new()?;
    let mut cfg = single_listener();
    cfg.chain.confirmations = 5;
    let chain = Arc::new(MemoryChainSource::new());

    chain.push_event(nft(), 10, tx(1), 0, &mint(1, ALICE))?;
    chain.push_event(nft(), 18, tx(2), 0, &mint(2, ALICE))?;
    chain.set_head(20);

    let store = Arc::new(SyncStore::open(dir.path())?);
    let sync = listener(&cfg, 0, &chain, &store);
    let progress = sync.sync_once().await?.expect("range to process");
    assert_eq!(progress.range.to, 15);
    assert!(store.get_research("2").is_err());

    chain.set_head(23);
    sync.sync_once().await?;
    assert!(store.get_research("2").is_ok());
    Ok(())
}

/// A running listener rides out transient RPC failures
#[tokio::test]
async fn test_listener_recovers_from_transient_failures() -> Result<()> {
    let dir = TempDir::new()?;
    let cfg = single_listener();
    let chain = Arc::new(MemoryChainSource::new());
    chain.push_event(nft(), 5, tx(1), 0, &mint(1, ALICE))?;
    chain.set_head(40);
    // more than one cycle's retry budget
    chain.fail_next(4);

    let store = Arc::new(SyncStore::open(dir.path())?);
    let sync = listener(&cfg, 0, &chain, &store);
    let status = sync.status();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(sync.run(shutdown.clone()));

    for _ in 0..400 {
        if status.read().checkpoint == 40 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    {
        let status = status.read();
        assert_eq!(status.checkpoint, 40);
        assert_eq!(status.consecutive_failures, 0);
        assert_ne!(status.state, ListenerState::Failed);
    }
    assert!(store.get_research("1").is_ok());

    shutdown.cancel();
    assert_eq!(task.await?, ListenerState::Stopped);
    Ok(())
}

/// Listeners keep independent checkpoints; health reports the lowest
#[tokio::test]
async fn test_health_reports_lowest_listener_checkpoint() -> Result<()> {
    let dir = TempDir::new()?;
    let cfg = node_config(vec![
        ListenerConfig {
            name: "research".into(),
            contracts: vec![RESEARCH_NFT.into()],
        },
        ListenerConfig {
            name: "datasets".into(),
            contracts: vec![DATASETS.into()],
        },
    ]);
    let chain = Arc::new(MemoryChainSource::new());
    chain.push_event(nft(), 5, tx(1), 0, &mint(1, ALICE))?;
    chain.set_head(60);

    let store = Arc::new(SyncStore::open(dir.path())?);
    let research = listener(&cfg, 0, &chain, &store);
    let datasets = listener(&cfg, 1, &chain, &store);

    research.sync_once().await?;
    chain.set_head(80);
    datasets.sync_once().await?;

    assert_eq!(CheckpointTracker::new(store.clone(), "research").get()?, 60);
    assert_eq!(CheckpointTracker::new(store.clone(), "datasets").get()?, 80);

    let app = create_router(AppState {
        store: store.clone(),
        verifier: Arc::new(ContentVerifier::new(cfg.verify.algorithm)),
        listeners: vec![research.status(), datasets.status()],
        api: cfg.api.clone(),
    });
    let (_, health) = get_json(app, "/health").await;
    assert_eq!(health["last_event_block"], 60);
    assert_eq!(health["listeners"].as_array().map(|l| l.len()), Some(2));
    Ok(())
}

/// A token re-minted with different content stops the listener; the API
/// keeps serving the stored record and reports degraded health
#[tokio::test]
async fn test_conflicting_remint_fails_listener() -> Result<()> {
    let dir = TempDir::new()?;
    let cfg = single_listener();
    let chain = Arc::new(MemoryChainSource::new());
    chain.push_event(nft(), 10, tx(1), 0, &mint(1, ALICE))?;
    chain.set_head(10);

    let store = Arc::new(SyncStore::open(dir.path())?);
    let sync = listener(&cfg, 0, &chain, &store);
    sync.sync_once().await?;
    let app = app_for(&store, &cfg, &sync);
    let status = sync.status();

    let mut rewritten = mint(1, ALICE);
    if let DomainEvent::ResearchMinted { title, .. } = &mut rewritten {
        *title = "Rewritten".into();
    }
    chain.push_event(nft(), 11, tx(2), 0, &rewritten)?;
    chain.push_event(nft(), 11, tx(2), 1, &mint(2, BOB))?;
    chain.set_head(11);

    let state = tokio::time::timeout(Duration::from_secs(5), sync.run(CancellationToken::new())).await?;
    assert_eq!(state, ListenerState::Failed);
    {
        let status = status.read();
        assert_eq!(status.state, ListenerState::Failed);
        assert_eq!(status.checkpoint, 10);
        assert!(status.last_error.as_deref().is_some_and(|e| e.contains("State corruption")));
    }
    assert_eq!(CheckpointTracker::new(store.clone(), "desci").get()?, 10);
    assert!(store.get_research("2").is_err());

    let (code, health) = get_json(app.clone(), "/health").await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(health["status"], "degraded");
    assert_eq!(health["db"], "ok");

    let (code, research) = get_json(app, "/api/research/1").await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(research["title"], "Paper 1");
    Ok(())
}

/// An endpoint that never answers exhausts the failure budget; the API
/// stays up with degraded health
#[tokio::test]
async fn test_unreachable_chain_degrades_health() -> Result<()> {
    let dir = TempDir::new()?;
    let cfg = single_listener();
    let chain = Arc::new(MemoryChainSource::new());
    chain.set_head(50);
    chain.fail_next(u32::MAX);

    let store = Arc::new(SyncStore::open(dir.path())?);
    let sync = listener(&cfg, 0, &chain, &store);
    let app = app_for(&store, &cfg, &sync);
    let status = sync.status();

    let state = tokio::time::timeout(Duration::from_secs(5), sync.run(CancellationToken::new())).await?;
    assert_eq!(state, ListenerState::Failed);
    assert_eq!(status.read().consecutive_failures, cfg.retry.max_consecutive_failures);

    let (code, health) = get_json(app.clone(), "/health").await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(health["status"], "degraded");
    assert_eq!(health["listeners"][0]["state"], "FAILED");

    let (code, latest) = get_json(app.clone(), "/api/research/latest").await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(latest["count"], 0);
    let (code, _) = get_json(app, "/api/research/unknown").await;
    assert_eq!(code, StatusCode::NOT_FOUND);
    Ok(())
}
