use std::sync::Arc;

use healer::config::ConfigError;
use healer::surface::TimeRange;
use healer::{
    DiscoveryEvent, EngineConfig, EngineError, MemorySink, PlaybackSurface, SimulatedSurface,
    StreamEngine,
};
use tokio::sync::mpsc;

fn manual_engine() -> (StreamEngine, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let engine = StreamEngine::builder()
        .sink(sink.clone())
        .manual()
        .build()
        .expect("default config is valid");
    (engine, sink)
}

#[tokio::test(start_paused = true)]
async fn first_candidate_is_adopted_and_keys_are_unique() {
    let (engine, sink) = manual_engine();
    let surface = Arc::new(SimulatedSurface::playing("hero", 0.0, 20.0));

    let id = engine.monitor(surface.clone()).unwrap();
    assert_eq!(engine.active(), Some(id));
    assert_eq!(engine.monitor(surface).unwrap(), id);
    assert_eq!(engine.context().candidate_count(), 1);
    assert_eq!(sink.count("candidate_added"), 1);
    assert_eq!(sink.count("active_adopted"), 1);

    let records = sink.records();
    assert!(records.iter().all(|r| r.session_id == engine.session_id()));
}

#[tokio::test(start_paused = true)]
async fn removing_the_active_candidate_promotes_another() {
    let (engine, sink) = manual_engine();
    let a = engine
        .monitor(Arc::new(SimulatedSurface::playing("a", 0.0, 20.0)))
        .unwrap();
    let b_surface = Arc::new(SimulatedSurface::new("b"));
    b_surface.set_buffered(vec![TimeRange::new(0.0, 20.0)]);
    let b = engine.monitor(b_surface.clone()).unwrap();
    assert_eq!(engine.active(), Some(a));

    engine.stop_monitoring(a).await.unwrap();
    assert_eq!(engine.active(), Some(b));
    assert!(!b_surface.paused(), "new active candidate is asked to play");
    assert_eq!(sink.count("candidate_removed"), 1);

    let err = engine.stop_monitoring(a).await.unwrap_err();
    assert!(matches!(err, EngineError::UnknownCandidate(id) if id == a));
    let err = engine.stop_monitoring_key("missing").await.unwrap_err();
    assert!(matches!(err, EngineError::UnknownKey(key) if key == "missing"));

    engine.stop_monitoring_key("b").await.unwrap();
    assert_eq!(engine.active(), None);
    assert_eq!(engine.context().candidate_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn candidates_beyond_capacity_are_pruned() {
    let sink = Arc::new(MemorySink::new());
    let mut config = EngineConfig::default();
    config.selection.max_candidates = 2;
    let engine = StreamEngine::builder()
        .config(config)
        .sink(sink.clone())
        .manual()
        .build()
        .unwrap();

    let a = engine
        .monitor(Arc::new(SimulatedSurface::playing("a", 0.0, 20.0)))
        .unwrap();
    let b = engine.monitor(Arc::new(SimulatedSurface::new("b"))).unwrap();
    let c = engine.monitor(Arc::new(SimulatedSurface::new("c"))).unwrap();

    let registry = engine.context().registry.lock();
    assert_eq!(registry.len(), 2);
    assert!(registry.contains(a), "active candidate is protected");
    assert!(registry.contains(c), "newest candidate is protected");
    assert!(!registry.contains(b));
    drop(registry);
    assert_eq!(sink.count("candidate_removed"), 1);
}

#[tokio::test(start_paused = true)]
async fn invalid_configuration_is_rejected() {
    let mut config = EngineConfig::default();
    config.watchdog.tick_interval_ms = 0;
    let err = StreamEngine::builder().config(config).manual().build().err();
    assert!(matches!(
        err,
        Some(EngineError::Config(ConfigError::Zero("watchdog.tick_interval_ms")))
    ));

    let parsed = EngineConfig::from_toml_str(
        "[watchdog]\nstall_confirm_ms = 3000\n\n[failover]\nprogress_timeout_ms = 6000\n",
    )
    .unwrap();
    assert_eq!(parsed.watchdog.stall_confirm_ms, 3_000);
    assert_eq!(parsed.failover.progress_timeout_ms, 6_000);
    assert_eq!(parsed.heal.poll_timeout_ms, 15_000);
    assert_ne!(parsed.fingerprint(), EngineConfig::default().fingerprint());
}

#[tokio::test(start_paused = true)]
async fn shutdown_refuses_new_candidates() {
    let (engine, _sink) = manual_engine();
    assert!(!engine.is_shut_down());
    engine.shutdown();
    assert!(engine.is_shut_down());
    let err = engine
        .monitor(Arc::new(SimulatedSurface::new("late")))
        .unwrap_err();
    assert!(matches!(err, EngineError::ShutDown));
}

#[tokio::test(start_paused = true)]
async fn discovery_stream_adds_and_removes_candidates() {
    let (engine, sink) = manual_engine();
    let (tx, rx) = mpsc::channel(8);
    let handle = engine.attach_discovery(rx);

    let a: Arc<dyn PlaybackSurface> = Arc::new(SimulatedSurface::playing("a", 0.0, 20.0));
    let b: Arc<dyn PlaybackSurface> = Arc::new(SimulatedSurface::playing("b", 0.0, 20.0));
    tx.send(DiscoveryEvent::Discovered(a.clone())).await.unwrap();
    tx.send(DiscoveryEvent::Discovered(b)).await.unwrap();
    tx.send(DiscoveryEvent::Discovered(a)).await.unwrap();
    tx.send(DiscoveryEvent::Removed("a".into())).await.unwrap();
    tx.send(DiscoveryEvent::Removed("unknown".into())).await.unwrap();
    drop(tx);
    handle.await.unwrap();

    let registry = engine.context().registry.lock();
    assert_eq!(registry.len(), 1);
    let b_id = registry.find_by_key("b").unwrap();
    assert!(registry.find_by_key("a").is_none());
    drop(registry);
    assert_eq!(engine.active(), Some(b_id));
    assert_eq!(sink.count("candidate_added"), 2);
    assert_eq!(sink.count("candidate_removed"), 1);
}
