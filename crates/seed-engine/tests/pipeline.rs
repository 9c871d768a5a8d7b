use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tileseed_core::{BoundingBox, TileCoord};
use tileseed_engine::{
    BackoffPolicy, Broker, BrokerError, ChannelCounts, ChannelHandle, EngineConfig, EngineDeps,
    EngineEvent, MemoryBroker, PutResponse, RawMessage, RenderError, RenderedTile, Renderer,
    SeedRequest, StoreError, TaskOutcome, TaskQueue, TileStore, Uploader, seed_tasks,
    start_engine,
};
use tokio::sync::Semaphore;
use tokio::time::Instant;

const CHANNEL: &str = "osm";
const LEASE: Duration = Duration::from_secs(150);

/// Renders a fixed body, optionally failing every tile or waiting on a gate.
#[derive(Default)]
struct ScriptedRenderer {
    fail: bool,
    gate: Option<Arc<Semaphore>>,
    grid: bool,
    rendered: Mutex<Vec<TileCoord>>,
}

impl ScriptedRenderer {
    fn rendered(&self) -> Vec<TileCoord> {
        self.rendered.lock().unwrap().clone()
    }
}

#[async_trait]
impl Renderer for ScriptedRenderer {
    async fn get_tile(&self, tile: TileCoord, _retina: bool) -> Result<RenderedTile, RenderError> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        self.rendered.lock().unwrap().push(tile);
        if self.fail {
            return Err(RenderError::Failed(format!("no style for {tile}")));
        }
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "image/png".to_string());
        Ok(RenderedTile {
            body: Bytes::from(format!("png {tile}")),
            headers,
        })
    }

    async fn get_grid(&self, tile: TileCoord) -> Result<Option<RenderedTile>, RenderError> {
        if !self.grid {
            return Ok(None);
        }
        Ok(Some(RenderedTile {
            body: Bytes::from(format!("grid {tile}")),
            headers: BTreeMap::new(),
        }))
    }
}

/// Records every write and answers with a fixed status.
struct RecordingStore {
    status: u16,
    existing: Vec<String>,
    writes: Mutex<Vec<(String, BTreeMap<String, String>)>>,
}

impl RecordingStore {
    fn new(status: u16) -> Arc<Self> {
        Self::holding(status, &[])
    }

    /// A store that already holds `existing`.
    fn holding(status: u16, existing: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            status,
            existing: existing.iter().map(|p| p.to_string()).collect(),
            writes: Mutex::new(Vec::new()),
        })
    }

    fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.writes.lock().unwrap().iter().map(|(p, _)| p.clone()).collect();
        paths.sort();
        paths
    }
}

#[async_trait]
impl TileStore for RecordingStore {
    async fn put(
        &self,
        path: &str,
        headers: &BTreeMap<String, String>,
        _body: Bytes,
    ) -> Result<PutResponse, StoreError> {
        self.writes
            .lock()
            .unwrap()
            .push((path.to_string(), headers.clone()));
        Ok(PutResponse {
            status: self.status,
            body: String::new(),
        })
    }

    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        Ok(self.existing.iter().any(|p| p == path))
    }
}

/// Counts receive calls on top of a [`MemoryBroker`]; the first `failures`
/// receives answer with an unavailable broker.
#[derive(Default)]
struct CountingBroker {
    inner: MemoryBroker,
    receives: AtomicUsize,
    failures: AtomicUsize,
}

impl CountingBroker {
    fn failing(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            ..Self::default()
        }
    }
}

#[async_trait]
impl Broker for CountingBroker {
    async fn create_channel(&self, name: &str, lease: Duration) -> Result<ChannelHandle, BrokerError> {
        self.inner.create_channel(name, lease).await
    }

    async fn send(&self, channel: &ChannelHandle, body: String, priority: u32) -> Result<String, BrokerError> {
        self.inner.send(channel, body, priority).await
    }

    async fn receive(
        &self,
        channel: &ChannelHandle,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<RawMessage>, BrokerError> {
        self.receives.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BrokerError::Unavailable("connection refused".to_string()));
        }
        self.inner.receive(channel, max_messages, wait).await
    }

    async fn delete(&self, channel: &ChannelHandle, receipt: &str) -> Result<(), BrokerError> {
        self.inner.delete(channel, receipt).await
    }

    async fn counts(&self, channel: &ChannelHandle) -> Result<ChannelCounts, BrokerError> {
        self.inner.counts(channel).await
    }

    async fn delete_channel(&self, channel: &ChannelHandle) -> Result<(), BrokerError> {
        self.inner.delete_channel(channel).await
    }
}

fn seed_request(bbox: &str, min_zoom: u8, max_zoom: u8, metatile: u32) -> SeedRequest {
    SeedRequest {
        bbox: bbox.parse().unwrap(),
        min_zoom,
        max_zoom,
        retina: false,
        style: CHANNEL.to_string(),
        metatile,
        tile_size: 256,
        attempts: 5,
    }
}

fn config(parallel: usize) -> EngineConfig {
    let mut cfg = EngineConfig::new(CHANNEL, parallel);
    cfg.status_interval = Duration::from_secs(1);
    cfg.exit_on_drain = true;
    cfg
}

fn deps(
    broker: Arc<dyn Broker>,
    renderer: Arc<ScriptedRenderer>,
    store: Arc<RecordingStore>,
) -> (Arc<TaskQueue>, EngineDeps) {
    let queue = Arc::new(TaskQueue::new(broker, LEASE));
    let deps = EngineDeps {
        queue: queue.clone(),
        renderer,
        uploader: Uploader::new(store, BackoffPolicy::default()),
    };
    (queue, deps)
}

/// Run the engine until it stops, returning every event with the (paused) time it arrived.
async fn run_to_stop(cfg: EngineConfig, deps: EngineDeps) -> Vec<(Instant, EngineEvent)> {
    let engine = start_engine(cfg, deps);
    let mut events = engine.subscribe();
    let mut seen = Vec::new();
    loop {
        match events.recv().await {
            Ok(EngineEvent::Stopped) => {
                seen.push((Instant::now(), EngineEvent::Stopped));
                break;
            }
            Ok(ev) => seen.push((Instant::now(), ev)),
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
    engine.wait().await.unwrap();
    seen
}

fn outcomes(events: &[(Instant, EngineEvent)]) -> Vec<TaskOutcome> {
    events
        .iter()
        .filter_map(|(_, ev)| match ev {
            EngineEvent::TaskFinished { outcome } => Some(outcome.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn single_seed_fans_out_to_four_children_and_drains() {
    let broker = Arc::new(MemoryBroker::new());
    let renderer = Arc::new(ScriptedRenderer::default());
    let store = RecordingStore::new(200);
    let (queue, deps) = deps(broker, renderer.clone(), store.clone());

    let channel = queue.ensure_channel(CHANNEL).await.unwrap();
    let seeded = seed_tasks(&queue, &channel, &seed_request("1 1 2 2", 2, 3, 1))
        .await
        .unwrap();
    assert_eq!(seeded, 1);

    let events = run_to_stop(config(2), deps).await;
    let done = outcomes(&events);
    assert_eq!(done.len(), 5);
    assert!(done.iter().all(|o| o.acknowledged && o.error.is_none()));

    let parent: Vec<&TaskOutcome> = done.iter().filter(|o| o.task.tile.z == 2).collect();
    assert_eq!(parent.len(), 1);
    assert_eq!(parent[0].task.tile, TileCoord::new(2, 2, 1));
    assert_eq!(parent[0].children_enqueued, 4);

    let mut children: Vec<TileCoord> = done
        .iter()
        .filter(|o| o.task.tile.z == 3)
        .map(|o| o.task.tile)
        .collect();
    children.sort();
    assert_eq!(
        children,
        vec![
            TileCoord::new(3, 4, 2),
            TileCoord::new(3, 4, 3),
            TileCoord::new(3, 5, 2),
            TileCoord::new(3, 5, 3),
        ]
    );
    assert!(done.iter().filter(|o| o.task.tile.z == 3).all(|o| o.children_enqueued == 0));

    // Children outside the bbox are leased and acknowledged but render nothing.
    let mut rendered = renderer.rendered();
    rendered.sort();
    assert_eq!(rendered, vec![TileCoord::new(2, 2, 1), TileCoord::new(3, 4, 3)]);
    assert_eq!(store.paths(), vec!["/2/2/1.png", "/3/4/3.png"]);

    assert!(events.iter().any(|(_, ev)| matches!(ev, EngineEvent::Drained)));
    assert_eq!(queue.counts(&channel).await.unwrap(), ChannelCounts::default());
}

#[tokio::test(start_paused = true)]
async fn bbox_straddling_a_tile_corner_seeds_four_metatiles() {
    let broker = Arc::new(MemoryBroker::new());
    let (queue, _deps) = deps(broker, Arc::new(ScriptedRenderer::default()), RecordingStore::new(200));
    let channel = queue.ensure_channel(CHANNEL).await.unwrap();

    let seeded = seed_tasks(&queue, &channel, &seed_request("-1 -1 1 1", 2, 3, 1))
        .await
        .unwrap();
    assert_eq!(seeded, 4);
    assert_eq!(queue.counts(&channel).await.unwrap().queued, 4);
}

#[tokio::test(start_paused = true)]
async fn poison_message_is_removed_without_reaching_a_worker() {
    let broker = Arc::new(MemoryBroker::new());
    let renderer = Arc::new(ScriptedRenderer::default());
    let (queue, deps) = deps(broker, renderer.clone(), RecordingStore::new(200));
    let channel = queue.ensure_channel(CHANNEL).await.unwrap();

    let task = tileseed_core::RenderTask::new(
        TileCoord::new(0, 0, 0),
        1,
        false,
        BoundingBox::WORLD,
        0,
        CHANNEL,
    )
    .unwrap();
    queue.enqueue(&channel, &task, 1, 0).await.unwrap();

    // First delivery is abandoned; its lease runs out.
    let leased = queue.receive(&channel, 1, Duration::ZERO).await.unwrap();
    assert_eq!(leased.len(), 1);
    tokio::time::advance(LEASE).await;

    let events = run_to_stop(config(1), deps).await;
    assert!(outcomes(&events).is_empty());
    assert!(renderer.rendered().is_empty());
    assert_eq!(queue.discarded(), 1);
    assert_eq!(queue.counts(&channel).await.unwrap(), ChannelCounts::default());
}

#[tokio::test(start_paused = true)]
async fn receive_pauses_while_local_backlog_exceeds_twice_concurrency() {
    let broker = Arc::new(CountingBroker::default());
    let gate = Arc::new(Semaphore::new(0));
    let renderer = Arc::new(ScriptedRenderer {
        gate: Some(gate.clone()),
        ..ScriptedRenderer::default()
    });
    let (queue, deps) = deps(broker.clone(), renderer.clone(), RecordingStore::new(200));
    let channel = queue.ensure_channel(CHANNEL).await.unwrap();
    let n = seed_tasks(&queue, &channel, &seed_request("-180 -85 180 85", 4, 4, 1))
        .await
        .unwrap();
    assert_eq!(n, 256);

    let mut cfg = config(2);
    cfg.exit_on_drain = false;
    let engine = start_engine(cfg, deps);

    tokio::time::sleep(Duration::from_secs(30)).await;
    // Two running, then backlog 2, 4, 6: the fifth poll is held back.
    assert_eq!(broker.receives.load(Ordering::SeqCst), 4);
    let snap = engine.snapshot();
    assert_eq!(snap.status.map(|s| (s.running, s.pending)), Some((2, 6)));

    gate.add_permits(4);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(broker.receives.load(Ordering::SeqCst) > 4);
    assert_eq!(renderer.rendered().len(), 4);

    gate.add_permits(Semaphore::MAX_PERMITS / 2);
    engine.request_stop();
    engine.wait().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn drain_is_detected_within_one_status_interval() {
    let broker = Arc::new(MemoryBroker::new());
    let (queue, deps) = deps(broker, Arc::new(ScriptedRenderer::default()), RecordingStore::new(200));
    let channel = queue.ensure_channel(CHANNEL).await.unwrap();
    seed_tasks(&queue, &channel, &seed_request("-180 -85 180 85", 0, 0, 1))
        .await
        .unwrap();

    let mut cfg = config(1);
    cfg.status_interval = Duration::from_secs(5);
    let events = run_to_stop(cfg, deps).await;

    let finished_at = events
        .iter()
        .find(|(_, ev)| matches!(ev, EngineEvent::TaskFinished { .. }))
        .map(|(t, _)| *t)
        .unwrap();
    let drained_at = events
        .iter()
        .find(|(_, ev)| matches!(ev, EngineEvent::Drained))
        .map(|(t, _)| *t)
        .unwrap();
    assert!(drained_at >= finished_at);
    assert!(drained_at - finished_at <= Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn failed_upload_does_not_block_acknowledgment() {
    let broker = Arc::new(MemoryBroker::new());
    let store = RecordingStore::new(503);
    let (queue, deps) = deps(broker, Arc::new(ScriptedRenderer::default()), store.clone());
    let uploader = deps.uploader.clone();
    let channel = queue.ensure_channel(CHANNEL).await.unwrap();
    seed_tasks(&queue, &channel, &seed_request("-180 -85 180 85", 0, 0, 1))
        .await
        .unwrap();

    let events = run_to_stop(config(1), deps).await;
    let done = outcomes(&events);
    assert_eq!(done.len(), 1);
    assert!(done[0].acknowledged);
    assert_eq!(done[0].tiles_rendered, 1);

    // Engine shutdown waits for the detached upload to give up.
    assert_eq!(store.paths().len(), 6);
    assert_eq!(uploader.pending(), 0);
    assert_eq!(uploader.failed(), 1);
    assert_eq!(queue.counts(&channel).await.unwrap(), ChannelCounts::default());
}

#[tokio::test(start_paused = true)]
async fn render_errors_still_fan_out_and_acknowledge() {
    let broker = Arc::new(MemoryBroker::new());
    let renderer = Arc::new(ScriptedRenderer {
        fail: true,
        ..ScriptedRenderer::default()
    });
    let store = RecordingStore::new(200);
    let (queue, deps) = deps(broker, renderer, store.clone());
    let channel = queue.ensure_channel(CHANNEL).await.unwrap();
    seed_tasks(&queue, &channel, &seed_request("1 1 2 2", 2, 3, 1))
        .await
        .unwrap();

    let events = run_to_stop(config(2), deps).await;
    let done = outcomes(&events);
    assert_eq!(done.len(), 5);
    assert!(done.iter().all(|o| o.acknowledged));
    assert_eq!(done.iter().map(|o| o.render_errors).sum::<u32>(), 2);
    assert!(store.paths().is_empty());
}

#[tokio::test(start_paused = true)]
async fn interactivity_grids_are_uploaded_beside_tiles() {
    let broker = Arc::new(MemoryBroker::new());
    let renderer = Arc::new(ScriptedRenderer {
        grid: true,
        ..ScriptedRenderer::default()
    });
    let store = RecordingStore::new(200);
    let (queue, deps) = deps(broker, renderer, store.clone());
    let channel = queue.ensure_channel(CHANNEL).await.unwrap();
    seed_tasks(&queue, &channel, &seed_request("1 1 2 2", 2, 2, 1))
        .await
        .unwrap();

    let mut cfg = config(1);
    cfg.interactivity = true;
    run_to_stop(cfg, deps).await;

    assert_eq!(store.paths(), vec!["/2/2/1.json", "/2/2/1.png"]);
    let writes = store.writes.lock().unwrap();
    let (_, grid_headers) = writes.iter().find(|(p, _)| p.ends_with(".json")).unwrap();
    assert_eq!(grid_headers["x-amz-meta-Surrogate-Key"], "osm z2 osm/z2 json");
    let (_, png_headers) = writes.iter().find(|(p, _)| p.ends_with(".png")).unwrap();
    assert_eq!(png_headers["content-type"], "image/png");
    assert_eq!(png_headers["x-amz-acl"], "public-read");
}

#[tokio::test(start_paused = true)]
async fn receive_errors_back_off_then_recover() {
    let broker = Arc::new(CountingBroker::failing(3));
    let store = RecordingStore::new(200);
    let (queue, deps) = deps(broker.clone(), Arc::new(ScriptedRenderer::default()), store.clone());
    let channel = queue.ensure_channel(CHANNEL).await.unwrap();
    seed_tasks(&queue, &channel, &seed_request("1 1 2 2", 2, 3, 1))
        .await
        .unwrap();

    let mut cfg = config(2);
    cfg.idle_sleep = Duration::from_secs(5);
    let started = Instant::now();
    let events = run_to_stop(cfg, deps).await;

    let errors: Vec<Instant> = events
        .iter()
        .filter(|(_, ev)| matches!(ev, EngineEvent::Error { .. }))
        .map(|(t, _)| *t)
        .collect();
    assert_eq!(errors.len(), 3);
    for pair in errors.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_secs(5));
    }

    let first_done = events
        .iter()
        .find(|(_, ev)| matches!(ev, EngineEvent::TaskFinished { .. }))
        .map(|(t, _)| *t)
        .unwrap();
    assert!(first_done - started >= Duration::from_secs(15));

    let done = outcomes(&events);
    assert_eq!(done.len(), 5);
    assert!(done.iter().all(|o| o.acknowledged));
    assert!(events.iter().any(|(_, ev)| matches!(ev, EngineEvent::Drained)));
    assert_eq!(store.paths(), vec!["/2/2/1.png", "/3/4/3.png"]);
    assert_eq!(queue.counts(&channel).await.unwrap(), ChannelCounts::default());
}

#[tokio::test(start_paused = true)]
async fn stored_tiles_are_skipped_when_asked() {
    let broker = Arc::new(MemoryBroker::new());
    let renderer = Arc::new(ScriptedRenderer::default());
    let store = RecordingStore::holding(200, &["/2/2/1.png"]);
    let (queue, deps) = deps(broker, renderer.clone(), store.clone());
    let channel = queue.ensure_channel(CHANNEL).await.unwrap();
    seed_tasks(&queue, &channel, &seed_request("1 1 2 2", 2, 3, 1))
        .await
        .unwrap();

    let mut cfg = config(2);
    cfg.skip_existing = true;
    let events = run_to_stop(cfg, deps).await;
    let done = outcomes(&events);
    assert_eq!(done.len(), 5);

    // The stored parent still fans out; only its render and upload are skipped.
    let parent = done.iter().find(|o| o.task.tile.z == 2).unwrap();
    assert_eq!((parent.tiles_skipped, parent.tiles_rendered), (1, 0));
    assert_eq!(parent.children_enqueued, 4);
    assert_eq!(renderer.rendered(), vec![TileCoord::new(3, 4, 3)]);
    assert_eq!(store.paths(), vec!["/3/4/3.png"]);
}

#[tokio::test(start_paused = true)]
async fn stored_tiles_are_rendered_again_by_default() {
    let broker = Arc::new(MemoryBroker::new());
    let renderer = Arc::new(ScriptedRenderer::default());
    let store = RecordingStore::holding(200, &["/2/2/1.png"]);
    let (queue, deps) = deps(broker, renderer.clone(), store.clone());
    let channel = queue.ensure_channel(CHANNEL).await.unwrap();
    seed_tasks(&queue, &channel, &seed_request("1 1 2 2", 2, 2, 1))
        .await
        .unwrap();

    let done = outcomes(&run_to_stop(config(1), deps).await);
    assert_eq!(done[0].tiles_skipped, 0);
    assert_eq!(renderer.rendered(), vec![TileCoord::new(2, 2, 1)]);
    assert_eq!(store.paths(), vec!["/2/2/1.png"]);
}
