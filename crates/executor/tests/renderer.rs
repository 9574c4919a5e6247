//! End-to-end tests for [`Renderer`] against in-process mock render
//! services. Every RPC is recorded so ordering and config propagation can
//! be checked per worker.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use renderfarm_core::decode::DecodeError;
use renderfarm_core::protocol::{
    AuxiliaryStream, RenderBatchRequest, RenderBatchResponse, Stream, StreamEntry, UpdateRequest,
};
use renderfarm_core::{
    Batch, DeploymentOptions, RemoteRendererConfig, RendererConfig, Seed, ServerSlot,
    StartupRetry, StreamArray,
};
use renderfarm_executor::{ExecutorError, RenderError, RenderOutput, Renderer};
use renderfarm_server::{Connector, RenderClientError, RenderService};
use serde_json::json;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Mock render service
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Update {
        port: u16,
        components: Vec<serde_json::Value>,
    },
    Render {
        port: u16,
        batch_seed: i32,
        batch_id: usize,
    },
}

#[derive(Default)]
struct Behaviour {
    fail_connect_port: Option<u16>,
    render_delay: Duration,
    /// Number of upcoming renders that fail with a transport error.
    failing_renders: AtomicUsize,
    /// Send image frames that do not fit the configured size.
    bad_frames: bool,
}

#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<Call>>,
}

impl Recorder {
    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn calls_for(&self, port: u16) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| match c {
                Call::Update { port: p, .. } | Call::Render { port: p, .. } => *p == port,
            })
            .collect()
    }
}

struct MockService {
    port: u16,
    recorder: Arc<Recorder>,
    behaviour: Arc<Behaviour>,
}

#[async_trait]
impl RenderService for MockService {
    async fn update(&self, request: &UpdateRequest) -> Result<(), RenderClientError> {
        self.recorder.record(Call::Update {
            port: self.port,
            components: request.components.clone(),
        });
        Ok(())
    }

    async fn render_batch(
        &self,
        request: &RenderBatchRequest,
    ) -> Result<RenderBatchResponse, RenderClientError> {
        tokio::time::sleep(self.behaviour.render_delay).await;

        let failing = &self.behaviour.failing_renders;
        if failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(RenderClientError::Connection("connection reset".into()));
        }

        self.recorder.record(Call::Render {
            port: self.port,
            batch_seed: request.batch_seed,
            batch_id: request.entries[0].qpos[0] as usize,
        });

        let frame_len = if self.behaviour.bad_frames {
            (request.width * request.height * 4 + 1) as usize
        } else {
            (request.width * request.height * 4) as usize
        };
        let streams = request
            .camera_names
            .iter()
            .map(|name| Stream {
                name: name.clone(),
                entries: request
                    .entries
                    .iter()
                    .map(|_| StreamEntry {
                        image_data: vec![255; frame_len],
                        ..Default::default()
                    })
                    .collect(),
            })
            .collect();

        Ok(RenderBatchResponse {
            streams,
            auxiliary_float_streams: vec![AuxiliaryStream {
                name: "qpos".into(),
                data: request.entries.iter().flat_map(|e| e.qpos.clone()).collect(),
            }],
            ..Default::default()
        })
    }
}

struct MockConnector {
    recorder: Arc<Recorder>,
    behaviour: Arc<Behaviour>,
}

#[async_trait]
impl Connector for MockConnector {
    type Service = MockService;

    async fn connect(&self, slot: ServerSlot) -> Result<MockService, RenderClientError> {
        if self.behaviour.fail_connect_port == Some(slot.port) {
            return Err(RenderClientError::Connection("connection refused".into()));
        }
        Ok(MockService {
            port: slot.port,
            recorder: Arc::clone(&self.recorder),
            behaviour: Arc::clone(&self.behaviour),
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn test_config() -> RemoteRendererConfig {
    RemoteRendererConfig {
        camera_names: vec!["top".into()],
        image_width: 2,
        image_height: 2,
        spawn_servers: false,
        poll_interval: Duration::from_millis(20),
        startup_stagger: Duration::ZERO,
        startup_retry: StartupRetry {
            attempts: 2,
            base_delay: Duration::from_millis(5),
            step: Duration::from_millis(5),
        },
        shutdown_grace: Duration::from_secs(5),
        ..Default::default()
    }
}

fn slots(n: u16) -> Vec<ServerSlot> {
    (0..n).map(|i| ServerSlot::new(u32::from(i), 7000 + i)).collect()
}

fn renderer_with(
    workers: u16,
    config: RemoteRendererConfig,
    behaviour: Behaviour,
) -> (Renderer<MockConnector>, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let connector = MockConnector {
        recorder: Arc::clone(&recorder),
        behaviour: Arc::new(behaviour),
    };
    let renderer = Renderer::new(
        "test",
        slots(workers),
        config,
        DeploymentOptions::default(),
        connector,
    )
    .expect("renderer");
    (renderer, recorder)
}

fn batch(id: usize, seed: u64) -> Batch {
    Batch::with_batch_seed(vec![vec![id as f64, 0.5]], seed).expect("batch")
}

fn batch_id(batch: &Batch) -> usize {
    batch.states()[0][0] as usize
}

fn scene(name: &str) -> RendererConfig {
    RendererConfig {
        components: vec![json!({ "name": name })],
    }
}

async fn collect(rx: &mut mpsc::UnboundedReceiver<RenderOutput>, n: usize) -> Vec<Batch> {
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let result = rx.recv().await.expect("result delivered");
        out.push(result.expect("render succeeds"));
    }
    out
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn every_batch_rendered_exactly_once() {
    let (renderer, recorder) = renderer_with(3, test_config(), Behaviour::default());
    renderer.start().await.expect("starts");

    let (tx, mut rx) = mpsc::unbounded_channel();
    for id in 0..30 {
        renderer.render_batch_async(batch(id, 0), tx.clone()).expect("submitted");
    }
    let results = collect(&mut rx, 30).await;

    let ids: BTreeSet<usize> = results.iter().map(batch_id).collect();
    assert_eq!(ids, (0..30).collect());

    let renders = recorder
        .calls()
        .iter()
        .filter(|c| matches!(c, Call::Render { .. }))
        .count();
    assert_eq!(renders, 30);

    renderer.shutdown().await;
}

#[tokio::test]
async fn per_worker_order_follows_submission() {
    let behaviour = Behaviour {
        render_delay: Duration::from_millis(2),
        ..Default::default()
    };
    let (renderer, recorder) = renderer_with(2, test_config(), behaviour);
    renderer.start().await.expect("starts");

    let (tx, mut rx) = mpsc::unbounded_channel();
    for id in 0..20 {
        renderer.render_batch_async(batch(id, 0), tx.clone()).expect("submitted");
    }
    collect(&mut rx, 20).await;

    for port in [7000, 7001] {
        let ids: Vec<usize> = recorder
            .calls_for(port)
            .into_iter()
            .filter_map(|c| match c {
                Call::Render { batch_id, .. } => Some(batch_id),
                Call::Update { .. } => None,
            })
            .collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]), "port {port} out of order: {ids:?}");
    }

    renderer.shutdown().await;
}

#[tokio::test]
async fn results_carry_decoded_streams() {
    let (renderer, _) = renderer_with(1, test_config(), Behaviour::default());
    renderer.start().await.expect("starts");

    let result = renderer.render_batch(batch(4, 9)).await.expect("renders");

    assert_eq!(result.states(), &[vec![4.0, 0.5]]);
    assert_matches!(result.stream("top"), Some(StreamArray::Rgba(a)) if a.shape() == [1, 2, 2, 4]);
    assert_matches!(result.stream("qpos"), Some(StreamArray::Float(a)) if a.shape() == [1, 2]);

    renderer.shutdown().await;
}

#[tokio::test]
async fn seeds_preserved_across_two_workers() {
    let behaviour = Behaviour {
        render_delay: Duration::from_millis(20),
        ..Default::default()
    };
    let (renderer, recorder) = renderer_with(2, test_config(), behaviour);
    renderer.start().await.expect("starts");

    let (tx, mut rx) = mpsc::unbounded_channel();
    for seed in 0..4u64 {
        renderer
            .render_batch_async(batch(seed as usize, seed), tx.clone())
            .expect("submitted");
    }
    let results = collect(&mut rx, 4).await;

    for result in &results {
        assert_eq!(result.seed(), &Seed::Batch(batch_id(result) as u64));
    }
    let sent: BTreeSet<i32> = recorder
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::Render { batch_seed, .. } => Some(batch_seed),
            Call::Update { .. } => None,
        })
        .collect();
    assert_eq!(sent, (0..4).collect());

    renderer.shutdown().await;
}

// ---------------------------------------------------------------------------
// Config updates
// ---------------------------------------------------------------------------

#[tokio::test]
async fn config_updates_precede_renders_in_order() {
    let (renderer, recorder) = renderer_with(1, test_config(), Behaviour::default());
    renderer.start().await.expect("starts");

    renderer.render_batch(batch(0, 0)).await.expect("renders");
    renderer.update_config(scene("v1"));
    renderer.render_batch(batch(1, 0)).await.expect("renders");
    renderer.update_config(scene("v2"));
    renderer.render_batch(batch(2, 0)).await.expect("renders");
    renderer.render_batch(batch(3, 0)).await.expect("renders");

    let render = |batch_id| Call::Render {
        port: 7000,
        batch_seed: 0,
        batch_id,
    };
    let update = |name: &str| Call::Update {
        port: 7000,
        components: scene(name).components,
    };
    assert_eq!(
        recorder.calls(),
        vec![
            render(0),
            update("v1"),
            render(1),
            update("v2"),
            render(2),
            render(3),
        ]
    );

    renderer.shutdown().await;
}

#[tokio::test]
async fn each_worker_applies_a_version_once() {
    let behaviour = Behaviour {
        render_delay: Duration::from_millis(5),
        ..Default::default()
    };
    let (renderer, recorder) = renderer_with(2, test_config(), behaviour);
    renderer.start().await.expect("starts");

    let version = renderer.update_config(scene("fog"));
    assert_eq!(version, 1);

    let (tx, mut rx) = mpsc::unbounded_channel();
    for id in 0..10 {
        renderer.render_batch_async(batch(id, 0), tx.clone()).expect("submitted");
    }
    collect(&mut rx, 10).await;

    for port in [7000, 7001] {
        let calls = recorder.calls_for(port);
        let updates = calls
            .iter()
            .filter(|c| matches!(c, Call::Update { .. }))
            .count();
        if calls.is_empty() {
            continue;
        }
        assert_eq!(updates, 1, "port {port}: {calls:?}");
        assert_matches!(calls.first(), Some(Call::Update { .. }));
    }

    renderer.shutdown().await;
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transport_error_reaches_caller_and_worker_survives() {
    let behaviour = Behaviour {
        failing_renders: AtomicUsize::new(1),
        ..Default::default()
    };
    let (renderer, _) = renderer_with(1, test_config(), behaviour);
    renderer.start().await.expect("starts");

    assert_matches!(
        renderer.render_batch(batch(0, 0)).await,
        Err(ExecutorError::Render(RenderError::Transport(_)))
    );
    let retried = renderer.render_batch(batch(1, 0)).await.expect("worker still serving");
    assert_eq!(batch_id(&retried), 1);

    renderer.shutdown().await;
}

#[tokio::test]
async fn malformed_frames_fail_the_batch() {
    let behaviour = Behaviour {
        bad_frames: true,
        ..Default::default()
    };
    let (renderer, _) = renderer_with(1, test_config(), behaviour);
    renderer.start().await.expect("starts");

    assert_matches!(
        renderer.render_batch(batch(0, 0)).await,
        Err(ExecutorError::Render(RenderError::Decode(DecodeError::FrameSize { .. })))
    );

    renderer.shutdown().await;
}

#[tokio::test]
async fn unreachable_server_aborts_start() {
    let behaviour = Behaviour {
        fail_connect_port: Some(7001),
        ..Default::default()
    };
    let (renderer, _) = renderer_with(2, test_config(), behaviour);

    assert_matches!(
        renderer.start().await,
        Err(ExecutorError::StartupFailure { worker: 1, .. })
    );
    assert_matches!(
        renderer.render_batch(batch(0, 0)).await,
        Err(ExecutorError::Stopped)
    );
}

#[tokio::test]
async fn queued_batch_sees_closed_channel_at_shutdown() {
    let behaviour = Behaviour {
        render_delay: Duration::from_millis(300),
        ..Default::default()
    };
    let (renderer, _) = renderer_with(1, test_config(), behaviour);
    renderer.start().await.expect("starts");
    let renderer = Arc::new(renderer);

    let first = tokio::spawn({
        let renderer = Arc::clone(&renderer);
        async move { renderer.render_batch(batch(0, 0)).await }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    let second = tokio::spawn({
        let renderer = Arc::clone(&renderer);
        async move { renderer.render_batch(batch(1, 0)).await }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;

    renderer.shutdown().await;

    assert_matches!(first.await.expect("join"), Ok(b) if batch_id(&b) == 0);
    assert_matches!(
        second.await.expect("join"),
        Err(ExecutorError::ResultChannelClosed)
    );
}

// ---------------------------------------------------------------------------
// Owned server processes
// ---------------------------------------------------------------------------

#[cfg(unix)]
#[tokio::test]
async fn shutdown_terminates_spawned_servers() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().expect("tempdir");
    let script = dir.path().join("run.sh");
    let pid_file = dir.path().join("server.pid");
    std::fs::write(
        &script,
        format!("#!/bin/sh\necho $$ > {}\nexec sleep 30\n", pid_file.display()),
    )
    .expect("write script");
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).expect("chmod");

    let scene_file = dir.path().join("scene.json");
    std::fs::write(&scene_file, r#"{"components": []}"#).expect("write scene");

    let config = RemoteRendererConfig {
        spawn_servers: true,
        renderer_local_binary: Some(script),
        model_xml_path: Some("scene.xml".into()),
        model_mapping_path: Some("scene.mapping".into()),
        renderer_config_path: Some(scene_file),
        ..test_config()
    };

    let (renderer, _) = renderer_with(1, config, Behaviour::default());
    renderer.start().await.expect("starts");

    let mut pid = None;
    for _ in 0..100 {
        if let Ok(text) = std::fs::read_to_string(&pid_file) {
            if let Ok(p) = text.trim().parse::<i32>() {
                pid = Some(p);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let pid = pid.expect("server wrote its pid");
    assert_eq!(unsafe { libc::kill(pid, 0) }, 0, "server should be running");

    renderer.shutdown().await;

    assert_ne!(unsafe { libc::kill(pid, 0) }, 0, "server {pid} survived shutdown");
}
