//! Orchestrator tests against scripted fake surfaces
//!
//! The fakes record every launch, initialize and render call, so these tests
//! can assert not just outcomes but that the remote side was contacted
//! exactly as often as the recovery rules allow.

use async_trait::async_trait;
use framereel::{
    AbortPoint, AbortedPass, CaptureRequest, Error, FrameDomain, FramePosition, Pipeline,
    PipelineConfig, PipelineState, RecoveryPolicy, RenderCapabilities, RenderSurface, Result,
    SceneTarget, SurfaceProvider,
};
use framereel::encoder::FrameSink;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct ScriptInner {
    // One outcome consumed per render call; an empty queue means success.
    outcomes: VecDeque<bool>,
    launches: usize,
    init_calls: usize,
    rendered: Vec<f64>,
}

#[derive(Clone, Default)]
struct Script(Arc<Mutex<ScriptInner>>);

impl Script {
    fn failing_first(n: usize) -> Self {
        let script = Script::default();
        script.0.lock().unwrap().outcomes = std::iter::repeat(false).take(n).collect();
        script
    }

    fn launches(&self) -> usize {
        self.0.lock().unwrap().launches
    }

    fn init_calls(&self) -> usize {
        self.0.lock().unwrap().init_calls
    }

    fn rendered(&self) -> Vec<f64> {
        self.0.lock().unwrap().rendered.clone()
    }
}

struct FakeSurface {
    script: Script,
    source: String,
    domain: FrameDomain,
}

#[async_trait]
impl RenderSurface for FakeSurface {
    async fn initialize(&mut self, _target: &SceneTarget) -> Result<RenderCapabilities> {
        self.script.0.lock().unwrap().init_calls += 1;
        Ok(RenderCapabilities {
            source_identifier: self.source.clone(),
            device_pixel_ratio: 1.0,
            frame_domain: self.domain.clone(),
        })
    }

    async fn render_frame(&mut self, position: FramePosition) -> Result<Vec<u8>> {
        let wire = position.wire_value();
        let ok = {
            let mut inner = self.script.0.lock().unwrap();
            inner.rendered.push(wire);
            inner.outcomes.pop_front().unwrap_or(true)
        };
        if ok {
            Ok(wire.to_string().into_bytes())
        } else {
            Err(Error::RemoteRender("scripted failure".into()))
        }
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
struct FakeProvider {
    script: Script,
    source: String,
    domain: FrameDomain,
}

impl FakeProvider {
    fn new(script: Script) -> Self {
        Self {
            script,
            source: "fake".into(),
            domain: FrameDomain::Seconds {
                duration_seconds: 2.0,
            },
        }
    }

    fn with_domain(mut self, domain: FrameDomain) -> Self {
        self.domain = domain;
        self
    }
}

#[async_trait]
impl SurfaceProvider for FakeProvider {
    type Surface = FakeSurface;

    async fn launch(&self) -> Result<FakeSurface> {
        self.script.0.lock().unwrap().launches += 1;
        Ok(FakeSurface {
            script: self.script.clone(),
            source: self.source.clone(),
            domain: self.domain.clone(),
        })
    }
}

#[derive(Default)]
struct SinkLog {
    writes: Vec<Vec<u8>>,
    closes: usize,
}

#[derive(Clone, Default)]
struct RecordingSink(Arc<Mutex<SinkLog>>);

impl RecordingSink {
    fn writes(&self) -> Vec<Vec<u8>> {
        self.0.lock().unwrap().writes.clone()
    }

    fn closes(&self) -> usize {
        self.0.lock().unwrap().closes
    }

    fn written_positions(&self) -> Vec<f64> {
        self.writes()
            .iter()
            .map(|bytes| String::from_utf8(bytes.clone()).unwrap().parse().unwrap())
            .collect()
    }
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn write(&mut self, image: &[u8]) -> Result<()> {
        self.0.lock().unwrap().writes.push(image.to_vec());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.0.lock().unwrap().closes += 1;
        Ok(())
    }
}

fn test_config(frame_rate: f64) -> PipelineConfig {
    PipelineConfig {
        frame_rate,
        snapshot_dir: snapshot_dir(),
        recovery: RecoveryPolicy {
            reinit_pause: Duration::ZERO,
        },
        ..Default::default()
    }
}

fn snapshot_dir() -> PathBuf {
    static COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    std::env::temp_dir().join(format!("framereel-test-{}-{}", std::process::id(), n))
}

#[tokio::test]
async fn two_seconds_at_ten_fps_encodes_twenty_frames_in_order() {
    let script = Script::default();
    let sink = RecordingSink::default();
    let mut pipeline = Pipeline::new(
        FakeProvider::new(script.clone()),
        test_config(10.0),
        sink.clone(),
    );

    let request = CaptureRequest::new(SceneTarget::new("fake://scene")).with_duration(2.0);
    let report = pipeline.run(&[request]).await.unwrap();

    assert_eq!(report.frames_encoded, 20);
    assert_eq!(report.aborted_at, None);
    assert_eq!(pipeline.state(), PipelineState::Closed);

    let expected: Vec<f64> = (0..20).map(|i| i as f64 / 19.0).collect();
    assert_eq!(sink.written_positions(), expected);
    assert_eq!(sink.closes(), 1, "shutdown closes the sink exactly once");
}

#[tokio::test]
async fn config_errors_fail_before_any_remote_call() {
    let script = Script::default();
    let sink = RecordingSink::default();
    let mut pipeline = Pipeline::new(
        FakeProvider::new(script.clone()),
        test_config(10.0),
        sink.clone(),
    );

    let request = CaptureRequest::new(SceneTarget::new("fake://scene"))
        .with_duration(2.0)
        .with_snapshots(vec![1.5]);
    let err = pipeline.run(&[request]).await.unwrap_err();

    assert!(matches!(err, Error::Config(_)));
    assert_eq!(script.launches(), 0);
    assert_eq!(script.rendered().len(), 0);
    assert!(sink.writes().is_empty());
}

#[tokio::test]
async fn nan_positions_fail_before_any_remote_call() {
    let script = Script::default();
    let sink = RecordingSink::default();
    let mut pipeline = Pipeline::new(
        FakeProvider::new(script.clone()),
        test_config(10.0),
        sink.clone(),
    );

    let request =
        CaptureRequest::new(SceneTarget::new("fake://scene")).with_snapshots(vec![f64::NAN]);
    assert!(pipeline.run(&[request]).await.is_err());
    assert_eq!(script.launches(), 0);
}

#[tokio::test]
async fn transient_failure_still_encodes_every_frame() {
    let script = Script::failing_first(1);
    let sink = RecordingSink::default();
    let mut pipeline = Pipeline::new(
        FakeProvider::new(script.clone()),
        test_config(10.0),
        sink.clone(),
    );

    let request = CaptureRequest::new(SceneTarget::new("fake://scene")).with_duration(1.0);
    let report = pipeline.run(&[request]).await.unwrap();

    assert_eq!(report.frames_encoded, 10);
    assert_eq!(report.aborted_at, None);
    // One failed attempt plus ten good ones, all in one session.
    assert_eq!(script.rendered().len(), 11);
    assert_eq!(script.launches(), 1);
}

#[tokio::test]
async fn persistent_failure_aborts_with_a_resume_offset() {
    // Frames 0..4 succeed; frame 5 fails through every escalation step.
    let script = Script::default();
    {
        let mut inner = script.0.lock().unwrap();
        inner.outcomes = (0..8).map(|i| i < 5).collect();
    }
    let sink = RecordingSink::default();
    let mut pipeline = Pipeline::new(
        FakeProvider::new(script.clone()),
        test_config(10.0),
        sink.clone(),
    );

    let request = CaptureRequest::new(SceneTarget::new("fake://scene")).with_duration(1.0);
    let report = pipeline.run(&[request]).await.unwrap();

    assert_eq!(report.frames_encoded, 5);
    let abort = report.aborted_at.unwrap();
    assert_eq!(
        abort,
        AbortPoint {
            request: 0,
            pass: AbortedPass::Video,
            offset: 5,
        }
    );
    assert_eq!(abort.resume_offset(), Some(5));
    assert_eq!(pipeline.state(), PipelineState::Aborted);
    // 5 good frames + 3 attempts at the bad one (try, retry, post-reinit).
    assert_eq!(script.rendered().len(), 8);
    assert_eq!(script.launches(), 2);
    assert_eq!(sink.closes(), 1, "shutdown still closes the sink");
    assert_eq!(sink.writes().len(), 5);
}

#[tokio::test]
async fn start_at_resumes_an_index_domain_slurp() {
    let script = Script::default();
    let provider = FakeProvider::new(script.clone()).with_domain(FrameDomain::Index {
        first_frame: 0,
        last_frame: 9,
    });
    let sink = RecordingSink::default();
    let mut pipeline = Pipeline::new(provider, test_config(10.0), sink.clone());

    let request = CaptureRequest::new(SceneTarget::new("fake://scene"))
        .slurp()
        .starting_at(5);
    let report = pipeline.run(&[request]).await.unwrap();

    assert_eq!(report.frames_encoded, 5);
    assert_eq!(script.rendered(), vec![5.0, 6.0, 7.0, 8.0, 9.0]);
}

#[tokio::test]
async fn source_mismatch_is_fatal_but_shutdown_still_runs() {
    let script = Script::default();
    let sink = RecordingSink::default();
    let mut pipeline = Pipeline::new(
        FakeProvider::new(script.clone()),
        test_config(10.0),
        sink.clone(),
    );

    let request = CaptureRequest::new(SceneTarget::new("fake://scene").expecting("other"))
        .with_duration(1.0);
    let err = pipeline.run(&[request]).await.unwrap_err();

    assert!(matches!(err, Error::SourceMismatch { .. }));
    assert_eq!(pipeline.state(), PipelineState::Aborted);
    assert_eq!(script.rendered().len(), 0);
    assert_eq!(sink.closes(), 1);
}

#[tokio::test]
async fn snapshots_land_as_files_and_are_joined_at_shutdown() {
    let script = Script::default();
    let sink = RecordingSink::default();
    let config = test_config(10.0);
    let dir = config.snapshot_dir.clone();
    let mut pipeline = Pipeline::new(FakeProvider::new(script.clone()), config, sink.clone());

    let request = CaptureRequest::new(SceneTarget::new("fake://scene"))
        .with_duration(0.5)
        .with_snapshots(vec![0.0, 0.25, 0.5, 0.75]);
    let report = pipeline.run(&[request]).await.unwrap();

    assert_eq!(report.frames_encoded, 5);
    assert_eq!(report.snapshots_written, 4);
    assert_eq!(report.snapshot_failures, 0);

    let mut names: Vec<String> = std::fs::read_dir(&dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    assert_eq!(names.len(), 4);
    assert!(names.iter().all(|name| name.ends_with(".png")));

    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn several_requests_share_one_encoder_session() {
    let script = Script::default();
    let sink = RecordingSink::default();
    let mut pipeline = Pipeline::new(
        FakeProvider::new(script.clone()),
        test_config(10.0),
        sink.clone(),
    );

    let first = CaptureRequest::new(SceneTarget::new("fake://intro")).with_duration(0.5);
    let second = CaptureRequest::new(SceneTarget::new("fake://main")).with_duration(1.0);
    let report = pipeline.run(&[first, second]).await.unwrap();

    assert_eq!(report.frames_encoded, 15);
    assert_eq!(script.init_calls(), 2, "each request initializes its scene");
    assert_eq!(script.launches(), 1, "one browser serves both scenes");
    assert_eq!(sink.closes(), 1);
}

#[tokio::test]
async fn an_abort_in_one_request_skips_the_rest() {
    let script = Script::failing_first(1000);
    let sink = RecordingSink::default();
    let mut pipeline = Pipeline::new(
        FakeProvider::new(script.clone()),
        test_config(10.0),
        sink.clone(),
    );

    let first = CaptureRequest::new(SceneTarget::new("fake://intro")).with_duration(0.5);
    let second = CaptureRequest::new(SceneTarget::new("fake://main")).with_duration(1.0);
    let report = pipeline.run(&[first, second]).await.unwrap();

    assert_eq!(report.frames_encoded, 0);
    assert_eq!(
        report.aborted_at,
        Some(AbortPoint {
            request: 0,
            pass: AbortedPass::Video,
            offset: 0,
        })
    );
    // The first frame burned three attempts; the second request never ran.
    assert_eq!(script.rendered().len(), 3);
}

#[tokio::test]
async fn an_abort_in_a_later_request_names_that_request() {
    // The first request's 5 frames succeed; the second wedges immediately.
    let script = Script::default();
    {
        let mut inner = script.0.lock().unwrap();
        inner.outcomes = (0..8).map(|i| i < 5).collect();
    }
    let sink = RecordingSink::default();
    let mut pipeline = Pipeline::new(
        FakeProvider::new(script.clone()),
        test_config(10.0),
        sink.clone(),
    );

    let first = CaptureRequest::new(SceneTarget::new("fake://intro")).with_duration(0.5);
    let second = CaptureRequest::new(SceneTarget::new("fake://main")).with_duration(1.0);
    let report = pipeline.run(&[first, second]).await.unwrap();

    assert_eq!(report.frames_encoded, 5);
    assert_eq!(
        report.aborted_at,
        Some(AbortPoint {
            request: 1,
            pass: AbortedPass::Video,
            offset: 0,
        })
    );
}

#[tokio::test]
async fn a_snapshot_abort_does_not_advertise_a_video_offset() {
    // All 5 video frames succeed; the first snapshot wedges.
    let script = Script::default();
    {
        let mut inner = script.0.lock().unwrap();
        inner.outcomes = (0..8).map(|i| i < 5).collect();
    }
    let sink = RecordingSink::default();
    let mut pipeline = Pipeline::new(
        FakeProvider::new(script.clone()),
        test_config(10.0),
        sink.clone(),
    );

    let request = CaptureRequest::new(SceneTarget::new("fake://scene"))
        .with_duration(0.5)
        .with_snapshots(vec![0.1, 0.2]);
    let report = pipeline.run(&[request]).await.unwrap();

    // The video made it out intact; only the snapshot pass aborted.
    assert_eq!(report.frames_encoded, 5);
    assert_eq!(sink.writes().len(), 5);
    let abort = report.aborted_at.unwrap();
    assert_eq!(abort.request, 0);
    assert_eq!(abort.pass, AbortedPass::Snapshot);
    assert_eq!(abort.offset, 0, "no snapshot had been written yet");
    assert_eq!(abort.resume_offset(), None, "a video offset would be wrong here");
    assert_eq!(pipeline.state(), PipelineState::Aborted);
}

#[tokio::test]
async fn a_pipeline_runs_only_once() {
    let script = Script::default();
    let sink = RecordingSink::default();
    let mut pipeline = Pipeline::new(
        FakeProvider::new(script.clone()),
        test_config(10.0),
        sink.clone(),
    );

    let request = CaptureRequest::new(SceneTarget::new("fake://scene")).with_duration(0.5);
    pipeline.run(std::slice::from_ref(&request)).await.unwrap();
    assert_eq!(pipeline.state(), PipelineState::Closed);

    let err = pipeline.run(&[request]).await.unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[tokio::test]
async fn an_empty_run_closes_cleanly() {
    let script = Script::default();
    let sink = RecordingSink::default();
    let mut pipeline = Pipeline::new(
        FakeProvider::new(script.clone()),
        test_config(10.0),
        sink.clone(),
    );

    let report = pipeline.run(&[]).await.unwrap();
    assert_eq!(report.frames_encoded, 0);
    assert_eq!(pipeline.state(), PipelineState::Closed);
    assert_eq!(script.launches(), 0);
    assert_eq!(sink.closes(), 1);
}
