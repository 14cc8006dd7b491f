//! End-to-end runs of the measurement pipeline on synthetic frames.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use approx::assert_relative_eq;
use keypoint_gauge::filter::StabilizerKind;
use keypoint_gauge::movement::FilterKind;
use keypoint_gauge::telemetry::{LogTransport, TelemetryWorker};
use keypoint_gauge::utils::ManualClock;
use keypoint_gauge::{
    ConnectionConfig, DetectionRecord, DistanceEngine, DistanceSample, DistanceSink, EngineConfig, Keypoint,
    MeasurementPipeline, PipelineConfig, TelemetryPublisher,
};

/// Reference frame with CB = 210 px and DC = 300 px, i.e. 10 px per unit.
fn reference_frame() -> DetectionRecord {
    DetectionRecord::new("reference-frame", [295.0, 150.0, 505.0, 450.0], 0.95).with_keypoints(vec![
        Keypoint::new(295.0, 150.0, 0.9),
        Keypoint::new(295.0, 450.0, 0.9),
        Keypoint::new(505.0, 450.0, 0.9),
        Keypoint::new(505.0, 150.0, 0.9),
    ])
}

fn moving_part_at(x: f64, y: f64) -> DetectionRecord {
    DetectionRecord::new("moving-part", [x - 5.0, y - 5.0, x + 5.0, y + 5.0], 0.9).with_keypoints(vec![
        Keypoint::new(x - 5.0, y - 5.0, 0.9),
        Keypoint::new(x + 5.0, y - 5.0, 0.9),
        Keypoint::new(x + 5.0, y + 5.0, 0.9),
        Keypoint::new(x - 5.0, y + 5.0, 0.9),
    ])
}

/// Marker whose bbox top sits 85 px above its keypoint centre.
fn marker() -> DetectionRecord {
    DetectionRecord::new("marker", [100.0, 40.0, 140.0, 200.0], 0.9).with_keypoints(vec![
        Keypoint::new(120.0, 120.0, 0.9),
        Keypoint::new(120.0, 130.0, 0.9),
    ])
}

fn ungated_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    for engine in &mut config.engines {
        engine.movement.enable_filter(FilterKind::MovementDetection, false);
    }
    config
}

#[derive(Default)]
struct RecordingSink(Mutex<Vec<DistanceSample>>);

impl DistanceSink for RecordingSink {
    fn accept(&self, sample: DistanceSample) {
        self.0.lock().unwrap().push(sample);
    }
}

#[test]
fn test_payload_per_paired_cycle() {
    let (tx, rx) = crossbeam_channel::unbounded();
    let mut pipeline = MeasurementPipeline::new(ungated_config(), tx).unwrap();

    let mut paired = 0;
    for i in 0..30 {
        let mut frame = vec![reference_frame(), moving_part_at(405.0, 150.0)];
        if i % 3 != 2 {
            frame.push(marker());
            paired += 1;
        }
        let distances = pipeline.process_frame(&frame);
        assert!(distances.contains_key("buttonX"));
    }

    let payloads: Vec<_> = rx.try_iter().collect();
    assert_eq!(payloads.len(), paired);
    assert_eq!(paired, 20);

    for payload in &payloads {
        assert_relative_eq!(payload.get("buttonX").unwrap(), 10.0, epsilon = 1e-6);
        assert_relative_eq!(payload.get("markerZ").unwrap(), 8.5, epsilon = 1e-6);
        assert_relative_eq!(payload.get("marker").unwrap(), 8.5 * 9.1, epsilon = 1e-6);
    }

    let diagnostics = pipeline.diagnostics();
    assert_eq!(diagnostics.frames, 30);
    assert_eq!(diagnostics.payloads_emitted, 20);
    assert_eq!(diagnostics.payloads_rejected, 0);
    assert_eq!(diagnostics.pending_fields, vec!["buttonX".to_string()]);
}

#[test]
fn test_receding_target_produces_monotonic_samples() {
    let clock = ManualClock::new();
    let mut config = EngineConfig::frame_to_target();
    config.stabilizer.kind = StabilizerKind::PassThrough;
    let sink = Arc::new(RecordingSink::default());
    let mut engine = DistanceEngine::with_clock(config, Arc::new(clock.clone())).with_sink(sink.clone());

    // 10 px (1 unit) further from corner D every frame.
    for i in 0..20 {
        let frame = vec![reference_frame(), moving_part_at(405.0 - 10.0 * i as f64, 150.0)];
        engine.compute(&frame);
        clock.advance(Duration::from_millis(600));
    }

    let samples = sink.0.lock().unwrap();
    assert!(samples.len() >= 5, "only {} samples accepted", samples.len());
    for pair in samples.windows(2) {
        assert!(pair[1].distance >= pair[0].distance);
    }
    assert!(samples.last().unwrap().distance > samples[0].distance);
    assert!(samples.iter().all(|s| s.distance <= 30.0));
}

#[test]
fn test_static_scene_is_suppressed() {
    let clock = ManualClock::new();
    let (tx, rx) = crossbeam_channel::unbounded();
    let mut pipeline = MeasurementPipeline::with_clock(PipelineConfig::default(), tx, Arc::new(clock.clone())).unwrap();

    for _ in 0..30 {
        pipeline.process_frame(&[reference_frame(), moving_part_at(405.0, 150.0), marker()]);
        clock.advance(Duration::from_millis(33));
    }

    // At most the very first pair can get through the gate.
    assert!(rx.try_iter().count() <= 1);
    let diagnostics = pipeline.diagnostics();
    let button = &diagnostics.engines[0];
    assert_eq!(button.measured, 30);
    assert!(button.gate.total_filtered >= 29);
}

#[test]
fn test_expired_field_is_not_paired() {
    let clock = ManualClock::new();
    let (tx, rx) = crossbeam_channel::unbounded();
    let mut pipeline = MeasurementPipeline::with_clock(ungated_config(), tx, Arc::new(clock.clone())).unwrap();

    pipeline.process_frame(&[reference_frame(), moving_part_at(405.0, 150.0)]);
    clock.advance(Duration::from_secs(3));
    pipeline.process_frame(&[reference_frame(), marker()]);
    assert!(rx.try_recv().is_err());

    clock.advance(Duration::from_millis(100));
    pipeline.process_frame(&[reference_frame(), moving_part_at(405.0, 150.0)]);
    let payload = rx.try_recv().unwrap();
    assert_relative_eq!(payload.get("markerZ").unwrap(), 8.5, epsilon = 1e-6);
    assert_eq!(pipeline.diagnostics().payloads_emitted, 1);
}

#[test]
fn test_frames_flow_through_worker() {
    let publisher = TelemetryPublisher::new(ConnectionConfig::default(), Arc::new(LogTransport::new()));
    publisher.start().unwrap();

    let (tx, rx) = crossbeam_channel::unbounded();
    let worker = TelemetryWorker::spawn(publisher.clone(), rx).unwrap();
    let mut pipeline = MeasurementPipeline::new(ungated_config(), tx).unwrap();

    for _ in 0..10 {
        pipeline.process_frame(&[reference_frame(), moving_part_at(405.0, 150.0), marker()]);
    }
    drop(pipeline);

    let stats = worker.finish();
    assert_eq!(stats.received, 10);
    assert_eq!(stats.published, 10);
    publisher.shutdown();
}

#[test]
fn test_marker_without_reference_uses_initial_scale() {
    let (tx, rx) = crossbeam_channel::unbounded();
    let mut pipeline = MeasurementPipeline::new(ungated_config(), tx).unwrap();

    let distances = pipeline.process_frame(&[marker()]);

    assert_relative_eq!(distances["markerZ"], 8.5, epsilon = 1e-6);
    assert!(!distances.contains_key("buttonX"));
    assert!(rx.try_recv().is_err());
    assert!(!pipeline.engine("markerZ").unwrap().calibrator().is_converged());
}
