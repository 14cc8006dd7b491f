//! Pipeline benchmarks using Criterion.
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use keypoint_gauge::{
    DetectionRecord, DistanceEngine, EngineConfig, GeometryRectifier, Keypoint, KeypointSet, KeypointStabilizer,
    MeasurementPipeline, MovementConfig, MovementGate, PipelineConfig,
};

fn reference_frame(skew: f64) -> DetectionRecord {
    DetectionRecord::new("reference-frame", [295.0, 150.0, 505.0, 450.0], 0.95).with_keypoints(vec![
        Keypoint::new(295.0, 150.0, 0.9),
        Keypoint::new(295.0, 450.0, 0.9),
        Keypoint::new(505.0, 450.0, 0.9),
        Keypoint::new(505.0 + skew, 150.0 - 2.0 * skew, 0.9),
    ])
}

fn frame(i: usize) -> Vec<DetectionRecord> {
    let x = 405.0 - (i % 50) as f64;
    vec![
        reference_frame(0.0),
        DetectionRecord::new("moving-part", [x - 5.0, 145.0, x + 5.0, 155.0], 0.9).with_keypoints(vec![
            Keypoint::new(x - 5.0, 145.0, 0.9),
            Keypoint::new(x + 5.0, 145.0, 0.9),
            Keypoint::new(x + 5.0, 155.0, 0.9),
            Keypoint::new(x - 5.0, 155.0, 0.9),
        ]),
        DetectionRecord::new("marker", [100.0, 40.0, 140.0, 200.0], 0.9)
            .with_keypoints(vec![Keypoint::new(120.0, 120.0, 0.9), Keypoint::new(120.0, 130.0, 0.9)]),
    ]
}

fn benchmark_stabilizer_16_points(c: &mut Criterion) {
    let mut stabilizer = KeypointStabilizer::default();
    let ids: Vec<String> = (0..16).map(|i| format!("kp_{}", i)).collect();
    let mut t = 0.0;

    c.bench_function("stabilizer_16_points", |b| {
        b.iter(|| {
            t += 1.0;
            for (i, id) in ids.iter().enumerate() {
                black_box(stabilizer.stabilize_point(id, (i as f64 * 10.0 + t, 50.0)));
            }
        })
    });
}

fn benchmark_rectify_distorted_frame(c: &mut Criterion) {
    let rectifier = GeometryRectifier::default();
    let corners = reference_frame(30.0).keypoint_set().expect("corners");

    c.bench_function("rectify_distorted_frame", |b| {
        b.iter(|| black_box(rectifier.rectify(black_box(&corners))))
    });
}

fn benchmark_validate_frame(c: &mut Criterion) {
    let rectifier = GeometryRectifier::default();
    let corners: KeypointSet = reference_frame(0.0).keypoint_set().expect("corners");

    c.bench_function("validate_frame", |b| b.iter(|| black_box(rectifier.validate(black_box(&corners)))));
}

fn benchmark_gate_evaluate(c: &mut Criterion) {
    let mut gate = MovementGate::new(MovementConfig::default());
    let mut d = 10.0;

    c.bench_function("gate_evaluate", |b| {
        b.iter(|| {
            d += 0.01;
            gate.update(Some((d * 10.0, 150.0)), Some((505.0, 150.0)), Some(d));
            black_box(gate.should_send(d))
        })
    });
}

fn benchmark_engine_compute(c: &mut Criterion) {
    let mut engine = DistanceEngine::new(EngineConfig::frame_to_target());
    let frames: Vec<_> = (0..50).map(frame).collect();
    let mut i = 0;

    c.bench_function("engine_compute", |b| {
        b.iter(|| {
            i = (i + 1) % frames.len();
            black_box(engine.compute(black_box(&frames[i])))
        })
    });
}

fn benchmark_pipeline_frame(c: &mut Criterion) {
    let (tx, rx) = crossbeam_channel::unbounded();
    let mut pipeline = MeasurementPipeline::new(PipelineConfig::default(), tx).expect("valid pipeline");
    let frames: Vec<_> = (0..50).map(frame).collect();
    let mut i = 0;

    c.bench_function("pipeline_frame", |b| {
        b.iter(|| {
            i = (i + 1) % frames.len();
            let distances = pipeline.process_frame(black_box(&frames[i]));
            while rx.try_recv().is_ok() {}
            black_box(distances)
        })
    });
}

criterion_group!(
    benches,
    benchmark_stabilizer_16_points,
    benchmark_rectify_distorted_frame,
    benchmark_validate_frame,
    benchmark_gate_evaluate,
    benchmark_engine_compute,
    benchmark_pipeline_frame,
);

criterion_main!(benches);
