#![allow(clippy::unwrap_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

use lumen_pipeline::stages::encode_params;
use lumen_pipeline::stages::exposure::ExposureParams;
use lumen_pipeline::{
    AbortReason, BaseImage, Develop, EmulatedDevice, FaultPlan, HistoryItem, LiveSample,
    PickerRequest, PipeChange, PipePurpose, Pipeline, PipelineConfig, ProcessContext,
    ProcessError, Roi, SampleRegion, Stage, StageCapabilities, StageDescriptor, StageError,
    StageOutcome, StageRegistry,
};

fn config() -> PipelineConfig {
    PipelineConfig {
        line_width: 8,
        line_height: 8,
        ..PipelineConfig::default()
    }
}

fn develop(registry: StageRegistry, modules: &[&str]) -> Develop {
    Develop::new(
        Arc::new(registry),
        modules.iter().map(|m| (*m).to_owned()).collect(),
    )
}

fn builtin(modules: &[&str]) -> Develop {
    develop(StageRegistry::with_builtin_stages(), modules)
}

fn pipeline(purpose: PipePurpose, dev: &Develop) -> Pipeline {
    let pipe = Pipeline::new(purpose, config()).unwrap();
    pipe.create_nodes(dev);
    pipe.synch_all(dev);
    pipe
}

fn uniform(id: u64, width: u32, height: u32, value: f32) -> BaseImage {
    let pixels =
        image::Rgba32FImage::from_pixel(width, height, image::Rgba([value, value, value, 1.0]));
    BaseImage::new(id, pixels, 1.0)
}

#[allow(clippy::cast_precision_loss)]
fn gradient(id: u64, width: u32, height: u32) -> BaseImage {
    let pixels = image::Rgba32FImage::from_fn(width, height, |x, y| {
        let v = (x + y * width) as f32 / (width * height) as f32;
        image::Rgba([v, 1.0 - v, v * 0.5, 1.0])
    });
    BaseImage::new(id, pixels, 1.0)
}

fn exposure(ev: f32) -> HistoryItem {
    HistoryItem::new("exposure", encode_params(&ExposureParams { ev, black: 0.0 }))
}

fn assert_close(a: &[f32], b: &[f32]) {
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b) {
        assert!((x - y).abs() < 1e-5, "{x} != {y}");
    }
}

#[test]
fn gray_image_through_crop_and_exposure() {
    let dev = builtin(&["crop", "exposure"]);
    dev.push(HistoryItem::new("crop", b"{}".to_vec()));
    dev.push(exposure(1.0));
    let pipe = pipeline(PipePurpose::Export, &dev);
    let gray = image::RgbaImage::from_pixel(4, 4, image::Rgba([128, 128, 128, 255]));
    pipe.set_input(BaseImage::from_rgba8(1, &gray));

    let roi = Roi::new(0, 0, 4, 4, 1.0);
    pipe.process(&dev, &ProcessContext::headless(), roi).unwrap();
    let frame = pipe.backbuffer().unwrap();
    assert_eq!((frame.width(), frame.height()), (4, 4));
    assert!(frame.to_rgba8().pixels().all(|p| p.0 == [255, 255, 255, 255]));

    let misses = pipe.cache_stats().misses;
    pipe.process(&dev, &ProcessContext::headless(), roi).unwrap();
    assert_eq!(pipe.cache_stats().misses, misses);
    assert_eq!(pipe.last_diagnostics().unwrap().cache_hits(), 1);
    assert_eq!(pipe.backbuffer().unwrap().hash(), frame.hash());
}

static COUNTED_RUNS: AtomicUsize = AtomicUsize::new(0);

/// Copies its input and counts how often it ran.
#[derive(Default)]
struct Counted;

impl Stage for Counted {
    fn op(&self) -> &'static str {
        "counted"
    }

    fn capabilities(&self) -> StageCapabilities {
        StageCapabilities {
            default_enabled: true,
            ..StageCapabilities::default()
        }
    }

    fn commit_params(&mut self, _params: &[u8]) -> Result<(), StageError> {
        Ok(())
    }

    fn process(&self, input: &[f32], output: &mut [f32], _roi_in: &Roi, _roi_out: &Roi) {
        COUNTED_RUNS.fetch_add(1, Ordering::SeqCst);
        output.copy_from_slice(&input[..output.len()]);
    }
}

#[test]
fn changing_a_late_stage_reuses_earlier_output() {
    let mut registry = StageRegistry::with_builtin_stages();
    registry.register(StageDescriptor::of::<Counted>("counted"));
    let dev = develop(registry, &["counted", "exposure"]);
    let pipe = pipeline(PipePurpose::Full, &dev);
    pipe.set_input(uniform(2, 4, 4, 0.25));
    let roi = Roi::new(0, 0, 4, 4, 1.0);

    pipe.process(&dev, &ProcessContext::headless(), roi).unwrap();
    assert_eq!(COUNTED_RUNS.load(Ordering::SeqCst), 1);
    let before = pipe.backbuffer().unwrap();

    dev.push(exposure(1.0));
    pipe.request_change(PipeChange::TOP_CHANGED);
    pipe.change(&dev);
    pipe.process(&dev, &ProcessContext::headless(), roi).unwrap();

    assert_eq!(COUNTED_RUNS.load(Ordering::SeqCst), 1);
    let after = pipe.backbuffer().unwrap();
    assert_ne!(after.hash(), before.hash());
    assert!((after.pixels()[0] - 0.5).abs() < 1e-6);
    let diag = pipe.last_diagnostics().unwrap();
    assert_eq!(diag.stages[0].outcome, StageOutcome::CacheHit);
    assert_eq!(diag.stages[0].op, "counted");
}

#[test]
fn disabled_stage_is_a_pass_through() {
    let with = builtin(&["exposure", "gamma"]);
    with.push(exposure(2.0).disabled());
    let without = builtin(&["gamma"]);

    let a = pipeline(PipePurpose::Export, &with);
    let b = pipeline(PipePurpose::Export, &without);
    a.set_input(gradient(3, 6, 5));
    b.set_input(gradient(3, 6, 5));
    let roi = Roi::new(1, 1, 4, 3, 1.0);
    a.process(&with, &ProcessContext::headless(), roi).unwrap();
    b.process(&without, &ProcessContext::headless(), roi).unwrap();
    assert_close(a.backbuffer().unwrap().pixels(), b.backbuffer().unwrap().pixels());
}

fn blur_chain() -> Develop {
    let dev = builtin(&["exposure", "lowpass", "gamma"]);
    dev.push(exposure(0.5));
    dev.push(HistoryItem::new("lowpass", br#"{"radius": 1}"#.to_vec()));
    dev
}

fn host_reference(dev: &Develop, roi: Roi) -> Vec<f32> {
    let pipe = pipeline(PipePurpose::Export, dev);
    pipe.set_input(gradient(4, 8, 8));
    pipe.process(dev, &ProcessContext::headless(), roi).unwrap();
    pipe.backbuffer().unwrap().pixels().to_vec()
}

#[test]
fn accelerator_matches_host() {
    let dev = blur_chain();
    let roi = Roi::new(0, 0, 8, 8, 1.0);
    let expected = host_reference(&dev, roi);

    let pipe = pipeline(PipePurpose::Export, &dev)
        .with_accelerator(Arc::new(EmulatedDevice::new(1 << 20)));
    pipe.set_input(gradient(4, 8, 8));
    pipe.process(&dev, &ProcessContext::headless(), roi).unwrap();
    assert_close(pipe.backbuffer().unwrap().pixels(), &expected);

    let diag = pipe.last_diagnostics().unwrap();
    assert_eq!(diag.accelerator.as_deref(), Some("emulated"));
    assert_eq!(diag.count(StageOutcome::Device), 2);
    assert_eq!(diag.restarts, 0);
}

#[test]
fn preview_never_uses_the_accelerator() {
    let dev = blur_chain();
    let device = Arc::new(EmulatedDevice::new(1 << 20));
    let pipe = pipeline(PipePurpose::Preview, &dev).with_accelerator(device.clone());
    pipe.set_input(gradient(4, 8, 8));
    pipe.process(&dev, &ProcessContext::headless(), Roi::new(0, 0, 8, 8, 1.0))
        .unwrap();
    assert_eq!(device.counters().uploads, 0);
    assert!(pipe.last_diagnostics().unwrap().accelerator.is_none());
}

#[test]
fn failed_copy_back_restarts_on_host() {
    let dev = blur_chain();
    let roi = Roi::new(0, 0, 8, 8, 1.0);
    let expected = host_reference(&dev, roi);

    let device = Arc::new(EmulatedDevice::with_faults(
        1 << 20,
        FaultPlan {
            download: Some(1),
            ..FaultPlan::default()
        },
    ));
    let pipe = pipeline(PipePurpose::Export, &dev).with_accelerator(device.clone());
    pipe.set_input(gradient(4, 8, 8));
    pipe.process(&dev, &ProcessContext::headless(), roi).unwrap();

    assert_close(pipe.backbuffer().unwrap().pixels(), &expected);
    let diag = pipe.last_diagnostics().unwrap();
    assert_eq!(diag.restarts, 1);
    assert!(diag.accelerator.is_none());
    assert_eq!(device.counters().live_buffers, 0);
}

#[test]
fn failed_queue_flush_restarts_on_host() {
    let dev = blur_chain();
    let roi = Roi::new(0, 0, 8, 8, 1.0);
    let expected = host_reference(&dev, roi);

    let device = EmulatedDevice::with_faults(
        1 << 20,
        FaultPlan {
            events_flush: Some(1),
            ..FaultPlan::default()
        },
    );
    let pipe = pipeline(PipePurpose::Export, &dev).with_accelerator(Arc::new(device));
    pipe.set_input(gradient(4, 8, 8));
    pipe.process(&dev, &ProcessContext::headless(), roi).unwrap();
    assert_close(pipe.backbuffer().unwrap().pixels(), &expected);
    assert_eq!(pipe.last_diagnostics().unwrap().restarts, 1);
}

#[test]
fn kernel_fault_falls_back_without_restart() {
    let dev = blur_chain();
    let roi = Roi::new(0, 0, 8, 8, 1.0);
    let expected = host_reference(&dev, roi);

    let device = EmulatedDevice::with_faults(
        1 << 20,
        FaultPlan {
            kernel: Some(1),
            ..FaultPlan::default()
        },
    );
    let pipe = pipeline(PipePurpose::Export, &dev).with_accelerator(Arc::new(device));
    pipe.set_input(gradient(4, 8, 8));
    pipe.process(&dev, &ProcessContext::headless(), roi).unwrap();
    assert_close(pipe.backbuffer().unwrap().pixels(), &expected);
    let diag = pipe.last_diagnostics().unwrap();
    assert_eq!(diag.restarts, 0);
    assert_eq!(diag.count(StageOutcome::DeviceFallback), 1);
}

#[test]
fn topology_changes_abort_in_flight_work() {
    let dev = Arc::new(blur_chain());
    let pipe = Arc::new(pipeline(PipePurpose::Full, &dev));
    pipe.set_input(gradient(5, 8, 8));
    let barrier = Arc::new(Barrier::new(2));

    let worker = {
        let (pipe, dev, barrier) = (pipe.clone(), dev.clone(), barrier.clone());
        std::thread::spawn(move || {
            barrier.wait();
            (0..50)
                .map(|_| pipe.process(&dev, &ProcessContext::headless(), Roi::new(0, 0, 8, 8, 1.0)))
                .collect::<Vec<_>>()
        })
    };

    barrier.wait();
    for i in 0..50 {
        let modules: &[&str] = if i % 2 == 0 {
            &["exposure", "gamma"]
        } else {
            &["exposure", "lowpass", "gamma"]
        };
        dev.set_modules(modules.iter().map(|m| (*m).to_owned()).collect());
        pipe.request_change(PipeChange::REMOVE);
        pipe.change(&dev);
    }

    for result in worker.join().unwrap() {
        assert!(
            matches!(
                result,
                Ok(())
                    | Err(ProcessError::Aborted(
                        AbortReason::StageListChanged | AbortReason::Shutdown
                    ))
            ),
            "unexpected result: {result:?}"
        );
    }
}

#[test]
fn shutdown_aborts_and_clears_the_frame() {
    let dev = builtin(&["gamma"]);
    let pipe = pipeline(PipePurpose::Full, &dev);
    pipe.set_input(uniform(6, 4, 4, 0.5));
    pipe.process(&dev, &ProcessContext::headless(), Roi::new(0, 0, 4, 4, 1.0))
        .unwrap();
    assert!(pipe.backbuffer().is_some());

    pipe.shutdown();
    let err = pipe
        .process(&dev, &ProcessContext::headless(), Roi::new(0, 0, 4, 4, 1.0))
        .unwrap_err();
    assert_eq!(err, ProcessError::Aborted(AbortReason::Shutdown));
    assert!(pipe.backbuffer().is_none());
}

#[test]
fn failed_run_keeps_the_previous_frame() {
    let dev = builtin(&["exposure", "gamma"]);
    let pipe = pipeline(PipePurpose::Full, &dev);
    pipe.set_input(uniform(7, 4, 4, 0.25));
    let roi = Roi::new(0, 0, 4, 4, 1.0);
    pipe.process(&dev, &ProcessContext::headless(), roi).unwrap();
    let published = pipe.backbuffer().unwrap();

    dev.push(exposure(1.0));
    pipe.request_change(PipeChange::TOP_CHANGED);
    pipe.change(&dev);
    dev.session().set_leaving(true);
    let err = pipe
        .process(&dev, &ProcessContext::headless(), roi)
        .unwrap_err();
    assert_eq!(err, ProcessError::Aborted(AbortReason::SessionLeaving));
    assert_eq!(pipe.backbuffer().unwrap(), published);

    dev.session().set_leaving(false);
    let ctx = ProcessContext::headless();
    ctx.cancel.cancel();
    let err = pipe.process(&dev, &ctx, roi).unwrap_err();
    assert_eq!(err, ProcessError::Aborted(AbortReason::Cancelled));
    assert_eq!(pipe.backbuffer().unwrap(), published);
}

#[test]
fn preview_collects_statistics() {
    let dev = builtin(&["exposure", "colorout", "gamma"]);
    let pipe = pipeline(PipePurpose::Preview, &dev);
    pipe.set_input(gradient(8, 6, 6));

    let ctx = ProcessContext {
        focused: Some(1),
        picker: Some(PickerRequest {
            stage: 1,
            region: SampleRegion::Box([0.0, 0.0, 0.5, 0.5]),
        }),
        live_samples: vec![
            LiveSample {
                region: SampleRegion::Point([0.5, 0.5]),
                locked: false,
            },
            LiveSample {
                region: SampleRegion::Point([0.1, 0.1]),
                locked: true,
            },
        ],
        ..ProcessContext::interactive()
    };
    pipe.process(&dev, &ctx, Roi::new(0, 0, 6, 6, 1.0)).unwrap();

    let stats = pipe.statistics();
    assert!(!stats.histogram.is_empty());
    let stage_pick = stats.stage_pick.unwrap();
    assert_eq!(stage_pick.stage, 1);
    let primary = stats.primary_pick.unwrap();
    assert!(primary.lab.is_some());
    assert!(primary.rgb.max[0] >= primary.rgb.min[0]);
    assert_eq!(stats.live_samples.len(), 2);
    assert!(stats.live_samples[0].is_some());
    assert!(stats.live_samples[1].is_none());
}

#[test]
fn headless_runs_collect_nothing() {
    let dev = builtin(&["colorout", "gamma"]);
    let pipe = pipeline(PipePurpose::Preview, &dev);
    pipe.set_input(gradient(9, 4, 4));
    pipe.process(&dev, &ProcessContext::headless(), Roi::new(0, 0, 4, 4, 1.0))
        .unwrap();
    let stats = pipe.statistics();
    assert!(stats.histogram.is_empty());
    assert!(stats.primary_pick.is_none());
}

#[test]
fn no_gamma_skips_the_clamp_for_one_run() {
    let dev = builtin(&["gamma"]);
    let pipe = pipeline(PipePurpose::Export, &dev);
    pipe.set_input(uniform(10, 2, 2, 1.5));
    let roi = Roi::new(0, 0, 2, 2, 1.0);

    pipe.process_no_gamma(&dev, &ProcessContext::headless(), roi).unwrap();
    assert!((pipe.backbuffer().unwrap().pixels()[0] - 1.5).abs() < 1e-6);

    pipe.process(&dev, &ProcessContext::headless(), roi).unwrap();
    assert!((pipe.backbuffer().unwrap().pixels()[0] - 1.0).abs() < 1e-6);
}

#[test]
fn scaled_region_is_imported_from_the_base() {
    let dev = builtin(&["gamma"]);
    let pipe = pipeline(PipePurpose::Full, &dev);
    pipe.set_input(uniform(11, 8, 8, 0.25));
    pipe.process(&dev, &ProcessContext::headless(), Roi::new(0, 0, 4, 4, 0.5))
        .unwrap();
    let frame = pipe.backbuffer().unwrap();
    assert_eq!((frame.width(), frame.height()), (4, 4));
    assert!(frame.pixels().iter().step_by(4).all(|v| (v - 0.25).abs() < 1e-3));
    let diag = pipe.last_diagnostics().unwrap();
    assert_eq!(diag.count(StageOutcome::Imported), 1);
}

#[test]
fn crop_shifts_the_requested_region() {
    let dev = builtin(&["crop", "gamma"]);
    dev.push(HistoryItem::new(
        "crop",
        br#"{"cx": 0.5, "cy": 0.0, "cw": 1.0, "ch": 1.0}"#.to_vec(),
    ));
    let pipe = pipeline(PipePurpose::Full, &dev);
    let base = gradient(12, 8, 4);
    let expected: Vec<f32> = (4..8).map(|x| base.image().get_pixel(x, 0).0[0]).collect();
    pipe.set_input(base);
    assert_eq!(pipe.processed_dimensions().width, 4);

    pipe.process(&dev, &ProcessContext::headless(), Roi::new(0, 0, 4, 1, 1.0))
        .unwrap();
    let frame = pipe.backbuffer().unwrap();
    let got: Vec<f32> = frame.pixels().iter().step_by(4).copied().collect();
    assert_close(&got, &expected);
}

#[test]
fn focused_crop_shows_the_whole_frame() {
    let dev = builtin(&["crop", "exposure"]);
    dev.push(HistoryItem::new(
        "crop",
        br#"{"cx": 0.0, "cy": 0.0, "cw": 0.5, "ch": 0.5}"#.to_vec(),
    ));
    dev.push(exposure(1.0));
    let pipe = pipeline(PipePurpose::Full, &dev);
    let base = gradient(13, 8, 8);
    let full: Vec<f32> = base.image().pixels().map(|p| p.0[0] * 2.0).collect();
    let cropped: Vec<f32> = base
        .image()
        .enumerate_pixels()
        .filter(|(x, y, _)| *x < 4 && *y < 4)
        .map(|(_, _, p)| p.0[0] * 2.0)
        .collect();
    pipe.set_input(base);
    assert_eq!(pipe.processed_dimensions().width, 4);

    let focused = ProcessContext {
        focused: Some(0),
        ..ProcessContext::headless()
    };
    pipe.process(&dev, &focused, Roi::new(0, 0, 8, 8, 1.0)).unwrap();
    assert_eq!(pipe.processed_dimensions().width, 8);
    let frame = pipe.backbuffer().unwrap();
    let got: Vec<f32> = frame.pixels().iter().step_by(4).copied().collect();
    assert_close(&got, &full);

    pipe.process(&dev, &ProcessContext::headless(), Roi::new(0, 0, 4, 4, 1.0))
        .unwrap();
    assert_eq!(pipe.processed_dimensions().width, 4);
    let frame = pipe.backbuffer().unwrap();
    let got: Vec<f32> = frame.pixels().iter().step_by(4).copied().collect();
    assert_close(&got, &cropped);
}

#[test]
fn region_past_the_edge_is_padded_black() {
    let dev = builtin(&["exposure"]);
    dev.push(exposure(1.0));
    let pipe = pipeline(PipePurpose::Full, &dev);
    let base = gradient(14, 8, 8);
    let expected: Vec<f32> = (0..8)
        .flat_map(|y| (4..12).map(move |x| (x, y)))
        .map(|(x, y)| {
            if x < 8 {
                base.image().get_pixel(x, y).0[0] * 2.0
            } else {
                0.0
            }
        })
        .collect();
    pipe.set_input(base);

    // Dirty the cache so stale pixels would show.
    pipe.process(&dev, &ProcessContext::headless(), Roi::new(0, 0, 8, 8, 1.0))
        .unwrap();
    pipe.process(&dev, &ProcessContext::headless(), Roi::new(4, 0, 8, 8, 1.0))
        .unwrap();
    let frame = pipe.backbuffer().unwrap();
    assert_eq!((frame.width(), frame.height()), (8, 8));
    let got: Vec<f32> = frame.pixels().iter().step_by(4).copied().collect();
    assert_close(&got, &expected);
}

#[test]
fn session_flags_abort_uncached_work_only() {
    let dev = builtin(&["exposure", "gamma"]);
    dev.push(exposure(1.0));
    let pipe = pipeline(PipePurpose::Full, &dev);
    pipe.set_input(uniform(15, 4, 4, 0.25));
    let roi = Roi::new(0, 0, 4, 4, 1.0);
    pipe.process(&dev, &ProcessContext::headless(), roi).unwrap();
    let frame = pipe.backbuffer().unwrap();

    dev.session().set_image_reloading(true);
    pipe.process(&dev, &ProcessContext::headless(), roi).unwrap();
    assert_eq!(pipe.backbuffer().unwrap().hash(), frame.hash());

    let err = pipe
        .process(&dev, &ProcessContext::headless(), Roi::new(0, 0, 2, 2, 1.0))
        .unwrap_err();
    assert_eq!(err, ProcessError::Aborted(AbortReason::ImageSwapped));
    assert_eq!(pipe.backbuffer().unwrap().hash(), frame.hash());
}

#[test]
fn shutdown_racing_a_run_leaves_no_frame() {
    for round in 0..20 {
        let dev = Arc::new(builtin(&["exposure", "lowpass", "gamma"]));
        dev.push(exposure(0.5));
        let pipe = Arc::new(pipeline(PipePurpose::Full, &dev));
        pipe.set_input(gradient(100 + round, 8, 8));
        let start = Arc::new(Barrier::new(2));

        let worker = {
            let (dev, pipe, start) = (Arc::clone(&dev), Arc::clone(&pipe), Arc::clone(&start));
            std::thread::spawn(move || {
                start.wait();
                let _ = pipe.process(&dev, &ProcessContext::headless(), Roi::new(0, 0, 8, 8, 1.0));
            })
        };
        start.wait();
        pipe.shutdown();
        worker.join().unwrap();
        assert!(pipe.backbuffer().is_none(), "round {round}");
    }
}
