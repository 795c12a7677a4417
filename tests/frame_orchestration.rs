#![cfg(unix)]

mod common;

use progressive_pathtracer::render_system::{
    frame::Frame,
    orchestrator::{BoxedDenoiser, FrameOrchestrator, FrameOutcome, InputEvent, PresentOutcome},
};

use common::{
    Event, MockBackend, ScriptedAcquire, camera_at, config, event_log, expected_average,
    mock_denoiser, orchestrator, take_events,
};

fn uniforms(events: &[Event]) -> Vec<(u32, bool)> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::WriteUniforms {
                iteration, changed, ..
            } => Some((*iteration, *changed)),
            _ => None,
        })
        .collect()
}

fn assert_average(orchestrator: &FrameOrchestrator<MockBackend>, frames: std::ops::Range<u32>) {
    let texels = orchestrator.accumulation().buffer().texels.borrow();
    for (pixel, texel) in texels.iter().enumerate() {
        let expected = expected_average(pixel, frames.clone());
        for i in 0..4 {
            assert!(
                (texel[i] - expected[i]).abs() < 1e-4,
                "pixel {pixel} channel {i}: {} != {}",
                texel[i],
                expected[i]
            );
        }
    }
}

#[test]
fn static_scene_converges_to_the_running_average() {
    let (mut orchestrator, _log) = orchestrator([8, 4], false);
    let camera = camera_at(0.0);

    for n in 1..=100 {
        assert_eq!(
            orchestrator.render_frame(&camera).unwrap(),
            FrameOutcome::Presented { iteration_count: n }
        );
    }

    assert_eq!(
        *orchestrator.frame(),
        Frame {
            index: 100,
            iteration_count: 100,
            changed: false,
        }
    );
    assert_average(&orchestrator, 0..100);
}

#[test]
fn view_change_at_frame_fifty_restarts_the_count() {
    let (mut orchestrator, log) = orchestrator([8, 4], false);
    let camera = camera_at(0.0);

    for n in 0..100 {
        if n == 50 {
            orchestrator.on_view_changed();
        }
        orchestrator.render_frame(&camera).unwrap();
    }

    let seen = uniforms(&log.borrow());
    assert_eq!(seen.len(), 100);
    assert_eq!(seen[49], (49, false));
    for (k, (iteration, changed)) in seen[50..].iter().enumerate() {
        assert_eq!(*iteration, k as u32);
        assert_eq!(*changed, k == 0);
    }
    assert_eq!(orchestrator.frame().iteration_count, 50);
    assert!(!orchestrator.frame().changed);
    assert_average(&orchestrator, 50..100);
}

#[test]
fn moving_the_camera_discards_the_samples() {
    let (mut orchestrator, log) = orchestrator([4, 4], false);
    for _ in 0..3 {
        orchestrator.render_frame(&camera_at(0.0)).unwrap();
    }
    take_events(&log);

    assert_eq!(
        orchestrator.render_frame(&camera_at(1.0)).unwrap(),
        FrameOutcome::Presented { iteration_count: 1 }
    );
    assert_eq!(uniforms(&take_events(&log)), [(0, true)]);
    assert_average(&orchestrator, 3..4);
}

#[test]
fn ray_trace_waits_for_the_previous_composite() {
    let (mut orchestrator, log) = orchestrator([8, 8], true);
    let camera = camera_at(0.0);

    for n in 0..12 {
        if n == 4 {
            orchestrator.backend_mut().acquire_script.push_back(ScriptedAcquire::OutOfDate);
        }
        if n == 8 {
            orchestrator.on_resize([6, 6]).unwrap();
        }
        orchestrator.render_frame(&camera).unwrap();
    }

    let mut composite_outstanding = false;
    let mut ray_traces = 0;
    for event in log.borrow().iter() {
        match event {
            Event::Composite { .. } => composite_outstanding = true,
            Event::WaitForPreviousFrame | Event::Drain => composite_outstanding = false,
            Event::RayTrace { .. } => {
                assert!(!composite_outstanding, "ray trace before the fence wait");
                ray_traces += 1;
            }
            _ => {}
        }
    }
    assert_eq!(ray_traces, 11);
}

#[test]
fn frame_stages_run_in_order() {
    let (mut orchestrator, log) = orchestrator([4, 4], true);
    take_events(&log);
    orchestrator.render_frame(&camera_at(0.0)).unwrap();

    let kinds: Vec<&'static str> = take_events(&log)
        .iter()
        .map(|e| match e {
            Event::Acquire => "acquire",
            Event::WaitForPreviousFrame => "wait",
            Event::WriteUniforms { .. } => "uniforms",
            Event::RayTrace { .. } => "ray trace",
            Event::Denoise { .. } => "denoise",
            Event::Composite { .. } => "composite",
            Event::Present => "present",
            _ => "other",
        })
        .collect();
    assert_eq!(
        kinds,
        ["acquire", "wait", "uniforms", "ray trace", "denoise", "composite", "present"]
    );
}

#[test]
fn denoiser_handoff_uses_consecutive_timeline_values() {
    let (mut orchestrator, log) = orchestrator([4, 4], true);
    let camera = camera_at(0.0);
    for _ in 0..20 {
        orchestrator.render_frame(&camera).unwrap();
    }

    let mut ray_traced = None;
    let mut denoised = 0;
    let mut handoffs = 0;
    for event in take_events(&log) {
        match event {
            Event::RayTrace { semaphore, value } => {
                assert_eq!(semaphore, 100);
                assert!(value > denoised);
                ray_traced = Some(value);
            }
            Event::Denoise {
                wait,
                signal,
                commands,
            } => {
                assert_eq!(Some(wait), ray_traced);
                assert_eq!(signal, wait + 1);
                assert_eq!(commands.len(), 1);
                denoised = signal;
                handoffs += 1;
            }
            Event::Composite {
                semaphore,
                wait,
                denoised: uses_denoised,
            } => {
                assert_eq!(semaphore, 101);
                assert_eq!(wait, denoised);
                assert!(uses_denoised);
            }
            _ => {}
        }
    }
    assert_eq!(handoffs, 20);
}

#[test]
fn without_denoiser_composite_waits_on_the_ray_trace() {
    let (mut orchestrator, log) = orchestrator([4, 4], false);
    take_events(&log);
    orchestrator.render_frame(&camera_at(0.0)).unwrap();

    let events = take_events(&log);
    let ray_trace = events
        .iter()
        .find_map(|e| match e {
            Event::RayTrace { semaphore, value } => Some((*semaphore, *value)),
            _ => None,
        })
        .unwrap();
    assert!(events.contains(&Event::Composite {
        semaphore: ray_trace.0,
        wait: ray_trace.1,
        denoised: false,
    }));
}

#[test]
fn disabled_denoising_drops_the_stage() {
    let log = event_log();
    let denoiser: BoxedDenoiser<MockBackend> = Box::new(mock_denoiser(&log));
    let mut orchestrator =
        FrameOrchestrator::setup(MockBackend::new(&log, [4, 4]), config(false), Some(denoiser))
            .unwrap();
    assert!(!orchestrator.denoising());

    orchestrator.render_frame(&camera_at(0.0)).unwrap();
    assert!(!log.borrow().iter().any(|e| matches!(e, Event::Denoise { .. })));
}

#[test]
fn resize_recreates_every_size_dependent_resource() {
    let (mut orchestrator, log) = orchestrator([16, 16], true);
    let camera = camera_at(0.0);
    for _ in 0..3 {
        orchestrator.render_frame(&camera).unwrap();
    }
    take_events(&log);

    orchestrator.on_resize([32, 8]).unwrap();
    let events = take_events(&log);
    assert_eq!(events.first(), Some(&Event::Drain));
    assert!(events.contains(&Event::RecreateTarget([32, 8])));
    assert!(events.contains(&Event::AllocateAccumulation([32, 8])));
    assert!(events.contains(&Event::PrepareKernel([32, 8])));
    assert_eq!(
        events.iter().filter(|e| matches!(e, Event::ImportMemory(_))).count(),
        5
    );
    assert_eq!(
        events.last(),
        Some(&Event::BindSizeDependent {
            accumulation: [32, 8],
            denoiser: Some([32, 8]),
        })
    );

    assert_eq!(orchestrator.accumulation().extent(), [32, 8]);
    assert_eq!(orchestrator.frame().iteration_count, 0);
    assert!(orchestrator.frame().changed);

    assert_eq!(
        orchestrator.render_frame(&camera).unwrap(),
        FrameOutcome::Presented { iteration_count: 1 }
    );
    assert_eq!(uniforms(&take_events(&log)), [(0, true)]);
}

#[test]
fn out_of_date_acquire_rebuilds_on_the_next_frame() {
    let (mut orchestrator, log) = orchestrator([16, 16], false);
    let camera = camera_at(0.0);
    orchestrator.render_frame(&camera).unwrap();
    orchestrator.render_frame(&camera).unwrap();

    orchestrator.backend_mut().acquire_script.push_back(ScriptedAcquire::OutOfDate);
    orchestrator.backend_mut().surface = [20, 10];
    take_events(&log);

    assert_eq!(orchestrator.render_frame(&camera).unwrap(), FrameOutcome::OutOfDate);
    assert_eq!(take_events(&log), [Event::Acquire]);

    assert_eq!(
        orchestrator.render_frame(&camera).unwrap(),
        FrameOutcome::Presented { iteration_count: 1 }
    );
    let events = take_events(&log);
    assert_eq!(events[..2], [Event::Drain, Event::RecreateTarget([20, 10])]);
    assert_eq!(orchestrator.accumulation().extent(), [20, 10]);
}

#[test]
fn suboptimal_present_still_counts_the_frame() {
    let (mut orchestrator, log) = orchestrator([16, 16], false);
    let camera = camera_at(0.0);
    orchestrator.render_frame(&camera).unwrap();

    orchestrator.backend_mut().present_script.push_back(PresentOutcome::Suboptimal);
    assert_eq!(
        orchestrator.render_frame(&camera).unwrap(),
        FrameOutcome::Presented { iteration_count: 2 }
    );
    take_events(&log);

    assert_eq!(
        orchestrator.render_frame(&camera).unwrap(),
        FrameOutcome::Presented { iteration_count: 1 }
    );
    assert!(take_events(&log).contains(&Event::RecreateTarget([16, 16])));
}

#[test]
fn out_of_date_present_does_not_count() {
    let (mut orchestrator, _log) = orchestrator([16, 16], false);
    let camera = camera_at(0.0);
    orchestrator.render_frame(&camera).unwrap();

    orchestrator.backend_mut().present_script.push_back(PresentOutcome::OutOfDate);
    assert_eq!(orchestrator.render_frame(&camera).unwrap(), FrameOutcome::OutOfDate);
    assert_eq!(orchestrator.frame().iteration_count, 1);
}

#[test]
fn minimized_window_skips_frames() {
    let (mut orchestrator, log) = orchestrator([16, 16], false);
    let camera = camera_at(0.0);
    orchestrator.render_frame(&camera).unwrap();

    orchestrator.backend_mut().surface = [0, 0];
    orchestrator.request_resize();
    take_events(&log);
    assert_eq!(orchestrator.render_frame(&camera).unwrap(), FrameOutcome::Skipped);
    assert_eq!(orchestrator.render_frame(&camera).unwrap(), FrameOutcome::Skipped);
    assert!(take_events(&log).is_empty());

    orchestrator.backend_mut().surface = [16, 16];
    assert_eq!(
        orchestrator.render_frame(&camera).unwrap(),
        FrameOutcome::Presented { iteration_count: 1 }
    );
}

#[test]
fn window_created_minimized_builds_resources_once_restored() {
    let (mut orchestrator, log) = orchestrator([0, 0], true);
    let events = take_events(&log);
    assert!(!events.iter().any(|e| matches!(e, Event::ImportMemory(_))));
    assert_eq!(
        events.last(),
        Some(&Event::BindSizeDependent {
            accumulation: [0, 0],
            denoiser: None,
        })
    );

    let camera = camera_at(0.0);
    assert_eq!(orchestrator.render_frame(&camera).unwrap(), FrameOutcome::Skipped);
    assert!(take_events(&log).is_empty());

    orchestrator.backend_mut().surface = [8, 6];
    assert_eq!(
        orchestrator.render_frame(&camera).unwrap(),
        FrameOutcome::Presented { iteration_count: 1 }
    );
    let events = take_events(&log);
    assert!(events.contains(&Event::PrepareKernel([8, 6])));
    assert!(events.contains(&Event::BindSizeDependent {
        accumulation: [8, 6],
        denoiser: Some([8, 6]),
    }));
    assert!(events.iter().any(|e| matches!(e, Event::Denoise { .. })));
    assert_eq!(orchestrator.accumulation().extent(), [8, 6]);
}

#[test]
fn exposure_keeps_samples_but_sun_changes_reset() {
    let (mut orchestrator, _log) = orchestrator([4, 4], false);
    let camera = camera_at(0.0);
    for _ in 0..3 {
        orchestrator.render_frame(&camera).unwrap();
    }

    assert!(orchestrator.on_input_event(InputEvent::Exposure(2.0)));
    assert!((orchestrator.exposure_adjustment() - 0.5).abs() < 1e-6);
    assert_eq!(
        orchestrator.render_frame(&camera).unwrap(),
        FrameOutcome::Presented { iteration_count: 4 }
    );

    assert!(orchestrator.on_input_event(InputEvent::SunAzimuth(1.0)));
    assert!(orchestrator.sun_direction().is_some());
    assert_eq!(
        orchestrator.render_frame(&camera).unwrap(),
        FrameOutcome::Presented { iteration_count: 1 }
    );

    assert!(orchestrator.on_input_event(InputEvent::ClearSunOverride));
    assert!(orchestrator.sun_direction().is_none());
    assert!(!orchestrator.on_input_event(InputEvent::ClearSunOverride));
    assert_eq!(
        orchestrator.render_frame(&camera).unwrap(),
        FrameOutcome::Presented { iteration_count: 1 }
    );
}

#[test]
fn sun_elevation_stays_above_the_horizon() {
    let (mut orchestrator, _log) = orchestrator([4, 4], false);
    for _ in 0..100 {
        orchestrator.on_input_event(InputEvent::SunElevation(-1.0));
    }
    let sun = orchestrator.sun_direction().unwrap();
    assert!(sun.y >= -1e-6);
}

#[test]
fn dropping_the_orchestrator_drains_the_device() {
    let (orchestrator, log) = orchestrator([4, 4], false);
    drop(orchestrator);
    assert_eq!(log.borrow().last(), Some(&Event::Drain));
}
