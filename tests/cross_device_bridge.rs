#![cfg(unix)]

mod common;

use std::{cell::Cell, rc::Rc};

use progressive_pathtracer::{
    config::DenoiseSettings,
    error::RenderError,
    render_system::{
        cross_device::{CrossDeviceBridge, CrossDeviceDenoiser, HandleKind},
        frame::Frame,
        orchestrator::DenoiseStage,
    },
};

use common::{
    CountingPlatform, Event, MockExporter, MockKernel, MockMemory, MockSecondary,
    SECONDARY_TIMEOUT, event_log, mock_bridge, mock_denoiser, stalled_denoiser, take_events,
};

#[test]
fn linked_semaphores_start_at_zero() {
    let log = event_log();
    let closed = Rc::new(Cell::new(0));
    let bridge = mock_bridge(&log, &closed);

    let semaphore = bridge.create_linked_semaphore("ray_traced").unwrap();
    assert_eq!(semaphore.counter(), 0);
    assert_eq!(semaphore.kind(), HandleKind::OpaqueFd);
    assert_eq!(semaphore.name(), "ray_traced");
    assert_eq!(semaphore.local().id, 100);
    assert_eq!(take_events(&log), [Event::ImportSemaphore]);
    assert_eq!(closed.get(), 0);
}

#[test]
fn buffers_are_shared_per_role_at_the_requested_size() {
    let log = event_log();
    let closed = Rc::new(Cell::new(0));
    let mut bridge = mock_bridge(&log, &closed);
    let denoised = bridge.create_linked_semaphore("denoised").unwrap();
    take_events(&log);

    let buffers = bridge.recreate_buffers([10, 4], &denoised).unwrap();
    assert_eq!(buffers.extent(), [10, 4]);
    assert!(buffers.extents().all(|e| e == [10, 4]));
    let secondary = buffers.secondary();
    assert_eq!(secondary.radiance, MockMemory { size: 640 });
    assert_eq!(secondary.flow, MockMemory { size: 320 });

    assert_eq!(
        take_events(&log),
        [
            Event::SecondaryDrain(0),
            Event::ImportMemory(640),
            Event::ImportMemory(640),
            Event::ImportMemory(640),
            Event::ImportMemory(320),
            Event::ImportMemory(640),
            Event::ShareBuffers([640, 640, 640, 320, 640]),
        ]
    );
}

#[test]
fn recreating_buffers_replaces_the_old_set() {
    let log = event_log();
    let closed = Rc::new(Cell::new(0));
    let mut bridge = mock_bridge(&log, &closed);
    let denoised = bridge.create_linked_semaphore("denoised").unwrap();

    bridge.recreate_buffers([10, 4], &denoised).unwrap();
    bridge.recreate_buffers([3, 3], &denoised).unwrap();
    let buffers = bridge.buffers().unwrap();
    assert_eq!(buffers.extent(), [3, 3]);
    assert_eq!(buffers.primary().output.extent, [3, 3]);
}

#[test]
fn rejected_import_closes_the_handle() {
    let log = event_log();
    let closed = Rc::new(Cell::new(0));
    let mut secondary = MockSecondary::new(&log);
    secondary.reject_memory = true;
    let mut bridge = CrossDeviceBridge::new(
        MockExporter::new(),
        secondary,
        Box::new(CountingPlatform {
            closed: closed.clone(),
        }),
    );

    let denoised = bridge.create_linked_semaphore("denoised").unwrap();

    let result = bridge.recreate_buffers([2, 2], &denoised);
    assert!(matches!(result, Err(RenderError::Import { .. })));
    // the first role fails, nothing else is attempted
    assert_eq!(closed.get(), 1);
    assert!(bridge.buffers().is_none());
}

#[test]
fn handoff_must_signal_the_next_value() {
    let log = event_log();
    let closed = Rc::new(Cell::new(0));
    let bridge = mock_bridge(&log, &closed);
    let mut input = bridge.create_linked_semaphore("input").unwrap();
    let mut output = bridge.create_linked_semaphore("output").unwrap();
    input.schedule_signal(1).unwrap();
    take_events(&log);

    let result = bridge.wait_then_signal(&input, 1, &mut output, 3, |_| Ok(()));
    assert!(matches!(
        result,
        Err(RenderError::TimelineHandoff {
            expected: 2,
            actual: 3
        })
    ));
    assert_eq!(output.counter(), 0);

    bridge
        .wait_then_signal(&input, 1, &mut output, 2, |commands| {
            commands.push("work".to_string());
            Ok(())
        })
        .unwrap();
    assert_eq!(output.counter(), 2);
    assert_eq!(
        take_events(&log),
        [Event::Denoise {
            wait: 1,
            signal: 2,
            commands: vec!["work".to_string()],
        }]
    );
}

#[test]
fn waiting_for_an_unscheduled_value_fails() {
    let log = event_log();
    let closed = Rc::new(Cell::new(0));
    let bridge = mock_bridge(&log, &closed);
    let input = bridge.create_linked_semaphore("input").unwrap();
    let mut output = bridge.create_linked_semaphore("output").unwrap();

    let result = bridge.wait_then_signal(&input, 5, &mut output, 6, |_| Ok(()));
    assert!(matches!(
        result,
        Err(RenderError::UnsignaledWait {
            semaphore: "input",
            value: 5,
            last: 0
        })
    ));
}

#[test]
fn denoiser_timelines_grow_every_frame() {
    let log = event_log();
    let mut denoiser = mock_denoiser(&log);
    denoiser.resize([4, 4]).unwrap();
    take_events(&log);

    let settings = DenoiseSettings::default();
    let mut frame = Frame::default();
    for n in 0..20u64 {
        let ray_traced = 2 * n + 1;
        denoiser
            .denoise(ray_traced, ray_traced + 1, &settings, &frame)
            .unwrap();
        frame.iteration_count += 1;
        frame.changed = false;
    }
    assert_eq!(denoiser.ray_traced().counter(), 39);
    assert_eq!(denoiser.denoised().counter(), 40);

    let handoffs: Vec<(u64, u64)> = take_events(&log)
        .into_iter()
        .filter_map(|e| match e {
            Event::Denoise { wait, signal, .. } => Some((wait, signal)),
            _ => None,
        })
        .collect();
    assert_eq!(handoffs.len(), 20);
    assert!(handoffs.windows(2).all(|w| w[1].0 > w[0].1));
    assert!(handoffs.iter().all(|(wait, signal)| *signal == wait + 1));
}

#[test]
fn replayed_timeline_value_is_rejected() {
    let log = event_log();
    let mut denoiser = mock_denoiser(&log);
    denoiser.resize([4, 4]).unwrap();
    let settings = DenoiseSettings::default();
    let frame = Frame::default();

    denoiser.denoise(3, 4, &settings, &frame).unwrap();
    assert!(matches!(
        denoiser.denoise(3, 4, &settings, &frame),
        Err(RenderError::TimelineRegression { value: 3, last: 3, .. })
    ));
    assert!(matches!(
        denoiser.denoise(1, 2, &settings, &frame),
        Err(RenderError::TimelineRegression { .. })
    ));
}

#[test]
fn kernel_records_with_the_frame_settings() {
    let log = event_log();
    let mut denoiser = mock_denoiser(&log);
    denoiser.resize([4, 4]).unwrap();
    assert!(log.borrow().contains(&Event::PrepareKernel([4, 4])));
    take_events(&log);

    let settings = DenoiseSettings {
        filter_radius: 3,
        ..Default::default()
    };
    let frame = Frame {
        index: 9,
        iteration_count: 7,
        changed: false,
    };
    denoiser.denoise(1, 2, &settings, &frame).unwrap();
    assert_eq!(
        take_events(&log),
        [Event::Denoise {
            wait: 1,
            signal: 2,
            commands: vec!["filter radius 3 iteration 7".to_string()],
        }]
    );
}

#[test]
fn denoiser_exposes_primary_buffers_after_resize() {
    let log = event_log();
    let mut denoiser = mock_denoiser(&log);
    assert!(denoiser.bindings().is_none());

    denoiser.resize([5, 2]).unwrap();
    let bindings = denoiser.bindings().unwrap();
    assert!(bindings.iter().all(|b| b.extent == [5, 2]));
    assert_eq!(bindings.flow.texel_size, 8);
    assert_eq!(denoiser.ray_trace_semaphore().id, 100);
    assert_eq!(denoiser.denoised_semaphore().id, 101);
}

#[test]
fn dropping_the_denoiser_drains_the_secondary_device() {
    let log = event_log();
    let denoiser: CrossDeviceDenoiser<_, _, MockKernel> = mock_denoiser(&log);
    take_events(&log);
    drop(denoiser);
    assert_eq!(take_events(&log), [Event::SecondaryDrain(0)]);
}

#[test]
fn resize_waits_for_the_last_denoise() {
    let log = event_log();
    let mut denoiser = mock_denoiser(&log);
    denoiser.resize([4, 4]).unwrap();
    let settings = DenoiseSettings::default();
    denoiser.denoise(1, 2, &settings, &Frame::default()).unwrap();
    take_events(&log);

    denoiser.resize([8, 8]).unwrap();
    assert_eq!(take_events(&log).first(), Some(&Event::SecondaryDrain(2)));
}

#[test]
fn stalled_secondary_device_is_reported_lost() {
    let log = event_log();
    let mut denoiser = stalled_denoiser(&log);
    denoiser.resize([4, 4]).unwrap();
    let settings = DenoiseSettings::default();
    denoiser.denoise(1, 2, &settings, &Frame::default()).unwrap();

    match denoiser.resize([8, 8]) {
        Err(RenderError::DeviceLost { what, timeout }) => {
            assert_eq!(what, "denoiser device");
            assert_eq!(timeout, SECONDARY_TIMEOUT);
        }
        other => panic!("expected a lost device, got {other:?}"),
    }
    // the old buffers stay in place, nothing was imported
    assert_eq!(denoiser.bridge().buffers().unwrap().extent(), [4, 4]);
    assert!(!take_events(&log).iter().any(|e| *e == Event::PrepareKernel([8, 8])));
}

#[test]
fn buffers_without_area_are_rejected() {
    let log = event_log();
    let closed = Rc::new(Cell::new(0));
    let mut bridge = mock_bridge(&log, &closed);
    let denoised = bridge.create_linked_semaphore("denoised").unwrap();
    take_events(&log);

    assert!(matches!(
        bridge.recreate_buffers([0, 0], &denoised),
        Err(RenderError::Allocation(_))
    ));
    assert!(matches!(
        bridge.recreate_buffers([16, 0], &denoised),
        Err(RenderError::Allocation(_))
    ));
    assert!(take_events(&log).is_empty());
    assert!(bridge.buffers().is_none());
}
