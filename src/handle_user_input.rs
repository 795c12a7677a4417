use winit::{
    event::{ElementState, KeyEvent, WindowEvent},
    keyboard::{KeyCode, PhysicalKey},
};

use crate::render_system::orchestrator::InputEvent;

/// The renderer action bound to `key`, if any.
pub fn map_key(key: KeyCode) -> Option<InputEvent> {
    match key {
        KeyCode::ArrowLeft => Some(InputEvent::SunAzimuth(-1.0)),
        KeyCode::ArrowRight => Some(InputEvent::SunAzimuth(1.0)),
        KeyCode::ArrowUp => Some(InputEvent::SunElevation(1.0)),
        KeyCode::ArrowDown => Some(InputEvent::SunElevation(-1.0)),
        KeyCode::Equal | KeyCode::NumpadAdd => Some(InputEvent::Exposure(1.0)),
        KeyCode::Minus | KeyCode::NumpadSubtract => Some(InputEvent::Exposure(-1.0)),
        KeyCode::Backspace => Some(InputEvent::ClearSunOverride),
        _ => None,
    }
}

/// Translates a key press (repeats included) into a renderer action.
pub fn input_event(event: &WindowEvent) -> Option<InputEvent> {
    match event {
        WindowEvent::KeyboardInput {
            event:
                KeyEvent {
                    physical_key: PhysicalKey::Code(kc),
                    state: ElementState::Pressed,
                    ..
                },
            ..
        } => map_key(*kc),
        _ => None,
    }
}
