pub mod camera;
pub mod config;
pub mod error;
pub mod handle_user_input;
pub mod render_system;
pub mod utils;
