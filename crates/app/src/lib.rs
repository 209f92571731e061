pub mod error;
pub mod input;
pub mod render;
pub mod session;
pub mod settings;
