pub mod app;
pub mod clear_renderer;
