pub mod models;
pub mod shortcut;
