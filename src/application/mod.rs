pub mod bootstrap;
pub mod commands;
pub mod importers;
pub mod persistent_store;
pub mod settings_sync;
pub mod timesheet_sync;
