pub mod models;
pub mod patient;
pub mod settings;
pub mod store;
