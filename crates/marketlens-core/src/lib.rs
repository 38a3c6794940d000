pub mod attribution;
pub mod cache;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod methods;
pub mod query;
pub mod reports;
