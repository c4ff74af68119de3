pub mod billing;
pub mod config;
pub mod db;
pub mod error;
pub mod extractor;
pub mod moderation;
pub mod notifications;
pub mod organizations;
pub mod platform;
pub mod routes;

pub use platform::{Collaborators, Platform};
pub use routes::app;
