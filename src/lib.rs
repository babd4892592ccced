pub mod admission_context;
pub mod admission_handler;
pub mod admission_review;
pub mod error;
pub mod identity_injection;
pub mod patch;
pub mod webhook_config;
pub mod webhook_rule;

pub use admission_context::AdmissionContext;
pub use admission_handler::AdmissionServer;
pub use error::Error;
pub use webhook_rule::{Scope, WebhookRule};
