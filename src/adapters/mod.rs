//! Outbound integrations

pub mod webhook;

pub use webhook::WebhookReporter;
