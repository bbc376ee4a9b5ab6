//! Shared infrastructure helpers
//!
//! - `jsonpath`: minimal dot/index path resolution over `serde_json::Value`,
//!   used by the condition evaluator and the template context plumbing.

pub mod jsonpath;
