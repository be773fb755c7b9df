// src/lib.rs
//! templar: a template-driven network vulnerability scanner.
//!
//! Declarative YAML templates describe probes over HTTP, DNS, and raw TCP
//! together with matchers and extractors; the engine dispatches every
//! applicable template against every target at bounded concurrency and
//! emits one structured result event per match.

pub mod cruise;
pub mod engine;
pub mod error;
pub mod hosterrors;
pub mod input;
pub mod interactsh;
pub mod output;
pub mod progress;
pub mod project;
pub mod resume;
pub mod sdk;
pub mod templates;

pub use error::TemplarError;
pub use input::MetaInput;
pub use output::ResultEvent;
pub use sdk::{ScanOptions, TemplarEngine};
pub use templates::{Severity, Template};
