//! Infrastructure layer - framing, sanitizing and telemetry extraction

pub mod lines;
pub mod sanitize;
pub mod telemetry;

pub use lines::{LineBuffer, TelemetryTail};
pub use sanitize::{sanitize, strip_ansi_codes, Sanitizer};
pub use telemetry::{
    classify, extract, reinsert, ExtractedBlock, Extraction, TelemetryMapper, TelemetryRecord,
    TelemetryScanner, TokenSample, ToolCallDescriptor,
};
