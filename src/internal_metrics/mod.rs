//! Process-local metrics reporting.

pub mod logging_recorder;

pub use logging_recorder::LoggingRecorder;
