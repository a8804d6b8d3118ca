pub mod error;
pub mod problem;
pub mod sse;
