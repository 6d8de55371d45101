//! Model API layer: the [`LlmClient`] seam, the Gemini implementation,
//! streaming, and HTTP error classification.
//!
//! - [`client`]: the dyn-compatible [`LlmClient`] trait the rest of the
//!   crate talks to. Tests substitute scripted fakes.
//! - [`gemini`]: [`GeminiClient`], a reqwest client for the Gemini
//!   `generateContent` / `countTokens` / `models` endpoints.
//! - [`streaming`]: SSE parser for `streamGenerateContent`, producing
//!   [`StreamEvent`](streaming::StreamEvent) values.
//! - [`classify`]: maps HTTP status codes and error bodies onto crate
//!   [`Error`](crate::Error) variants. No automatic retries happen here or
//!   anywhere else in the crate.

pub mod classify;
pub mod client;
pub mod gemini;
pub mod streaming;

pub use client::{Generation, LlmClient, LlmFuture, UsageInfo};
pub use gemini::GeminiClient;
