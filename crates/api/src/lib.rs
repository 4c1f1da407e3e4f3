//! HTTP API: routing, request/response mapping, and the process entrypoint wiring.

pub mod app;
