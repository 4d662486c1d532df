//! Sluice - Leaky Bucket Rate Limiting Service
//!
//! This crate implements a per-key leaky-bucket rate limiter and exposes it
//! both as an axum middleware guard and as a standalone HTTP decision
//! service. Requests over budget are answered with `429 Too Many Requests`.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
