//! Request and Response models for the inspector API
//!
//! This module defines the DTOs (Data Transfer Objects) used for
//! serializing/deserializing HTTP request and response bodies.

pub mod requests;
pub mod responses;

// Re-export commonly used types
pub use requests::{InvalidateRequest, QueryLookupRequest};
pub use responses::{
    FocusResponse, GcResponse, HealthResponse, InvalidateResponse, MutationsResponse, QuerySummary,
    StatsResponse,
};
