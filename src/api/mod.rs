//! API Module
//!
//! HTTP handlers and routing for the inspector REST API.
//!
//! # Endpoints
//! - `GET /health` - Health check endpoint
//! - `GET /queries` - List cache entries
//! - `POST /query` - Full state of one key
//! - `GET /stats` - Cache statistics
//! - `POST /invalidate` - Invalidate a key prefix
//! - `POST /gc` - Run garbage collection now
//! - `POST /focus` - Focus signal
//! - `GET /mutations` - Pending and recently settled mutations

pub mod handlers;
pub mod routes;

pub use handlers::*;
pub use routes::create_router;
