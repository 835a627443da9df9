//! Background Tasks Module
//!
//! Contains background tasks that run periodically while a client is alive.
//!
//! # Tasks
//! - Garbage collection: evicts unobserved entries past their GC time

mod gc;

pub use gc::spawn_gc_task;
