//! Transactional invoice emission boundary.
//!
//! This module defines the contract for allocating fiscal document numbers and
//! creating the matching invoice rows atomically, without making storage
//! assumptions, plus two complete backends: Postgres (real row locks) and an
//! in-memory twin for tests, dev and benches.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::{FailurePoint, InMemoryEmission};
pub use postgres::{ensure_schema, PgEmission};
pub use r#trait::{InvoiceEmission, NewSeries, SeriesAdmin, SeriesAdminError, VoidError};
