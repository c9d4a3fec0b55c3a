//! Invoicing domain module.
//!
//! This crate contains the business rules for fiscal document numbering:
//! invoicing series (per point-of-sale × document-type counters) and the
//! invoices drawn from them. Pure deterministic domain logic: no IO, no
//! HTTP, no storage. The transactional emission workflow that mutates this
//! state lives in `numera-infra`.

pub mod invoice;
pub mod series;

pub use invoice::{Invoice, InvoiceStatus};
pub use series::{DocumentType, Series};
