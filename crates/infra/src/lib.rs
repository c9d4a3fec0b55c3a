//! Infrastructure layer: storage adapters and the transactional emission
//! workflow.
//!
//! The domain crates (`numera-invoicing`, `numera-sales`) are pure; everything
//! that touches a database, a lock or a clock lives here.

pub mod audit;
pub mod emission;
pub mod sale_store;
