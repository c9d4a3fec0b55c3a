//! Sales domain module.
//!
//! The emission workflow treats sales as a **read-only external leaf**: it
//! needs an existence check and the monetary total of a finalized sale,
//! nothing more. This crate holds that read model.

pub mod sale;

pub use sale::Sale;
