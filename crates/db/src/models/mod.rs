//! Row structs and insert DTOs.
//!
//! Each submodule holds a `FromRow` + `Serialize` entity matching a table
//! and, where rows are created from domain data, a create DTO.

pub mod performance;
pub mod session;
pub mod worker_error;
