//! Definition documents: serde DTOs, YAML/JSON parsing and validation.

pub mod dto;
pub mod validate;
pub mod yaml;
