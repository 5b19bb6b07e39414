//! Shared domain primitives for the simplebank workspace: row ids, the
//! entity trait and the domain error type. No IO.

pub mod entity;
pub mod error;
pub mod id;

pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{AccountId, EntryId, TransferId, VerifyEmailId};
