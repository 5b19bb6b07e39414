//! Rows with a stable identity.

/// A persisted row addressed by its key.
///
/// Keys are totally ordered so stores can keep rows in key order and
/// return them sorted.
pub trait Entity {
    /// Primary key (`AccountId`, username, ...).
    type Id: Clone + Ord + core::fmt::Debug;

    fn id(&self) -> &Self::Id;
}
