//! The phases of a collection cycle, in pipeline order: mark, gather (plus
//! weak clearing and garbage reporting), incremental unhash, and the
//! destruction pipeline.

pub(crate) mod gather;
pub(crate) mod mark;
pub(crate) mod purge;
pub(crate) mod unhash;
