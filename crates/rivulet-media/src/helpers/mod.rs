// crates/rivulet-media/src/helpers/mod.rs
//
// Internal helpers: enum mapping between the core config types and the
// libav equivalents, plus source URL classification. Not re-exported
// from lib.rs.

pub mod formats;
pub mod url;
