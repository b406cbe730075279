pub mod shape;
pub mod validate;

pub use shape::{record_patch_shape, relationship_record_shape, s, Shape};
pub use validate::{validate, validate_shape};
