mod transform;

pub use transform::{TransformSync, TransformUpdate};
