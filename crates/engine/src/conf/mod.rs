pub mod builtin;
pub mod descriptor;
pub mod model;
pub mod serde_utils;

pub use descriptor::{
    Computed, DescriptorId, DescriptorKind, DescriptorSet, FieldSpec, KeyedSpec, LineDescriptor,
    Role, DEFAULT_MAX_KEYS,
};
pub use model::{DescriptorConfig, StatusLineConfig};
