mod entity;
mod mutation;
pub mod schema;

pub use entity::{
    is_temp_id, new_temp_id, Entity, EntityKey, EntityType, Fields, ParseEntityTypeError,
    TEMP_ID_PREFIX,
};
pub(crate) use entity::replace_references;
pub use mutation::{LocalMutation, MutationRecord, MutationStatus, Operation};
pub use schema::{validate_payload, ValidationError, REFERENCE_FIELDS};
