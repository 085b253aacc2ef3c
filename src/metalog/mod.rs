//! Node-local metalog
//!
//! Records which ranges this node owns (and their in-flight maintenance
//! state) as a replace-by-id log of entities. The entity kinds form a
//! closed set decoded from the record type field.

mod entity;
mod errors;
mod file;
mod store;

pub use entity::{
    Entity, EntityFlags, EntityHeader, RangeEntity, RemoveOkLogsEntity, ENTITY_TYPE_RANGE,
    ENTITY_TYPE_REMOVE_OK_LOGS,
};
pub use errors::{MetaLogError, MetaLogResult};
pub use file::{FileMetaLog, METALOG_DIR};
pub use store::MetaLogStore;
