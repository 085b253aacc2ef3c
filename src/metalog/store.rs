use super::entity::Entity;
use super::errors::MetaLogResult;

/// Append-only, replace-by-id store of a node's own bookkeeping.
///
/// Writing an entity supersedes any earlier state with the same id;
/// removal writes a tombstone. Implementations must make each call durable
/// before returning.
pub trait MetaLogStore: Send + Sync {
    /// Live entities, in id order.
    fn get_entities(&self) -> MetaLogResult<Vec<Entity>>;

    /// Persists the current state of every entity in one durable append.
    fn record_state(&self, entities: &[Entity]) -> MetaLogResult<()>;

    /// Persists a tombstone for `entity`.
    fn record_removal(&self, entity: &Entity) -> MetaLogResult<()>;

    /// Id for a newly created entity.
    fn next_entity_id(&self) -> i64;

    /// Syncs and rejects further writes.
    fn close(&self) -> MetaLogResult<()>;
}
