use crate::context::ShardContext;
use crate::error::ShardError;
use async_trait::async_trait;

/// The user-implemented unit of behavior.
///
/// Hooks run in this order, each at most once:
///
/// 1. [`pre_setup`](Shard::pre_setup): the only phase in which a dependency
///    loader may be declared
/// 2. [`setup`](Shard::setup): runs after every declared dependency shard is
///    active
/// 3. [`teardown`](Shard::teardown): runs at process shutdown
///
/// An error or panic escaping a hook marks the shard failed; it never reaches
/// the host process.
#[async_trait]
pub trait Shard: Send + Sync {
    async fn pre_setup(&mut self, _context: &ShardContext) -> Result<(), ShardError> {
        Ok(())
    }

    async fn setup(&mut self, context: &ShardContext) -> Result<(), ShardError>;

    async fn teardown(&mut self, context: &ShardContext) -> Result<(), ShardError>;
}

/// Constructs the shard instance of an archive.
///
/// The context passed in is not yet bound; capability calls made from inside
/// `create` fail with [`ShardError::ContextNotBound`]. Keep the context and use
/// it from the hooks.
pub trait ShardFactory: Send + Sync {
    fn create(&self, context: ShardContext) -> Result<Box<dyn Shard>, ShardError>;
}

impl<F> ShardFactory for F
where
    F: Fn(ShardContext) -> Result<Box<dyn Shard>, ShardError> + Send + Sync,
{
    fn create(&self, context: ShardContext) -> Result<Box<dyn Shard>, ShardError> {
        self(context)
    }
}
