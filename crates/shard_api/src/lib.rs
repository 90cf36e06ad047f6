//! # Shard API
//!
//! The plugin-facing half of the Frost shard runtime. A shard is a dynamically
//! loaded unit of behavior with its own descriptor, its own dependency set and a
//! strictly ordered lifecycle. This crate defines everything a shard author
//! touches:
//!
//! - [`Shard`] and [`ShardFactory`]: the lifecycle hooks and the constructor the
//!   host looks up in every archive
//! - [`ShardContext`]: host capabilities (data directory, logging, storage,
//!   symbol lookup, message bundles, dependency and command declaration)
//! - [`ShardDescriptor`]: the identity document embedded in every archive
//! - [`ShardCommand`] and [`Subcommand`]: the declarative command model
//! - [`DependencyLoader`] and [`Coordinate`]: runtime library declarations
//! - [`ExportTable`] and [`export_shard!`]: the archive ABI
//!
//! ## Writing a shard
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use shard_api::*;
//!
//! struct Hello {
//!     context: ShardContext,
//! }
//!
//! #[async_trait]
//! impl Shard for Hello {
//!     async fn setup(&mut self, context: &ShardContext) -> Result<(), ShardError> {
//!         context.logger()?.info("hello from setup");
//!         Ok(())
//!     }
//!
//!     async fn teardown(&mut self, _context: &ShardContext) -> Result<(), ShardError> {
//!         Ok(())
//!     }
//! }
//!
//! export_shard!(ExportTable::new()
//!     .with_descriptor("id = \"hello\"\nname = \"Hello\"\nversion = \"1.0.0\"")
//!     .with_factory(|context: ShardContext| -> Result<Box<dyn Shard>, ShardError> {
//!         Ok(Box::new(Hello { context }))
//!     }));
//! ```

pub mod command;
pub mod context;
pub mod dependency;
pub mod descriptor;
pub mod error;
pub mod lang;
pub mod lifecycle;
pub mod services;
pub mod shard;
pub mod symbol;

mod macros;

pub use command::{
    ArgValue, ArgumentType, CommandError, CommandMeta, CommandSender, Param, ShardCommand,
    Subcommand, SubcommandHandler, ValueKind,
};
pub use context::{BoundContext, ContextController, ShardContext};
pub use dependency::{
    Coordinate, CoordinateError, DependencyCollector, DependencyLoader, RemoteRepository,
};
pub use descriptor::{is_valid_shard_id, DescriptorError, ShardDescriptor};
pub use error::{panic_message, ShardError};
pub use lang::{bundle_name, Lang, LangError, LANG_EXPORT_PREFIX};
pub use lifecycle::{LifecycleCell, LifecycleState, TransitionError};
pub use services::{
    ConfigPublisher, LogEmitter, LogLevel, LogSink, ServiceError, ShardServices, StorageService,
};
pub use shard::{Shard, ShardFactory};
pub use symbol::{
    ExportTable, ExportValue, Symbol, SymbolError, SymbolOrigin, SymbolResolver, SymbolValue,
    ABI_VERSION_SYMBOL, COMMAND_EXPORT_PREFIX, DEPENDENCY_LOADER_EXPORT, DESCRIPTOR_EXPORT,
    EXPORTS_SYMBOL, FACTORY_EXPORT,
};

// Re-exported so shard crates can use `#[async_trait]` without a direct dependency.
pub use async_trait::async_trait;

/// ABI identifier of this build of the API: `"<crate version>:<rustc version>"`.
///
/// Archives and host must agree on this string byte for byte. Rust has no stable
/// ABI, so a shard compiled against a different API version or compiler is
/// rejected before any of its exports are touched.
pub const ABI_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    ":",
    env!("SHARD_API_RUSTC_VERSION")
);

/// [`ABI_VERSION`] with a trailing NUL, handed across the C boundary.
#[doc(hidden)]
pub const ABI_VERSION_NUL: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    ":",
    env!("SHARD_API_RUSTC_VERSION"),
    "\0"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abi_version_strings_agree() {
        assert_eq!(&ABI_VERSION_NUL[..ABI_VERSION_NUL.len() - 1], ABI_VERSION);
        assert!(ABI_VERSION.contains(':'));
    }
}
