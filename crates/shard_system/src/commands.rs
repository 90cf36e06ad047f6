//! Command Registrar and the in-memory dispatch engine.
//!
//! A shard command is validated once, when it is bound: every subcommand's
//! parameters must agree with its declared signature. A command that fails
//! validation is skipped on its own; its siblings still register. Every bound
//! command fans out into one route per subcommand path plus its default route.

use parking_lot::RwLock;
use shard_api::{
    panic_message, ArgValue, ArgumentType, CommandError, CommandMeta, CommandSender, ShardCommand,
    SubcommandHandler, ValueKind,
};
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

// ============================================================================
// Binding
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandBindingError {
    #[error("shard '{shard}' exports a command without metadata")]
    MissingMetadata { shard: String },
    #[error("command name '{0}' is empty or contains whitespace")]
    InvalidName(String),
    #[error("/{command}: a subcommand has an empty path")]
    EmptyPath { command: String },
    #[error("/{command} {path}: path is declared twice")]
    DuplicatePath { command: String, path: String },
    #[error("/{command} {path}: handler takes {expected} arguments but {declared} parameters are declared")]
    ArgumentCount {
        command: String,
        path: String,
        expected: usize,
        declared: usize,
    },
    #[error("/{command} {path}: parameter '{param}' produces {produced} but the handler expects {expected}")]
    ArgumentType {
        command: String,
        path: String,
        param: String,
        produced: ValueKind,
        expected: ValueKind,
    },
    #[error("/{command} {path}: greedy parameter '{param}' must be the last one")]
    GreedyNotLast {
        command: String,
        path: String,
        param: String,
    },
    #[error("shard '{shard}' command panicked while binding: {message}")]
    Panicked { shard: String, message: String },
}

#[derive(Clone)]
struct BoundSubcommand {
    tokens: Vec<String>,
    arguments: Vec<(String, ArgumentType)>,
    handler: SubcommandHandler,
}

/// A validated command of one shard.
#[derive(Clone)]
pub struct CommandBinding {
    pub owner: String,
    pub meta: CommandMeta,
    command: Arc<dyn ShardCommand>,
    subcommands: BTreeMap<String, BoundSubcommand>,
}

impl CommandBinding {
    /// Validates a command object and everything it declares.
    pub fn bind(owner: &str, command: Arc<dyn ShardCommand>) -> Result<Self, CommandBindingError> {
        let meta = command
            .metadata()
            .ok_or_else(|| CommandBindingError::MissingMetadata {
                shard: owner.to_string(),
            })?;
        if meta.name.is_empty() || meta.name.contains(char::is_whitespace) {
            return Err(CommandBindingError::InvalidName(meta.name));
        }

        let mut subcommands = BTreeMap::new();
        for subcommand in command.subcommands() {
            let tokens: Vec<String> = subcommand.tokens().into_iter().map(str::to_string).collect();
            if tokens.is_empty() {
                return Err(CommandBindingError::EmptyPath {
                    command: meta.name.clone(),
                });
            }
            let path = tokens.join(" ");
            if subcommands.contains_key(&path) {
                return Err(CommandBindingError::DuplicatePath {
                    command: meta.name.clone(),
                    path,
                });
            }

            if subcommand.params.len() != subcommand.signature.len() {
                return Err(CommandBindingError::ArgumentCount {
                    command: meta.name.clone(),
                    path,
                    expected: subcommand.signature.len(),
                    declared: subcommand.params.len(),
                });
            }

            let mut arguments = Vec::with_capacity(subcommand.params.len());
            let last = subcommand.params.len().saturating_sub(1);
            for (index, (param, expected)) in subcommand.params.iter().zip(&subcommand.signature).enumerate() {
                let argument = param.argument_type();
                if argument.produces() != *expected {
                    return Err(CommandBindingError::ArgumentType {
                        command: meta.name.clone(),
                        path,
                        param: param.name.clone(),
                        produced: argument.produces(),
                        expected: *expected,
                    });
                }
                if argument.is_greedy() && index != last {
                    return Err(CommandBindingError::GreedyNotLast {
                        command: meta.name.clone(),
                        path,
                        param: param.name.clone(),
                    });
                }
                arguments.push((param.name.clone(), argument));
            }

            subcommands.insert(
                path,
                BoundSubcommand {
                    tokens,
                    arguments,
                    handler: subcommand.handler.clone(),
                },
            );
        }

        Ok(Self {
            owner: owner.to_string(),
            meta,
            command,
            subcommands,
        })
    }

    pub fn subcommand_paths(&self) -> impl Iterator<Item = &str> {
        self.subcommands.keys().map(String::as_str)
    }

    /// The default route followed by one route per subcommand path.
    pub fn routes(&self) -> Vec<CommandRoute> {
        let mut routes = Vec::with_capacity(self.subcommands.len() + 1);

        let command = self.command.clone();
        routes.push(self.route(
            Vec::new(),
            Vec::new(),
            Arc::new(move |sender: &CommandSender, _args: &[ArgValue]| {
                if !command.middleware(sender, "", &[]) {
                    return Ok(RouteOutcome::Vetoed);
                }
                command.execute(sender).map(|_| RouteOutcome::Executed)
            }),
        ));

        for (path, subcommand) in &self.subcommands {
            let command = self.command.clone();
            let handler = subcommand.handler.clone();
            let path_text = path.clone();
            routes.push(self.route(
                subcommand.tokens.clone(),
                subcommand.arguments.clone(),
                Arc::new(move |sender: &CommandSender, args: &[ArgValue]| {
                    if !command.middleware(sender, &path_text, args) {
                        return Ok(RouteOutcome::Vetoed);
                    }
                    handler(sender, args).map(|_| RouteOutcome::Executed)
                }),
            ));
        }

        routes
    }

    fn route(&self, path: Vec<String>, arguments: Vec<(String, ArgumentType)>, invoke: RouteInvoker) -> CommandRoute {
        CommandRoute {
            owner: self.owner.clone(),
            command: self.meta.name.clone(),
            aliases: self.meta.aliases.clone(),
            permission: self.meta.permission.clone(),
            path,
            arguments,
            invoke,
        }
    }
}

impl fmt::Debug for CommandBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBinding")
            .field("owner", &self.owner)
            .field("meta", &self.meta)
            .field("subcommands", &self.subcommands.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ============================================================================
// Routes and dispatch
// ============================================================================

/// Result of running a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Executed,
    /// The command's middleware refused to run the handler
    Vetoed,
}

type RouteInvoker =
    Arc<dyn Fn(&CommandSender, &[ArgValue]) -> Result<RouteOutcome, CommandError> + Send + Sync>;

/// One registration in the dispatch engine.
#[derive(Clone)]
pub struct CommandRoute {
    pub owner: String,
    pub command: String,
    pub aliases: Vec<String>,
    pub permission: Option<String>,
    /// Literal tokens after the command label; empty for the default route
    pub path: Vec<String>,
    pub arguments: Vec<(String, ArgumentType)>,
    invoke: RouteInvoker,
}

impl CommandRoute {
    /// Runs middleware, then the handler. A panic in either is returned as
    /// [`CommandError::Panicked`].
    pub fn invoke(&self, sender: &CommandSender, args: &[ArgValue]) -> Result<RouteOutcome, CommandError> {
        catch_unwind(AssertUnwindSafe(|| (self.invoke)(sender, args))).unwrap_or_else(|panic| {
            let message = panic_message(panic.as_ref());
            warn!(shard = %self.owner, "/{} panicked: {}", self.command, message);
            Err(CommandError::Panicked(message))
        })
    }

    pub fn is_default(&self) -> bool {
        self.path.is_empty()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.command.as_str()).chain(self.aliases.iter().map(String::as_str))
    }

    fn answers_to(&self, label: &str) -> bool {
        self.labels().any(|name| name.eq_ignore_ascii_case(label))
    }

    fn overlaps(&self, other: &CommandRoute) -> bool {
        self.path == other.path && other.labels().any(|label| self.answers_to(label))
    }

    /// Parses the tokens that follow the route's path.
    fn parse_arguments(&self, tokens: &[&str]) -> Result<Vec<ArgValue>, CommandError> {
        let greedy = self.arguments.last().is_some_and(|(_, argument)| argument.is_greedy());
        let count_ok = if greedy {
            tokens.len() >= self.arguments.len()
        } else {
            tokens.len() == self.arguments.len()
        };
        if !count_ok {
            return Err(CommandError::InvalidArguments(format!(
                "expected {} argument(s) ({}), got {}",
                self.arguments.len(),
                self.arguments
                    .iter()
                    .map(|(name, _)| format!("<{}>", name))
                    .collect::<Vec<_>>()
                    .join(" "),
                tokens.len()
            )));
        }

        self.arguments
            .iter()
            .enumerate()
            .map(|(index, (_, argument))| {
                if argument.is_greedy() {
                    argument.parse(&tokens[index..].join(" "))
                } else {
                    argument.parse(tokens[index])
                }
            })
            .collect()
    }
}

impl fmt::Debug for CommandRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRoute")
            .field("owner", &self.owner)
            .field("command", &self.command)
            .field("path", &self.path)
            .field("arguments", &self.arguments)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("/{command} {path} is already registered by '{owner}'")]
    Conflict {
        command: String,
        path: String,
        owner: String,
    },
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("missing permission '{permission}' for /{command}")]
    PermissionDenied { command: String, permission: String },
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("empty command line")]
    EmptyInput,
}

/// The host's command engine as seen by the registrar.
pub trait CommandDispatcher: Send + Sync {
    /// Registers the routes of one command: all of them, or none if any
    /// conflicts. Returns how many were registered.
    fn register(&self, routes: Vec<CommandRoute>) -> Result<usize, DispatchError>;

    /// Removes every route owned by a shard; returns how many were removed.
    fn unregister(&self, owner: &str) -> usize;
}

/// In-memory command engine used by the `frost` console.
#[derive(Default)]
pub struct CommandTable {
    routes: RwLock<Vec<CommandRoute>>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route_count(&self) -> usize {
        self.routes.read().len()
    }

    /// Registered command names, sorted and deduplicated.
    pub fn commands(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routes.read().iter().map(|route| route.command.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    /// Parses and runs one input line: `label [path tokens] [arguments]`.
    ///
    /// The route with the longest matching path wins. The route is cloned out
    /// of the table before it runs, so handlers may register or unregister
    /// commands themselves.
    pub fn dispatch(&self, sender: &CommandSender, line: &str) -> Result<RouteOutcome, DispatchError> {
        let mut tokens = line.split_whitespace();
        let label = tokens
            .next()
            .map(|label| label.trim_start_matches('/'))
            .filter(|label| !label.is_empty())
            .ok_or(DispatchError::EmptyInput)?;
        let rest: Vec<&str> = tokens.collect();

        let route = {
            let routes = self.routes.read();
            let mut known = false;
            let mut best: Option<&CommandRoute> = None;
            for route in routes.iter().filter(|route| route.answers_to(label)) {
                known = true;
                let matches = route.path.len() <= rest.len()
                    && route
                        .path
                        .iter()
                        .zip(&rest)
                        .all(|(expected, token)| expected.eq_ignore_ascii_case(token));
                if matches && best.map_or(true, |current| route.path.len() > current.path.len()) {
                    best = Some(route);
                }
            }
            match best {
                Some(route) => route.clone(),
                None if known => {
                    return Err(CommandError::InvalidArguments(format!("no handler of /{} matches", label)).into())
                }
                None => return Err(DispatchError::UnknownCommand(label.to_string())),
            }
        };

        if let Some(permission) = &route.permission {
            if !sender.has_permission(permission) {
                return Err(DispatchError::PermissionDenied {
                    command: route.command.clone(),
                    permission: permission.clone(),
                });
            }
        }

        let args = route.parse_arguments(&rest[route.path.len()..])?;
        debug!(
            sender = %sender.name,
            "Dispatching /{} {} ({} args)",
            route.command,
            route.path.join(" "),
            args.len()
        );
        Ok(route.invoke(sender, &args)?)
    }
}

impl CommandDispatcher for CommandTable {
    fn register(&self, batch: Vec<CommandRoute>) -> Result<usize, DispatchError> {
        let mut routes = self.routes.write();
        for (index, route) in batch.iter().enumerate() {
            let existing = routes
                .iter()
                .chain(&batch[..index])
                .find(|existing| existing.overlaps(route));
            if let Some(existing) = existing {
                return Err(DispatchError::Conflict {
                    command: route.command.clone(),
                    path: route.path.join(" "),
                    owner: existing.owner.clone(),
                });
            }
        }
        let count = batch.len();
        routes.extend(batch);
        Ok(count)
    }

    fn unregister(&self, owner: &str) -> usize {
        let mut routes = self.routes.write();
        let before = routes.len();
        routes.retain(|route| route.owner != owner);
        before - routes.len()
    }
}

// ============================================================================
// Registrar
// ============================================================================

/// What registering one shard's commands produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationSummary {
    /// Routes accepted by the dispatcher
    pub routes: usize,
    /// Commands registered; a command's routes register together or not at all
    pub commands: usize,
    /// One line per skipped command
    pub errors: Vec<String>,
}

/// Binds shard commands into a [`CommandDispatcher`].
pub struct CommandRegistrar {
    dispatcher: Arc<dyn CommandDispatcher>,
}

impl CommandRegistrar {
    pub fn new(dispatcher: Arc<dyn CommandDispatcher>) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Arc<dyn CommandDispatcher> {
        &self.dispatcher
    }

    /// Validates a shard's command objects. Invalid ones are returned as errors
    /// and do not affect the others.
    pub fn discover_commands(
        &self,
        owner: &str,
        commands: &[Arc<dyn ShardCommand>],
    ) -> (Vec<CommandBinding>, Vec<CommandBindingError>) {
        let mut bindings = Vec::new();
        let mut errors = Vec::new();

        for command in commands {
            let bound = catch_unwind(AssertUnwindSafe(|| CommandBinding::bind(owner, command.clone())))
                .unwrap_or_else(|panic| {
                    Err(CommandBindingError::Panicked {
                        shard: owner.to_string(),
                        message: panic_message(panic.as_ref()),
                    })
                });
            match bound {
                Ok(binding) => bindings.push(binding),
                Err(e) => {
                    warn!(shard = %owner, "Skipping command: {}", e);
                    errors.push(e);
                }
            }
        }

        (bindings, errors)
    }

    /// Binds and registers every command of a shard.
    pub fn register_all(&self, owner: &str, commands: &[Arc<dyn ShardCommand>]) -> RegistrationSummary {
        let (bindings, binding_errors) = self.discover_commands(owner, commands);
        let mut summary = RegistrationSummary {
            errors: binding_errors.iter().map(ToString::to_string).collect(),
            ..RegistrationSummary::default()
        };

        for binding in bindings {
            match self.dispatcher.register(binding.routes()) {
                Ok(routes) => {
                    summary.routes += routes;
                    summary.commands += 1;
                }
                Err(e) => {
                    warn!(shard = %owner, "Skipping /{}: {}", binding.meta.name, e);
                    summary.errors.push(e.to_string());
                }
            }
        }

        if summary.routes > 0 {
            info!(
                shard = %owner,
                "Registered {} command(s) as {} route(s)",
                summary.commands,
                summary.routes
            );
        }
        summary
    }

    pub fn unregister(&self, owner: &str) -> usize {
        let removed = self.dispatcher.unregister(owner);
        if removed > 0 {
            debug!(shard = %owner, "Unregistered {} route(s)", removed);
        }
        removed
    }
}
