//! Builders and the registry that owns them.
//!
//! A [`Builder`] is a named computation over a [`Config`]. Invoking it through
//! its [`BuilderRef`] produces a [`TaskRef`], a lazy handle that the
//! [`Runtime`](crate::Runtime) resolves into an [`Entry`](crate::Entry).
//!
//! There are three shapes of builders:
//!
//! * **plain**: a single function from config to value, with no dependencies;
//! * **staged**: a function that declares dependencies through the
//!   [`TaskContext`], suspends exactly once, and then computes the value from
//!   the resolved dependency entries;
//! * **fixed**: no function at all, entries are inserted from the outside.

use std::any::type_name;
use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::sync::Arc;

use serde::Serialize;

use crate::engine::TaskContext;
use crate::error::{ConfigError, RegistrationError};
use crate::key::{self, Config, Key, TaskId};

/// Result type returned by builder functions.
pub type BuildResult<T> = anyhow::Result<T>;

pub(crate) type Value = serde_json::Value;

/// Single phase function, runs entirely on a worker.
type PlainFnPtr = Arc<dyn Fn(&Config) -> BuildResult<Value> + Send + Sync>;

/// Two phase function, runs once per declare pass and once per compute pass.
type StagedFnPtr = Arc<dyn Fn(&mut TaskContext, &Config) -> BuildResult<Value> + Send + Sync>;

#[derive(Clone)]
pub(crate) enum Compute {
    Plain(PlainFnPtr),
    Staged(StagedFnPtr),
}

#[derive(Clone)]
pub(crate) enum BuilderKind {
    Fixed,
    Computed(Compute),
}

/// A named unit of computation.
#[derive(Clone)]
pub struct Builder {
    name: String,
    pub(crate) kind: BuilderKind,
}

impl Builder {
    /// A builder whose value depends on nothing but its config.
    pub fn new<F, R>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Config) -> BuildResult<R> + Send + Sync + 'static,
        R: Serialize,
    {
        Self {
            name: name.into(),
            kind: BuilderKind::Computed(Compute::Plain(Arc::new(move |config| {
                let value = func(config)?;
                Ok(serde_json::to_value(value)?)
            }))),
        }
    }

    /// A builder that declares dependencies before computing.
    ///
    /// The function is called twice for every computed entry. The first call
    /// runs until `ctx.suspend()?` and only records the dependencies. The
    /// second call happens once every dependency is finished, runs past the
    /// suspend point and produces the value.
    ///
    /// ```rust,no_run
    /// use tsumiki::{Builder, Runtime};
    ///
    /// let mut runtime = Runtime::in_memory();
    /// let numbers = runtime.register_builder(Builder::new("numbers", |c| Ok(c.as_i64().unwrap_or(0) * 10)))?;
    ///
    /// let sum = Builder::staged("sum", move |ctx, config| {
    ///     let n = config.as_i64().unwrap_or(0);
    ///     let deps = (0..n)
    ///         .map(|i| Ok(ctx.depend(&numbers.task(i)?)?))
    ///         .collect::<anyhow::Result<Vec<_>>>()?;
    ///     ctx.suspend()?;
    ///     deps.iter().map(|d| ctx.value::<i64>(d)).sum::<anyhow::Result<i64>>()
    /// });
    /// # Ok::<(), anyhow::Error>(())
    /// ```
    pub fn staged<F, R>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&mut TaskContext, &Config) -> BuildResult<R> + Send + Sync + 'static,
        R: Serialize,
    {
        Self {
            name: name.into(),
            kind: BuilderKind::Computed(Compute::Staged(Arc::new(move |ctx, config| {
                let value = func(ctx, config)?;
                Ok(serde_json::to_value(value)?)
            }))),
        }
    }

    /// A builder without a function, its entries have to be inserted.
    pub fn fixed(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: BuilderKind::Fixed,
        }
    }

    /// Plain builder named after the function item.
    pub fn from_fn<F, R>(func: F) -> Self
    where
        F: Fn(&Config) -> BuildResult<R> + Send + Sync + 'static,
        R: Serialize,
    {
        Self::new(fn_name::<F>(), func)
    }

    /// Staged builder named after the function item.
    pub fn staged_from_fn<F, R>(func: F) -> Self
    where
        F: Fn(&mut TaskContext, &Config) -> BuildResult<R> + Send + Sync + 'static,
        R: Serialize,
    {
        Self::staged(fn_name::<F>(), func)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self.kind, BuilderKind::Fixed)
    }

    pub(crate) fn validate(&self) -> Result<(), RegistrationError> {
        let valid = !self.name.is_empty()
            && !self.name.contains("{{closure}}")
            && !self.name.contains(char::is_whitespace);

        if valid {
            Ok(())
        } else {
            Err(RegistrationError::InvalidName(self.name.clone()))
        }
    }
}

impl Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            BuilderKind::Fixed => "fixed",
            BuilderKind::Computed(Compute::Plain(_)) => "plain",
            BuilderKind::Computed(Compute::Staged(_)) => "staged",
        };
        write!(f, "Builder({}, {kind})", self.name)
    }
}

/// Last path segment of a function item type, closures keep `{{closure}}`.
fn fn_name<F>() -> String {
    let path = type_name::<F>();
    path.rsplit("::").next().unwrap_or(path).to_string()
}

/// Factory of [`TaskRef`]s for a registered builder.
#[derive(Debug, Clone)]
pub struct BuilderRef {
    name: Arc<str>,
}

impl BuilderRef {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke the builder for a config, producing an uncomputed reference.
    pub fn task<C>(&self, config: C) -> Result<TaskRef, ConfigError>
    where
        C: Serialize,
    {
        let config = key::to_config(config)?;
        TaskRef::new(self.name.clone(), config)
    }
}

/// A pure reference to the entry of `builder` for `config`.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRef {
    id: TaskId,
    config: Config,
}

impl TaskRef {
    pub(crate) fn new(builder: Arc<str>, config: Config) -> Result<Self, ConfigError> {
        let key = key::canonicalize(&config)?;
        Ok(Self {
            id: TaskId::new(builder, key),
            config,
        })
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn builder(&self) -> &str {
        &self.id.builder
    }

    pub fn key(&self) -> &Key {
        &self.id.key
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// Builders known to a runtime, addressed by name.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    builders: BTreeMap<Arc<str>, Arc<Builder>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, builder: Builder) -> Result<BuilderRef, RegistrationError> {
        builder.validate()?;

        if self.builders.contains_key(builder.name()) {
            return Err(RegistrationError::Duplicate(builder.name.clone()));
        }

        let name: Arc<str> = builder.name().into();
        self.builders.insert(name.clone(), Arc::new(builder));
        Ok(BuilderRef { name })
    }

    /// Swap the function of an already registered builder.
    pub(crate) fn replace(&mut self, builder: Builder) -> Result<BuilderRef, RegistrationError> {
        builder.validate()?;

        let Some((name, _)) = self.builders.get_key_value(builder.name()) else {
            return Err(RegistrationError::Unknown(builder.name.clone()));
        };

        let name = name.clone();
        self.builders.insert(name.clone(), Arc::new(builder));
        Ok(BuilderRef { name })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Builder>> {
        self.builders.get(name)
    }

    /// Factory for an already registered builder.
    pub fn builder_ref(&self, name: &str) -> Option<BuilderRef> {
        self.builders
            .get_key_value(name)
            .map(|(name, _)| BuilderRef { name: name.clone() })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.builders.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.builders.keys().map(AsRef::as_ref)
    }

    pub fn len(&self) -> usize {
        self.builders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.builders.is_empty()
    }

    pub fn clear(&mut self) {
        self.builders.clear();
    }
}
