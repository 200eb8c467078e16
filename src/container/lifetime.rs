use std::fmt::{self, Display, Formatter};

/// How long a constructed service instance is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifetime {
    /// One instance per container, built lazily on first request from any scope.
    Singleton,
    /// One instance per scope, released when the scope is disposed.
    Scoped,
    /// A new instance on every resolution.
    Transient,
}

impl Display for Lifetime {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Lifetime::Singleton => "singleton",
            Lifetime::Scoped => "scoped",
            Lifetime::Transient => "transient",
        };
        f.write_str(name)
    }
}
