//! Error types for the devirtualization core
//!
//! Only setup and plumbing failures are reported through [`Error`]. The two
//! domain outcomes (a commit whose facts went stale, and a bounded traversal
//! that ran out of budget) are ordinary values: see
//! [`crate::commit::CommitError`] and [`crate::hierarchy::Collected`].

use std::fmt;
use thiserror::Error;

use crate::ids::{BodyId, ClassId, CodeAddress, MethodId};

/// Which identity an [`Error::Unknown`] refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityKind {
    /// A class identity
    Class,
    /// A method identity
    Method,
    /// A compiled body
    Body,
}

impl fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityKind::Class => write!(f, "class"),
            IdentityKind::Method => write!(f, "method"),
            IdentityKind::Body => write!(f, "body"),
        }
    }
}

/// Main error type
#[derive(Error, Debug)]
pub enum Error {
    /// Lookup of an identity the registry has never seen (or already dropped)
    #[error("unknown {kind} {id}")]
    Unknown { kind: IdentityKind, id: u64 },

    /// A class-load event for a class that is already present
    #[error("class {0} is already loaded")]
    AlreadyLoaded(ClassId),

    /// A class names a superclass or interface nobody can describe
    #[error("class {class} depends on {missing}, which is neither loaded nor describable")]
    MissingSupertype { class: ClassId, missing: ClassId },

    /// Unload of a class that still has live subclasses
    #[error("class {class} still has {live} live subclass(es)")]
    LiveSubclasses { class: ClassId, live: usize },

    /// An extension edge that would make a class its own ancestor
    #[error("class {subclass} cannot extend {superclass}: the hierarchy would contain a cycle")]
    CyclicHierarchy { superclass: ClassId, subclass: ClassId },

    /// A method id declared twice
    #[error("method {0} is declared by more than one class")]
    DuplicateMethod(MethodId),

    /// A patch request for an address that is not a patchable word of a live body
    #[error("address {0} is not a patchable location")]
    InvalidAddress(CodeAddress),

    /// All compile-thread slots are taken
    #[error("all {0} compile-thread slots are in use")]
    NoCompileSlot(usize),

    /// Configuration could not be read or parsed
    #[error("ConfigError: {0}")]
    Config(String),

    /// A scenario file is malformed or references unknown names
    #[error("ScenarioError: {0}")]
    Scenario(String),

    /// IO error
    #[error("IOError: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl Error {
    /// Unknown class identity
    pub fn unknown_class(id: ClassId) -> Self {
        Error::Unknown {
            kind: IdentityKind::Class,
            id: id.0,
        }
    }

    /// Unknown method identity
    pub fn unknown_method(id: MethodId) -> Self {
        Error::Unknown {
            kind: IdentityKind::Method,
            id: id.0,
        }
    }

    /// Unknown compiled body
    pub fn unknown_body(id: BodyId) -> Self {
        Error::Unknown {
            kind: IdentityKind::Body,
            id: id.0,
        }
    }

    /// Create a scenario error
    pub fn scenario(message: impl Into<String>) -> Self {
        Error::Scenario(message.into())
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
