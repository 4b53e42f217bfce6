//! Strongly typed identities
//!
//! Classes, methods and compiled bodies are referred to by small copyable ids
//! everywhere. Nothing in the crate holds a pointer into another component's
//! storage; a stale id simply fails to resolve.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                $name(raw)
            }
        }
    };
}

id_type!(
    /// Identity of a loaded class. Redefinition produces a new id.
    ClassId
);
id_type!(
    /// Persistent identity of a method, independent of any wrapper object
    MethodId
);
id_type!(
    /// Identity of a compiled body in the code cache
    BodyId
);

/// An absolute address inside the code cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CodeAddress(pub u64);

impl CodeAddress {
    /// Address `words` machine words past this one
    pub fn offset(self, words: u64) -> CodeAddress {
        CodeAddress(self.0 + words * crate::code::WORD_SIZE)
    }
}

impl fmt::Display for CodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Index of a compile thread; bounds the per-node "should not be newly extended" bit vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompileThreadSlot(pub u8);

impl CompileThreadSlot {
    /// Bit mask for this slot
    pub fn mask(self) -> u32 {
        1u32 << self.0
    }
}

impl fmt::Display for CompileThreadSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

/// A method selector (name plus signature), the key of virtual dispatch
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Selector(Arc<str>);

impl Selector {
    pub fn new(name: &str) -> Self {
        Selector(Arc::from(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Selector {
    fn from(s: String) -> Self {
        Selector(Arc::from(s))
    }
}

impl From<&str> for Selector {
    fn from(s: &str) -> Self {
        Selector::new(s)
    }
}

impl From<Selector> for String {
    fn from(s: Selector) -> Self {
        s.0.to_string()
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
