// Copyright 2022 Oxide Computer Company

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// The mask pins bits that no registered field covers.
    #[error("match mask pins unregistered bits at byte offset {0}")]
    InvalidMatch(usize),

    /// Insert was called on a rule that is already installed.
    #[error("rule is already installed")]
    AlreadyInstalled,

    /// Remove was called on a rule that is not installed here.
    #[error("rule is not installed in this classifier")]
    NotInstalled,

    #[error("out of memory")]
    OutOfMemory,

    #[error("invalid configuration: {0}")]
    ConfigInvalid(&'static str),
}
