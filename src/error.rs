//! Centralized error type for the plinth umbrella crate.
//!
//! Wraps all subsystem errors so `?` propagates naturally across crate boundaries.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] plinth_core::Error),

    #[error(transparent)]
    Graph(#[from] plinth_graph::GraphError),
}

impl Error {
    /// The underlying core error, looking through graph errors that wrap one.
    pub fn core(&self) -> Option<&plinth_core::Error> {
        match self {
            Error::Core(e) | Error::Graph(plinth_graph::GraphError::Core(e)) => Some(e),
            Error::Graph(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
