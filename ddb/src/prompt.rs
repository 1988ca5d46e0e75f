//! Generalized debugger prompt.

use std::error::Error as StdError;
use std::fmt::Debug;
use std::io::{self, Write};

use thiserror::Error;

/// Behaviour for prompting a user for input.
pub trait Prompt: Debug {
    /// Presents the prompt message and receives one command line.
    ///
    /// # Errors
    ///
    /// Returns an error if the prompt fails to produce input; the special
    /// [`Error::Quit`] signals that the user wants to terminate.
    fn prompt(&mut self, msg: &str) -> Result<String, Error>;
}

/// A convenient type alias for [`Result`](std::result::Result).
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error caused by a prompt frontend.
#[derive(Debug, Error)]
pub enum Error {
    /// Generic internal error.
    #[error(transparent)]
    Internal(#[from] Box<dyn StdError + Send + Sync>),
    /// Quit request.
    #[error("quit requested by user")]
    Quit,
}

/// Plain stdin prompt; no editing, no history.
#[derive(Debug, Default)]
pub struct Stdio;

impl Prompt for Stdio {
    fn prompt(&mut self, msg: &str) -> Result<String> {
        print!("{msg}");
        io::stdout()
            .flush()
            .map_err(|err| Error::Internal(Box::new(err)))?;
        let mut line = String::new();
        let read = io::stdin()
            .read_line(&mut line)
            .map_err(|err| Error::Internal(Box::new(err)))?;
        if read == 0 {
            return Err(Error::Quit);
        }
        Ok(line)
    }
}
