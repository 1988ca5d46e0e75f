//! Interface over the user's console.

use ddb::prompt::{Error, Prompt};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor as Editor;

/// Line-editing debugger prompt.
#[derive(Debug)]
pub struct Console {
    edit: Editor,
}

impl Console {
    /// Constructs a new `Console`.
    ///
    /// # Errors
    ///
    /// Errors if the terminal cannot be initialized.
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            edit: Editor::new()?,
        })
    }
}

impl Prompt for Console {
    fn prompt(&mut self, msg: &str) -> Result<String, Error> {
        // Prompt the user for input.
        let line = loop {
            match self.edit.readline(msg) {
                Ok(line) => break line,
                Err(ReadlineError::Interrupted) => continue,
                Err(ReadlineError::Eof) => return Err(Error::Quit),
                Err(err) => return Err(Error::Internal(Box::new(err))),
            }
        };
        // Remember it in the history.
        if !line.trim().is_empty() {
            let _ = self.edit.add_history_entry(&line);
        }
        Ok(line)
    }
}
