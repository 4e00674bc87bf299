use std::fs;
use std::io::{self, BufRead, Write};
use std::process::Command;

use tracing::debug;

/// Interactive input from the user.
pub trait Prompter {
    /// Opens an editor on `initial`. `None` when the text comes back unchanged.
    fn edit(&self, initial: &str) -> io::Result<Option<String>>;

    /// Reads one line after printing `prompt`, without the line terminator.
    fn input(&self, prompt: &str) -> io::Result<String>;
}

pub struct TerminalPrompter {
    editor: String,
}

impl TerminalPrompter {
    pub fn new() -> Self {
        let editor = std::env::var("VISUAL")
            .or_else(|_| std::env::var("EDITOR"))
            .unwrap_or_else(|_| {
                if cfg!(windows) {
                    "notepad".to_string()
                } else {
                    "vi".to_string()
                }
            });
        Self { editor }
    }
}

impl Default for TerminalPrompter {
    fn default() -> Self {
        Self::new()
    }
}

impl Prompter for TerminalPrompter {
    fn edit(&self, initial: &str) -> io::Result<Option<String>> {
        let file = tempfile::Builder::new()
            .prefix("bpc-")
            .suffix(".txt")
            .tempfile()?;
        fs::write(file.path(), initial)?;

        // EDITOR may carry arguments, e.g. "code --wait"
        let mut parts = self.editor.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no editor configured"))?;
        debug!("Opening {} in {}", file.path().display(), self.editor);
        let status = Command::new(program).args(parts).arg(file.path()).status()?;
        if !status.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("editor '{}' exited with {status}", self.editor),
            ));
        }

        let edited = fs::read_to_string(file.path())?;
        Ok(Some(edited).filter(|text| text != initial))
    }

    fn input(&self, prompt: &str) -> io::Result<String> {
        print!("{prompt}");
        io::stdout().flush()?;
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    /// Replays canned answers and records every prompt it was shown.
    #[derive(Default)]
    pub(crate) struct ScriptedPrompter {
        pub edits: RefCell<VecDeque<Option<String>>>,
        pub answers: RefCell<VecDeque<String>>,
        pub shown: RefCell<Vec<String>>,
    }

    impl ScriptedPrompter {
        pub fn answering(answers: &[&str]) -> Self {
            let prompter = Self::default();
            prompter
                .answers
                .borrow_mut()
                .extend(answers.iter().map(|a| a.to_string()));
            prompter
        }

        pub fn with_edit(self, edit: Option<&str>) -> Self {
            self.edits.borrow_mut().push_back(edit.map(str::to_string));
            self
        }
    }

    impl Prompter for ScriptedPrompter {
        fn edit(&self, initial: &str) -> io::Result<Option<String>> {
            self.shown.borrow_mut().push(format!("edit:{initial}"));
            Ok(self.edits.borrow_mut().pop_front().flatten())
        }

        fn input(&self, prompt: &str) -> io::Result<String> {
            self.shown.borrow_mut().push(prompt.to_string());
            Ok(self.answers.borrow_mut().pop_front().unwrap_or_default())
        }
    }

    #[test]
    fn default_prompter_reads_the_environment() {
        assert_eq!(TerminalPrompter::default().editor, TerminalPrompter::new().editor);
    }

    #[cfg(unix)]
    #[test]
    fn unchanged_editor_buffer_is_none() {
        let prompter = TerminalPrompter {
            editor: "true".into(),
        };
        assert_eq!(prompter.edit("Insert title").unwrap(), None);
    }

    #[cfg(unix)]
    #[test]
    fn failing_editor_is_an_error() {
        let prompter = TerminalPrompter {
            editor: "false".into(),
        };
        assert!(prompter.edit("Insert title").is_err());
    }
}
