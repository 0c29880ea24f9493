//! User interaction for plugin commands.
//!
//! The installer talks to the user only through [`InstallUi`], so tests can
//! script answers and capture output.

use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressStyle};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::io;

/// Output and prompts used while installing or removing plugins
#[async_trait]
pub trait InstallUi: Send + Sync {
    /// Highlighted warning line
    fn warn(&self, message: &str);

    /// Plain status line
    fn say(&self, message: &str);

    /// Final success line
    fn ok(&self, message: &str);

    /// Ask a yes/no question. Anything but an explicit yes is a no.
    ///
    /// Must not block the runtime: the caller may be racing the answer
    /// against Ctrl-C.
    async fn confirm(&self, question: &str) -> io::Result<bool>;

    /// Progress indicator for a download. Hidden unless overridden.
    fn download_progress(&self) -> ProgressBar {
        ProgressBar::hidden()
    }
}

/// Interactive terminal implementation
#[derive(Debug, Default)]
pub struct TerminalUi;

impl TerminalUi {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl InstallUi for TerminalUi {
    fn warn(&self, message: &str) {
        println!("\x1b[1;33m{}\x1b[0m", message);
    }

    fn say(&self, message: &str) {
        println!("{}", message);
    }

    fn ok(&self, message: &str) {
        println!("\x1b[1;32mOK\x1b[0m\n\n{}", message);
    }

    async fn confirm(&self, question: &str) -> io::Result<bool> {
        let prompt = format!("{} [yN]: ", question);
        let (tx, rx) = tokio::sync::oneshot::channel();
        // Detached, so runtime shutdown never waits on an open prompt
        std::thread::spawn(move || {
            let _ = tx.send(read_answer(&prompt));
        });
        rx.await
            .map_err(|_| io::Error::other("prompt thread exited without an answer"))?
    }

    fn download_progress(&self) -> ProgressBar {
        let bar = ProgressBar::no_length();
        let style = ProgressStyle::with_template(
            "{spinner} [{elapsed_precise}] [{bar:40}] {bytes}/{total_bytes} ({bytes_per_sec})",
        )
        .map(|style| style.progress_chars("=> "))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        bar
    }
}

fn read_answer(prompt: &str) -> io::Result<bool> {
    let mut editor = DefaultEditor::new().map_err(io::Error::other)?;
    match editor.readline(prompt) {
        Ok(answer) => Ok(is_yes(&answer)),
        Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => Ok(false),
        Err(ReadlineError::Io(e)) => Err(e),
        Err(e) => Err(io::Error::other(e)),
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
