//! Decisions the restore pipeline delegates to a human.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;

/// Operator interaction contract
pub trait Operator: Send + Sync {
    /// Approve a signer seen for the first time
    fn approve_signer(&self, fingerprint: &str, signer: Option<&str>) -> bool;

    /// Ask for media holding the missing block ordinals. `None` gives up.
    fn request_media(&self, missing: &[u32]) -> Option<PathBuf>;
}

/// Never prompts: unknown signers are refused and no extra media arrives
#[derive(Debug, Clone, Copy, Default)]
pub struct NonInteractive;

impl Operator for NonInteractive {
    fn approve_signer(&self, fingerprint: &str, _signer: Option<&str>) -> bool {
        warn!("Refusing unknown signer {} in non-interactive mode", fingerprint);
        false
    }

    fn request_media(&self, missing: &[u32]) -> Option<PathBuf> {
        warn!("{} blocks missing, continuing without them", missing.len());
        None
    }
}

/// Prompts on the terminal
pub struct ConsoleOperator<R = io::BufReader<io::Stdin>> {
    input: Mutex<R>,
}

impl ConsoleOperator {
    pub fn new() -> Self {
        Self {
            input: Mutex::new(io::BufReader::new(io::stdin())),
        }
    }
}

impl Default for ConsoleOperator {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: BufRead + Send> ConsoleOperator<R> {
    /// Read answers from `input` instead of stdin
    pub fn with_input(input: R) -> Self {
        Self {
            input: Mutex::new(input),
        }
    }

    fn ask(&self, prompt: &str) -> Option<String> {
        print!("{}", prompt);
        io::stdout().flush().ok()?;
        let mut line = String::new();
        let mut input = self.input.lock().ok()?;
        match input.read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim().to_string()),
        }
    }
}

impl<R: BufRead + Send> Operator for ConsoleOperator<R> {
    fn approve_signer(&self, fingerprint: &str, signer: Option<&str>) -> bool {
        let who = signer.unwrap_or("unknown identity");
        let prompt = format!(
            "Block signed by {} ({}), not yet trusted. Trust this signer? [y/N]: ",
            fingerprint, who
        );
        self.ask(&prompt)
            .map(|a| a.eq_ignore_ascii_case("y") || a.eq_ignore_ascii_case("yes"))
            .unwrap_or(false)
    }

    fn request_media(&self, missing: &[u32]) -> Option<PathBuf> {
        let list: Vec<String> = missing.iter().map(u32::to_string).collect();
        let prompt = format!(
            "Blocks {} are missing. Directory with more blocks (empty to give up): ",
            list.join(", ")
        );
        self.ask(&prompt)
            .filter(|a| !a.is_empty())
            .map(PathBuf::from)
    }
}
