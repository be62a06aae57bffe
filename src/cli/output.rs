//! Output formatting for the psremote CLI
//!
//! Remote output goes to stdout untouched; diagnostics go to stderr, colored
//! unless disabled.

use colored::Colorize;

/// Output formatter for terminal diagnostics
pub struct OutputFormatter {
    /// Use colored output
    use_color: bool,
    /// Verbosity level
    verbosity: u8,
}

impl OutputFormatter {
    /// Create a new output formatter
    pub fn new(use_color: bool, verbosity: u8) -> Self {
        // Respect NO_COLOR environment variable
        let use_color = use_color && std::env::var("NO_COLOR").is_err();
        Self {
            use_color,
            verbosity,
        }
    }

    /// Print remote output as-is
    pub fn remote_output(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        if text.ends_with('\n') {
            print!("{}", text);
        } else {
            println!("{}", text);
        }
    }

    /// Print an error message
    pub fn error(&self, message: &str) {
        if self.use_color {
            eprintln!("{} {}", "ERROR:".red().bold(), message);
        } else {
            eprintln!("ERROR: {}", message);
        }
    }

    /// Print a warning message
    pub fn warning(&self, message: &str) {
        if self.use_color {
            eprintln!("{} {}", "WARNING:".yellow().bold(), message);
        } else {
            eprintln!("WARNING: {}", message);
        }
    }

    /// Print an info message (respects verbosity)
    pub fn info(&self, message: &str) {
        if self.verbosity < 1 {
            return;
        }
        if self.use_color {
            eprintln!("{} {}", "INFO:".cyan(), message);
        } else {
            eprintln!("INFO: {}", message);
        }
    }
}
