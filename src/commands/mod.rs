mod config_cmd;
mod doc;
mod storage_cmd;
mod sync_cmd;

pub use config_cmd::ConfigCommand;
pub use doc::{ListCommand, ShowCommand};
pub use storage_cmd::{CleanupCommand, StatsCommand};
pub use sync_cmd::{StatusCommand, SyncCommand, WatchCommand};

use clap::ValueEnum;

#[derive(Clone, Copy, Debug, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// First eight characters of a secret, for display.
fn redact(secret: &str) -> String {
    let head: String = secret.chars().take(8).collect();
    format!("{}...", head)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_keeps_eight_chars() {
        assert_eq!(redact("abcdefghijkl"), "abcdefgh...");
        assert_eq!(redact("abc"), "abc...");
    }

    #[test]
    fn test_redact_multibyte_token() {
        // Byte 8 falls inside a character here
        assert_eq!(redact("ключ-доступа"), "ключ-дос...");
        assert_eq!(redact("🔑🔑🔑🔑🔑🔑🔑🔑🔑"), "🔑🔑🔑🔑🔑🔑🔑🔑...");
    }
}
