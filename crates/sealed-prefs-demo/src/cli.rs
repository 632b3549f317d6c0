use clap::{Parser, Subcommand, ValueEnum};

/// CLI surface of the demo host. Without a subcommand it runs the sample flow.
#[derive(Parser, Debug)]
#[command(
    name = "sealed-prefs",
    about = "Encrypted preference store demo",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Optional subcommand; defaults to the sample write/read flow when absent.
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Write `test = Hello` and read it back.
    Sample,
    /// Print version and exit.
    Version,
    /// Round-trip a probe value through the encrypted store.
    Health,
    /// Store a value.
    Put {
        key: String,
        /// Comma-separated members for `string-set`.
        value: String,
        #[arg(long, value_enum, default_value_t = ValueKind::String)]
        kind: ValueKind,
    },
    /// Read a value.
    Get {
        key: String,
        #[arg(long, value_enum, default_value_t = ValueKind::String)]
        kind: ValueKind,
    },
    /// Remove a value.
    Remove { key: String },
    /// Check whether a key is present (no decryption).
    Contains { key: String },
    /// Dump all entries by storage key.
    List,
    /// Manage demo configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    String,
    Int,
    Long,
    Float,
    Boolean,
    StringSet,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_sample_when_missing_subcommand() {
        let cli = Cli::try_parse_from(["sealed-prefs"]).expect("parse should succeed");
        assert_eq!(cli.command, None);
    }

    #[test]
    fn parses_health_subcommand() {
        let cli = Cli::try_parse_from(["sealed-prefs", "health"]).expect("parse should succeed");
        assert_eq!(cli.command, Some(Command::Health));
    }

    #[test]
    fn parses_put_with_kind() {
        let cli = Cli::try_parse_from(["sealed-prefs", "put", "count", "3", "--kind", "int"])
            .expect("parse should succeed");
        assert_eq!(
            cli.command,
            Some(Command::Put {
                key: "count".into(),
                value: "3".into(),
                kind: ValueKind::Int,
            })
        );
    }

    #[test]
    fn get_defaults_to_string_kind() {
        let cli = Cli::try_parse_from(["sealed-prefs", "get", "name"]).expect("parse");
        assert_eq!(
            cli.command,
            Some(Command::Get {
                key: "name".into(),
                kind: ValueKind::String,
            })
        );
    }

    #[test]
    fn parses_config_init_subcommand() {
        let cli =
            Cli::try_parse_from(["sealed-prefs", "config", "init"]).expect("parse should succeed");
        assert_eq!(cli.command, Some(Command::Config(ConfigCommand::Init)));
    }
}
