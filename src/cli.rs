//! Command-line options.

use clap::error::ErrorKind;
use clap::Parser;

/// Unlocks a YubiKey-class OATH token and establishes a password-protected
/// VPN connection using the computed TOTP code.
#[derive(Debug, Parser)]
#[command(name = "yubi-oath-vpn", version, about, disable_version_flag = true)]
pub struct Options {
    /// VPN connection identifier passed to the launcher.
    #[arg(short = 'c', long)]
    pub connection: String,

    /// Exact credential slot name on the token. Empty selects the first
    /// slot reported by the token.
    #[arg(short = 's', long, default_value = "")]
    pub slot: String,

    /// Print version metadata and exit.
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    pub version: (),

    /// Raise log verbosity.
    #[arg(long)]
    pub debug: bool,
}

/// Parses `argv`, exiting the process on failure.
///
/// `clap`'s own `Parser::parse()` exits with code 2 on a usage error; the
/// CLI contract in this crate calls for exit code 1, so the error path is
/// handled explicitly here. `--help`/`--version` still exit 0.
pub fn parse() -> Options {
    match Options::try_parse() {
        Ok(options) => options,
        Err(e) => {
            let _ = e.print();
            let ok = matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion);
            std::process::exit(if ok { 0 } else { 1 });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_required_connection_flag() {
        let options = Options::try_parse_from(["yubi-oath-vpn", "-c", "office-vpn"]).unwrap();
        assert_eq!(options.connection, "office-vpn");
        assert_eq!(options.slot, "");
        assert!(!options.debug);
    }

    #[test]
    fn parses_optional_slot_and_debug() {
        let options = Options::try_parse_from([
            "yubi-oath-vpn",
            "--connection",
            "office-vpn",
            "--slot",
            "work",
            "--debug",
        ])
        .unwrap();
        assert_eq!(options.slot, "work");
        assert!(options.debug);
    }

    #[test]
    fn missing_connection_is_a_usage_error() {
        let err = Options::try_parse_from(["yubi-oath-vpn"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }
}
