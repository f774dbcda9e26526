use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, crate_version};

use crate::log::{Level, LogFormat};

#[derive(Parser, Debug)]
#[command(
    name = "dpitun",
    about = "Run a DPI bypass engine and keep the system proxy pointed at it",
    version = crate_version!()
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[command(flatten)]
    pub global_options: GlobalOptions,
}

#[derive(Args, Debug, Clone, Default)]
pub struct GlobalOptions {
    #[arg(
        long,
        global = true,
        env = "DPITUN_SETTINGS",
        value_name = "PATH",
        help = "Settings file to use instead of the per-user default."
    )]
    pub settings: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Enable additional debug logs.")]
    pub verbose: bool,

    #[arg(
        short,
        long,
        global = true,
        conflicts_with = "verbose",
        help = "Silence all logs"
    )]
    pub quiet: bool,

    #[arg(
        long,
        global = true,
        help = "Configure the output format of the logs.",
        default_value_t,
        value_enum
    )]
    pub log_format: LogFormat,
}

impl GlobalOptions {
    pub fn level(&self) -> Level {
        if self.verbose {
            Level::Debug
        } else if self.quiet {
            Level::Silent
        } else {
            Level::default()
        }
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    #[command(
        about = "Start the engine and keep it connected until interrupted.",
        long_about = "Start the engine and keep it connected until interrupted.\n\n\
            While running, type `connect`, `disconnect`, `status`, `logs`, `reload` or `quit` on stdin."
    )]
    Up {
        #[arg(long, help = "Wait for a `connect` command instead of connecting right away.")]
        no_connect: bool,
    },

    #[command(about = "Turn the system proxy off. Use this if browsing broke after a crash.")]
    ClearProxy,

    #[command(about = "Rank DNS providers by connect latency.")]
    Dns {
        #[arg(long, default_value_t = 2000, help = "Per-provider timeout in milliseconds.")]
        timeout_ms: u64,
    },

    #[command(about = "Print the effective settings as YAML.")]
    Settings {
        #[arg(long, help = "Print only the settings file path.")]
        path: bool,
    },

    #[command(about = "Report whether dpitun runs with administrator rights.")]
    CheckAdmin,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_options_after_subcommand() {
        let cli = Cli::try_parse_from([
            "dpitun",
            "up",
            "--no-connect",
            "-v",
            "--log-format",
            "json",
            "--settings",
            "/tmp/dpitun.yaml",
        ])
        .unwrap();

        assert_eq!(cli.command, Commands::Up { no_connect: true });
        assert_eq!(cli.global_options.level(), Level::Debug);
        assert_eq!(cli.global_options.log_format, LogFormat::Json);
        assert_eq!(
            cli.global_options.settings,
            Some(PathBuf::from("/tmp/dpitun.yaml"))
        );
    }

    #[test]
    fn verbose_and_quiet_conflict() {
        assert!(Cli::try_parse_from(["dpitun", "-v", "-q", "dns"]).is_err());
    }

    #[test]
    fn quiet_silences_logs() {
        let cli = Cli::try_parse_from(["dpitun", "--quiet", "clear-proxy"]).unwrap();
        assert_eq!(cli.command, Commands::ClearProxy);
        assert_eq!(cli.global_options.level(), Level::Silent);
    }
}
