//! Command line interface definition using clap.
//!
//! This module defines the [`Cli`] structure and its subcommands. Only
//! `gen` drives the generator; the remaining commands are small helpers
//! invoked from generated Makefile recipes.

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand, ValueEnum};

/// Maximum number of jobs accepted by the CLI.
const MAX_JOBS: usize = 256;

fn parse_jobs(s: &str) -> Result<usize, String> {
    let value: usize = s
        .parse()
        .map_err(|_| format!("{s} is not a valid number"))?;
    if (1..=MAX_JOBS).contains(&value) {
        Ok(value)
    } else {
        Err(format!("jobs must be between 1 and {MAX_JOBS}"))
    }
}

/// Generate Makefiles and compilation databases from BUILD files.
#[derive(Debug, Parser)]
#[command(name = "jk", author, version, about, long_about = None)]
pub struct Cli {
    /// Change to this directory before doing anything.
    #[arg(short = 'C', long, value_name = "DIR")]
    pub directory: Option<Utf8PathBuf>,

    /// Number of worker threads used while generating.
    #[arg(short, long, value_name = "N", value_parser = parse_jobs)]
    pub jobs: Option<usize>,

    /// Enable verbose logging output.
    #[arg(short, long)]
    pub verbose: bool,

    /// Subcommand to execute; defaults to `gen` when omitted.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    /// Apply the default command if none was specified.
    #[must_use]
    pub fn with_default_command(mut self) -> Self {
        if self.command.is_none() {
            self.command = Some(Commands::Gen(GenArgs::default()));
        }
        self
    }
}

/// Arguments accepted by the `gen` command.
#[derive(Debug, Args, Default, PartialEq, Eq, Clone)]
pub struct GenArgs {
    /// Directory receiving generated files, relative to the project root.
    #[arg(long, value_name = "DIR")]
    pub build_root: Option<Utf8PathBuf>,

    /// Build type to generate; may be repeated.
    #[arg(long = "build-type", value_name = "TYPE")]
    pub build_types: Vec<String>,

    /// Output format to generate; may be repeated.
    #[arg(long = "format", value_name = "FORMAT")]
    pub formats: Vec<String>,

    /// BUILD files to start from. Defaults to the project's root BUILD file.
    #[arg(value_name = "FILE")]
    pub files: Vec<Utf8PathBuf>,
}

/// Colours understood by `echo-color`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Color {
    /// ANSI red.
    Red,
    /// ANSI green.
    Green,
    /// ANSI yellow.
    Yellow,
    /// ANSI blue.
    Blue,
}

impl Color {
    /// ANSI SGR code of the colour.
    #[must_use]
    pub const fn ansi_code(self) -> u8 {
        match self {
            Self::Red => 31,
            Self::Green => 32,
            Self::Yellow => 33,
            Self::Blue => 34,
        }
    }
}

/// Available top-level commands.
#[derive(Debug, Subcommand, PartialEq, Eq, Clone)]
pub enum Commands {
    /// Generate build scripts (default).
    Gen(GenArgs),

    /// Print the version.
    Version,

    /// Remove files or directories, ignoring ones that do not exist.
    DeleteFile {
        /// Paths to remove.
        #[arg(value_name = "PATH", required = true)]
        paths: Vec<Utf8PathBuf>,
    },

    /// Print text in colour.
    EchoColor {
        /// Colour to use.
        #[arg(value_enum)]
        color: Color,
        /// Words to print, separated by spaces.
        #[arg(value_name = "TEXT", trailing_var_arg = true)]
        text: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("jk").chain(args.iter().copied()))
            .expect("valid arguments")
            .with_default_command()
    }

    #[rstest]
    fn gen_is_the_default_command() {
        assert_eq!(parse(&[]).command, Some(Commands::Gen(GenArgs::default())));
    }

    #[rstest]
    fn gen_collects_repeated_flags() {
        let cli = parse(&[
            "-j",
            "4",
            "gen",
            "--build-type",
            "debug",
            "--build-type",
            "RELEASE",
            "--format",
            "makefile",
            "app/BUILD",
        ]);
        assert_eq!(cli.jobs, Some(4));
        let Some(Commands::Gen(args)) = cli.command else {
            panic!("expected gen");
        };
        assert_eq!(args.build_types, vec!["debug", "RELEASE"]);
        assert_eq!(args.formats, vec!["makefile"]);
        assert_eq!(args.files, vec![Utf8PathBuf::from("app/BUILD")]);
    }

    #[rstest]
    #[case("0")]
    #[case("257")]
    #[case("many")]
    fn invalid_job_counts_are_rejected(#[case] jobs: &str) {
        assert!(Cli::try_parse_from(["jk", "-j", jobs]).is_err());
    }

    #[rstest]
    fn echo_color_takes_trailing_words() {
        let cli = parse(&["echo-color", "green", "Running", "pkg/t@DEFAULT"]);
        assert_eq!(
            cli.command,
            Some(Commands::EchoColor {
                color: Color::Green,
                text: vec!["Running".to_owned(), "pkg/t@DEFAULT".to_owned()],
            })
        );
    }
}
