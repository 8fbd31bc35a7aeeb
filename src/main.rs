//! The main CLI logic.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::io::{IsTerminal, Write};

use anyhow::{bail, Result};
use camino::Utf8PathBuf;
use clap::Parser;
use termcolor::WriteColor;

use etcmerge::{build_new_etc, BuildRoots, HandlerRegistry};

#[derive(Debug, Parser)]
#[clap(name = "etcmerge", version)]
#[clap(about = "Rebuild the writable /etc overlay of an image-based system")]
enum Opt {
    /// Build an etc overlay based on the given system and user etc trees.
    ///
    /// Directories are given in the order: old system etc, new system etc,
    /// old user overlay, new (target) user overlay.
    Build { dirs: Vec<Utf8PathBuf> },
}

fn run() -> Result<()> {
    match Opt::parse() {
        Opt::Build { dirs } => {
            if dirs.len() < 4 {
                bail!("not enough directories specified");
            }
            let roots = BuildRoots {
                lower_old: dirs[0].clone().into_std_path_buf(),
                lower_new: dirs[1].clone().into_std_path_buf(),
                upper_old: dirs[2].clone().into_std_path_buf(),
                upper_new: dirs[3].clone().into_std_path_buf(),
            };
            // The engine ships no handlers; library users register theirs here.
            let handlers = HandlerRegistry::new();
            build_new_etc(&roots, &handlers)
        }
    }
}

// Report a fatal build error on stderr, with a red prefix on a tty. The
// whole context chain is flattened onto one line.
fn print_error(err: &anyhow::Error) {
    let choice = if std::io::stderr().is_terminal() {
        termcolor::ColorChoice::Auto
    } else {
        termcolor::ColorChoice::Never
    };
    let mut stderr = termcolor::StandardStream::stderr(choice);
    let mut prefix_color = termcolor::ColorSpec::new();
    prefix_color.set_fg(Some(termcolor::Color::Red));
    let _ = stderr.set_color(&prefix_color);
    let _ = write!(stderr, "error: ");
    let _ = stderr.reset();
    let _ = writeln!(stderr, "{:#}", err);
}

fn main() {
    // Logging goes to stderr; no timestamps and no targets, the journal
    // already records both.
    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .with_ansi(std::io::stderr().is_terminal())
        .compact();
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .event_format(format)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        print_error(&e);
        std::process::exit(1);
    }
}
