//! Renders the `prevue(1)` man page, plus one page per subcommand, into the
//! build output directory.

use std::io::Write;

use camino::Utf8PathBuf;
use cap_std::{ambient_authority, fs_utf8::Dir};
use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

const WATCHED: [&str; 2] = ["build.rs", "src/cli/mod.rs"];

fn render(command: clap::Command) -> Result<Vec<u8>, std::io::Error> {
    let mut page = Vec::new();
    Man::new(command).render(&mut page)?;
    Ok(page)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = std::io::stdout();
    for path in WATCHED {
        writeln!(stdout, "cargo:rerun-if-changed={path}")?;
    }

    let out_dir = Utf8PathBuf::from(std::env::var("OUT_DIR")?);
    let dir = Dir::open_ambient_dir(&out_dir, ambient_authority())?;

    let command = cli::Cli::command();
    for subcommand in command.get_subcommands() {
        let page_name = format!("prevue-{}.1", subcommand.get_name());
        dir.write(&page_name, render(subcommand.clone())?)?;
    }
    dir.write("prevue.1", render(command)?)?;

    Ok(())
}
