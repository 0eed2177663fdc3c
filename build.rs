//! Renders `monkey-core` man pages into the build output directory.
//!
//! One page covers the top-level command and one page is written per
//! subcommand, named `monkey-core-<subcommand>.1`.

use std::env;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

use cli::Cli;

fn render(command: clap::Command, title: &str, out_dir: &Path) -> io::Result<()> {
    let mut buffer = Vec::new();
    Man::new(command).title(title).render(&mut buffer)?;
    File::create(out_dir.join(format!("{title}.1")))?.write_all(&buffer)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = io::stdout();
    writeln!(stdout, "cargo:rerun-if-changed=build.rs")?;
    writeln!(stdout, "cargo:rerun-if-changed=src/cli/mod.rs")?;

    let out_dir = PathBuf::from(
        env::var_os("OUT_DIR")
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "OUT_DIR was not set"))?,
    );

    let command = Cli::command();
    let root = command.get_name().to_owned();
    for sub in command.get_subcommands() {
        let title = format!("{root}-{}", sub.get_name());
        render(sub.clone(), &title, &out_dir)?;
    }
    render(command, &root, &out_dir)?;

    Ok(())
}
