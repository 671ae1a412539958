//! Build script for generating the `ruslan` man pages.
//!
//! Packaging picks the pages up from the build output directory: one for the
//! top-level command and one per subcommand.

use std::env;
use std::io::Write;

use camino::Utf8PathBuf;
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

use cli::Cli;

fn render(man: &Man) -> Result<Vec<u8>, std::io::Error> {
    let mut rendered = Vec::new();
    man.render(&mut rendered)?;
    Ok(rendered)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = std::io::stdout();
    writeln!(stdout, "cargo:rerun-if-changed=build.rs")?;
    writeln!(stdout, "cargo:rerun-if-changed=src/cli/mod.rs")?;

    let out_dir = Utf8PathBuf::from(env::var("OUT_DIR")?);
    let output = Dir::open_ambient_dir(&out_dir, ambient_authority())?;

    let command = Cli::command();
    output.write("ruslan.1", render(&Man::new(command.clone()))?)?;
    for subcommand in command.get_subcommands() {
        let title = format!("ruslan-{}", subcommand.get_name());
        let page = Man::new(subcommand.clone()).title(title.clone());
        output.write(format!("{title}.1"), render(&page)?)?;
    }

    Ok(())
}
