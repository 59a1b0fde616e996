//! Shell completion generation for the redgreen CLI.

use std::io;

use anyhow::Result;
use clap::CommandFactory;
use clap_complete::{Shell, generate};

use crate::cli::{Cli, CompletionShell};

fn shell(shell: CompletionShell) -> Shell {
    match shell {
        CompletionShell::Bash => Shell::Bash,
        CompletionShell::Zsh => Shell::Zsh,
        CompletionShell::Fish => Shell::Fish,
    }
}

pub fn write(target: CompletionShell, out: &mut dyn io::Write) -> Result<()> {
    let mut cmd = Cli::command();
    generate(shell(target), &mut cmd, "redgreen", out);
    Ok(())
}

pub fn print(target: CompletionShell) -> Result<()> {
    write(target, &mut io::stdout())
}
