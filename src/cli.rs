use clap::{Parser, Subcommand};

/// Disable automatic checkpoints on every newly created Hyper-V virtual machine.
#[derive(Parser, Debug)]
#[command(name = "hvckpt", version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Watch the Hyper-V admin log and disable checkpoints on new VMs until stopped
    Register {
        /// Mirror per-VM diagnostics to this terminal
        #[arg(short, long)]
        verbose: bool,
    },

    /// Cancel the subscription owned by this process
    Unregister,

    /// Start `register` at every boot through a scheduled task
    InstallBootTask,

    /// Delete the boot-time scheduled task
    RemoveBootTask,
}

impl Command {
    pub fn verbose(&self) -> bool {
        matches!(self, Command::Register { verbose: true })
    }
}
