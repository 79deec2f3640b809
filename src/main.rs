/*!
Per-node **machine config** reconciler.

Watches the desired machine configuration for this node, and when it
diverges from what is on disk, drives the node through a safe update:
drain, stage files/units/OS image, persist the pending record, reboot,
and on the next boot validate that the new state actually applied.

Refs:
 * <https://github.com/openshift/machine-config-operator>
!*/

#![deny(unused_must_use)]

mod cli;
mod cluster;
mod daemon;
mod files;
mod health;
mod imageref;
mod journal;
mod model;
mod oncefrom;
mod osupdater;
mod resolver;
mod statefile;
#[cfg(test)]
mod testutil;
mod updater;
mod util;
mod validator;

use clap::Parser;

fn main() {
    let exit_code = run_cli();
    std::process::exit(exit_code);
}

fn run_cli() -> i32 {
    let cli_opts = cli::Command::parse();

    // journald stamps every line itself, so no timestamps of our own.
    env_logger::Builder::from_default_env()
        .format_timestamp(None)
        .format_module_path(false)
        .filter(None, cli_opts.loglevel())
        .init();

    match cli_opts.run() {
        Ok(_) => libc::EXIT_SUCCESS,
        Err(e) => {
            // {:#} flattens the whole context chain onto one line.
            eprintln!("error: {:#}", e);
            libc::EXIT_FAILURE
        }
    }
}
