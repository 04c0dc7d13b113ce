#[macro_use]
extern crate log;

use anyhow::{Context, Result};
use rsdisconnect::args::Args;
use rsdisconnect::{Error, TerminationEngine};
use std::io::{self, BufRead};
use structopt::StructOpt;

fn trigger(engine: &TerminationEngine) {
    match engine.trigger() {
        Ok(n) => println!("[+] Sent resets to {} connection(s)", n),
        Err(Error::Debounced) => println!("[-] Already logging out, ignored"),
        Err(Error::NoConnection) => println!("[-] No game connection found"),
        Err(e) => eprintln!("[-] Logout failed: {}", e),
    }
}

fn run() -> Result<()> {
    let args = Args::from_args();

    if args.quiet == 0 && std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "rsdisconnect=debug");
    }

    env_logger::init();

    trace!("arguments: {:?}", args);

    let config = args.into_config();
    let mut engine = TerminationEngine::start(config).context("failed to start")?;

    println!("[+] Ready on the {}, hotkey is {}", engine.layer(), engine.config().hotkey);
    println!("Press enter to logout, `status` lists connections, ^D exits.");

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;

        if !engine.is_running() {
            info!("engine is stopped, starting a new one");
            engine = engine.restart().context("failed to reinitialize")?;
        }

        match line.trim() {
            "" | "t" | "logout" => trigger(&engine),
            "status" => println!("{}", engine.connection_summary()),
            "restart" => {
                engine = engine.restart().context("failed to restart")?;
                println!("[+] Restarted on the {}", engine.layer());
            }
            cmd => println!("[-] Unknown command: {:?}", cmd),
        }
    }

    if !engine.stop() {
        warn!("some background threads did not exit in time");
    }
    println!("Exiting..");

    Ok(())
}

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {}", err);
        for cause in err.chain().skip(1) {
            eprintln!("Because: {}", cause);
        }
        std::process::exit(1);
    }
}
