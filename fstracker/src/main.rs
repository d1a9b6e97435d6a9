use std::io::{self, BufRead, Write};

use clap::Parser;
use tracing::error;

use fstracker::config::cfg::Cfg;
use fstracker::fs_tracker::tracker::FsTracker;

#[derive(Parser, Debug)]
struct Args {
    /// Path of the config file; defaults apply when omitted.
    #[arg(short, long)]
    config: Option<String>,
    /// Overrides the configured listening port.
    #[arg(short, long)]
    port: Option<u16>,
}

fn main() {
    // install global collector configured based on RUST_LOG env var.
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let mut config = match args.config {
        Some(path) => Cfg::new(&path).expect("Config file not found or invalid"),
        None => Cfg::default(),
    };
    if let Some(port) = args.port {
        config.tcp_port = port;
    }

    run_shell(config);
}

fn run_shell(config: Cfg) {
    let mut tracker: Option<FsTracker> = None;
    let stdin = io::stdin();

    print_prompt();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        match line.trim() {
            "start" => match tracker {
                Some(_) => println!("tracker already running"),
                None => match FsTracker::start(config.clone()) {
                    Ok(started) => {
                        println!("tracker listening on {}", started.local_addr());
                        tracker = Some(started);
                    }
                    Err(err) => error!("could not start the tracker: {:?}", err),
                },
            },
            "stop" => match tracker.take() {
                Some(mut running) => {
                    if let Err(err) = running.drain() {
                        error!("could not drain the tracker: {:?}", err);
                    }
                }
                None => println!("tracker is not running"),
            },
            "exit" => break,
            "" => (),
            other => println!("unknown command: {}", other),
        }
        print_prompt();
    }

    if let Some(mut running) = tracker.take() {
        if let Err(err) = running.stop() {
            error!("could not stop the tracker: {:?}", err);
        }
    }
}

fn print_prompt() {
    print!("> ");
    let _ = io::stdout().flush();
}
