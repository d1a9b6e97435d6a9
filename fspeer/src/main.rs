use std::io::{self, BufRead, Write};
use std::path::Path;

use clap::Parser;

use fspeer::config::cfg::Cfg;
use fspeer::fs_peer::peer::FsPeer;
use wire::payload::Credentials;

#[derive(Parser, Debug)]
struct Args {
    /// Path of the config file; defaults apply when omitted.
    #[arg(short, long)]
    config: Option<String>,
}

fn main() {
    // install global collector configured based on RUST_LOG env var.
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = match args.config {
        Some(path) => Cfg::new(&path).expect("Config file not found or invalid"),
        None => Cfg::default(),
    };

    run_shell(FsPeer::new(config));
}

fn run_shell(peer: FsPeer) {
    let stdin = io::stdin();

    print_prompt();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            ["set", "tracker", host, port] => match port.parse::<u16>() {
                Ok(port) => report(peer.set_tracker(host, port)),
                Err(_) => println!("invalid port: {}", port),
            },
            ["set", "shared_directory", path] => {
                report(peer.set_shared_directory(Path::new(path)))
            }
            ["register", username, password] => {
                report(peer.register(&Credentials::new(username, password)))
            }
            ["login", username, password] => {
                report(peer.login(&Credentials::new(username, password)))
            }
            ["logout"] => report(peer.logout()),
            ["download", filename] => report(peer.add_download(filename)),
            ["log"] => {
                for record in peer.download_log() {
                    println!(
                        "{}: download {:?}, acknowledge {:?}",
                        record.filename, record.download_status, record.ack_status
                    );
                }
            }
            ["exit"] => break,
            [] => (),
            other => println!("unknown command: {}", other.join(" ")),
        }
        print_prompt();
    }

    if peer.session_id().is_some() {
        peer.logout();
    }
}

fn report(outcome: bool) {
    println!("{}", if outcome { "ok" } else { "failed" });
}

fn print_prompt() {
    print!("> ");
    let _ = io::stdout().flush();
}
