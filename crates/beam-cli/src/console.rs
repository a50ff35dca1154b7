/// Terminal glue: stdin prompts for the engine's `Authorizer` capability
/// and an indicatif bar for its `Progress` interface. The engine calls the
/// prompts on the blocking pool, so reading stdin here is fine.
use std::io::{self, Write};
use std::sync::Mutex;

use indicatif::{HumanBytes, ProgressBar, ProgressStyle};

use beam_protocol::TransferHeader;
use beam_transfer::{Authorizer, Progress};

pub struct ConsoleAuthorizer;

impl Authorizer for ConsoleAuthorizer {
    fn accept(&self, offer: &TransferHeader) -> bool {
        println!();
        if offer.is_tar() {
            println!("Incoming directory: {}", offer.filename);
        } else {
            println!(
                "Incoming file: {} ({})",
                offer.filename,
                HumanBytes(offer.total_size)
            );
        }
        let answer = prompt("Accept this transfer? (y/n): ").to_lowercase();
        matches!(answer.as_str(), "y" | "yes")
    }

    fn request_key(&self) -> String {
        prompt("Enter transfer key: ")
    }
}

fn prompt(message: &str) -> String {
    print!("{message}");
    let _ = io::stdout().flush();
    let mut line = String::new();
    let _ = io::stdin().read_line(&mut line);
    line.trim().to_owned()
}

/// One progress bar at a time; transfers on a single operator console do
/// not overlap in practice.
pub struct BarProgress {
    bar: Mutex<Option<ProgressBar>>,
}

impl BarProgress {
    pub fn new() -> BarProgress {
        BarProgress {
            bar: Mutex::new(None),
        }
    }
}

impl Progress for BarProgress {
    fn start(&self, total: Option<u64>, label: &str) {
        let bar = match total {
            Some(total) => {
                let bar = ProgressBar::new(total);
                bar.set_style(
                    ProgressStyle::with_template(
                        "{msg} [{bar:40}] {bytes}/{total_bytes} ({bytes_per_sec}, eta {eta})",
                    )
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
                );
                bar
            }
            None => {
                let bar = ProgressBar::new_spinner();
                bar.set_style(
                    ProgressStyle::with_template("{msg} {spinner} {bytes} ({bytes_per_sec})")
                        .unwrap_or_else(|_| ProgressStyle::default_spinner()),
                );
                bar
            }
        };
        bar.set_message(label.to_owned());
        *self.bar.lock().unwrap() = Some(bar);
    }

    fn advance(&self, n: u64) {
        if let Some(bar) = self.bar.lock().unwrap().as_ref() {
            bar.inc(n);
        }
    }

    fn finish(&self) {
        if let Some(bar) = self.bar.lock().unwrap().take() {
            bar.finish_and_clear();
        }
    }
}
