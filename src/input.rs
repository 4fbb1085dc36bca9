use crate::alerts::AlertLedger;
use colored::Colorize;
use std::path::PathBuf;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Quit,
    Save,
    Reset,
}

impl Command {
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim().to_lowercase().as_str() {
            "q" => Some(Command::Quit),
            "s" => Some(Command::Save),
            "r" => Some(Command::Reset),
            _ => None,
        }
    }
}

/// Reads commands line by line until `q` or end of input. The only writer of
/// `running` and the only caller of `AlertLedger::reset`.
pub async fn run_input<R>(
    reader: R,
    running: watch::Sender<bool>,
    ledger: AlertLedger,
    log_path: PathBuf,
) where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("stdin закрыт, мониторинг останавливается");
                break;
            }
            Err(err) => {
                debug!(error = %err, "ошибка чтения stdin");
                break;
            }
        };

        match Command::parse(&line) {
            Some(Command::Quit) => {
                info!("получена команда выхода");
                break;
            }
            Some(Command::Save) => {
                println!(
                    "\n{}",
                    format!("✓ Данные сохраняются в {}", log_path.display()).green()
                );
            }
            Some(Command::Reset) => {
                match ledger.reset() {
                    0 => println!("\n{}", "✓ Алертов нет".green()),
                    dropped => {
                        println!("\n{}", format!("✓ Алерты сброшены ({dropped})").green())
                    }
                }
            }
            None => {}
        }
    }
    let _ = running.send(false);
}
