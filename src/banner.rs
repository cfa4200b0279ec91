//! Startup banner: ASCII logo and configuration summary.

use std::io::{self, IsTerminal, Write};

use crate::broker::Broker;
use crate::config::Config;
use crate::serializer::Serializer;

const LOGO: &str = r#"
 _           _        _
| |__   ___ | | _____| |__   ___  _   _
| '_ \ / _ \| |/ / __| '_ \ / _ \| | | |
| |_) | (_) |   < (__| | | | (_) | |_| |
|_.__/ \___/|_|\_\___|_| |_|\___/ \__, |
                                  |___/
"#;

const GREEN: &str = "\x1b[32;1m";
const BLUE: &str = "\x1b[34;1m";
const RESET: &str = "\x1b[0m";

/// Write the hello banner to stdout. Colors are applied only when stdout
/// is a terminal.
pub(crate) fn display(
    broker: &dyn Broker,
    serializer: &dyn Serializer,
    config: &Config,
    queue_names: &[String],
) {
    let stdout = io::stdout();
    let colored = stdout.is_terminal();
    let mut out = stdout.lock();
    let _ = write_banner(&mut out, broker, serializer, config, queue_names, colored);
}

fn write_banner(
    out: &mut impl Write,
    broker: &dyn Broker,
    serializer: &dyn Serializer,
    config: &Config,
    queue_names: &[String],
    colored: bool,
) -> io::Result<()> {
    let (green, blue, reset) = if colored {
        (GREEN, BLUE, RESET)
    } else {
        ("", "", "")
    };

    writeln!(out, "{green}{LOGO}{reset}")?;
    writeln!(out, "{blue}  [config]{reset}")?;
    writeln!(out, "  - Version:         v{}", env!("CARGO_PKG_VERSION"))?;
    writeln!(out, "  - Broker:          {broker}")?;
    writeln!(
        out,
        "  - Serializer:      {} (human-readable: {})",
        serializer.name(),
        serializer.is_human_readable()
    )?;
    writeln!(out, "  - Concurrency:     {}", config.worker_slots())?;
    writeln!(out, "  - Max retries:     {}", config.max_retries)?;
    writeln!(
        out,
        "  - Retry intervals: {}",
        config.retry_intervals_display()
    )?;
    writeln!(out, "  - TTL:             {:?}", config.ttl)?;
    match config.countdown {
        Some(countdown) => writeln!(out, "  - Countdown:       {countdown:?}")?,
        None => writeln!(out, "  - Countdown:       none")?,
    }
    writeln!(out, "  - Timeout:         {:?}", config.timeout)?;

    if !queue_names.is_empty() {
        writeln!(out, "\n{blue}  [queues]{reset}")?;
        for name in queue_names {
            writeln!(out, "  - {name}")?;
        }
    }

    writeln!(out)
}
