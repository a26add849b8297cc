use std::{
    env,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use realtime_rtc::{
    model::Recording, util::init_log, Direction, Event, RelayConfig, RelayError, RelayUpdate,
    SessionRelay,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() > 1 {
        match args[1].as_str() {
            "chat" => match parse_options(&args[2..]) {
                Ok(options) => {
                    if let Err(e) = chat(options) {
                        println!("Session error:\n{:#}", e);
                    }
                }
                Err(e) => {
                    println!("{}\n", e);
                    print_usage();
                }
            },
            _ => {
                print_usage();
            }
        }
    } else {
        print_usage();
    }
}

fn print_usage() {
    println!("Realtime RTC");
    println!("Usage:");
    println!("  realtime-rtc chat [options]  - Start a text session with the realtime model");
    println!();
    println!("Options:");
    println!("  --token-url URL      Ephemeral credential endpoint (default http://localhost:3000/token)");
    println!("  --realtime-url URL   Negotiation endpoint");
    println!("  --model NAME         Realtime model");
    println!("  --audio              Record remote audio");
    println!("  --record PATH        Write the recording as length-prefixed Opus payloads");
    println!();
    println!("In a session, type a message to send it, or:");
    println!("  /event {{json}}        Send a raw client event");
    println!("  /log                 Print the event log");
    println!("  /stop                End the session");
}

#[derive(Debug)]
struct ChatOptions {
    config: RelayConfig,
    record: Option<PathBuf>,
}

fn parse_options(args: &[String]) -> Result<ChatOptions> {
    let mut config = RelayConfig::default();
    let mut record = None;
    let mut args = args.iter();

    while let Some(arg) = args.next() {
        let mut value = || {
            args.next()
                .cloned()
                .with_context(|| format!("{arg} needs a value"))
        };
        match arg.as_str() {
            "--token-url" => config.token_url = value()?,
            "--realtime-url" => config.realtime_url = value()?,
            "--model" => config.model = value()?,
            "--audio" => config.audio_enabled = true,
            "--record" => record = Some(PathBuf::from(value()?)),
            other => bail!("Unknown option: {other}"),
        }
    }

    if record.is_some() && !config.audio_enabled {
        bail!("--record needs --audio");
    }

    Ok(ChatOptions { config, record })
}

#[tokio::main]
async fn chat(options: ChatOptions) -> Result<()> {
    init_log();

    let relay = SessionRelay::spawn(options.config);

    let mut updates = relay.subscribe();
    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(RelayUpdate::Logged(entry)) if entry.direction == Direction::Server => {
                    println!("<- {}", entry.event);
                }
                Ok(RelayUpdate::StateChanged(state)) => println!("-- session {}", state),
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => println!("-- skipped {} updates", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    relay.start().await.context("Starting session")?;
    println!("-- negotiated, waiting for the data channel to open");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => continue,
            "/stop" => break,
            "/log" => {
                for entry in relay.events().await? {
                    let arrow = match entry.direction {
                        Direction::Client => "->",
                        Direction::Server => "<-",
                    };
                    println!("{} {} {}", entry.timestamp.format("%H:%M:%S"), arrow, entry.event);
                }
            }
            _ => {
                if let Some(raw) = line.strip_prefix("/event ") {
                    match serde_json::from_str::<serde_json::Value>(raw)
                        .map_err(RelayError::from)
                        .and_then(Event::from_value)
                    {
                        Ok(event) => relay.send(event)?,
                        Err(e) => println!("-- not a valid event: {}", e),
                    }
                } else {
                    relay.send_text(line)?;
                }
            }
        }
    }

    let recording = relay.stop().await?;
    if let (Some(recording), Some(path)) = (recording, options.record) {
        write_recording(&recording, &path)
            .with_context(|| format!("Writing recording to {}", path.display()))?;
        println!(
            "-- wrote {} chunks ({} bytes) to {}",
            recording.chunks.len(),
            recording.len_bytes(),
            path.display()
        );
    }

    Ok(())
}

fn write_recording(recording: &Recording, path: &Path) -> Result<()> {
    let mut out = Vec::with_capacity(recording.len_bytes() + 4 * recording.chunks.len());
    for chunk in &recording.chunks {
        out.extend_from_slice(&(chunk.len() as u32).to_be_bytes());
        out.extend_from_slice(chunk);
    }
    std::fs::write(path, out)?;
    Ok(())
}
