use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::bail;
use clap::Parser;
use dialsync::Config;
use dialsync::engine::Channel;
use dialsync::engine::Engine;
use dialsync::engine::EngineSettings;
use dialsync::engine::EntityId;
use dialsync::engine::UiEvent;
use dialsync::integrations::LoopbackHub;
use strum::IntoEnumIterator;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tracing::info;
use tracing::warn;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;

/// Dial-driven light control against a simulated hub.
///
/// Reads commands from stdin, one per line:
///   enter <entity>            open an entity's control view
///   leave                     close it, cancelling pending adjustments
///   tick <channel> <delta>    turn the dial (brightness, hue, saturation, color_temp)
///   power                     toggle on/off
///   white <cold|-> <warm|->   set RGBW/RGBWW white levels
///   show [entity]             print channel labels and the preview color
///   wait <ms>                 pause reading input
///   disconnect | connect      drop or restore the simulated hub connection
///   resync                    re-run discovery
///   quit
#[derive(Debug, Parser)]
#[command(name = "dialsync", version, verbatim_doc_comment)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Debug, PartialEq)]
enum Command {
    Enter(EntityId),
    Leave,
    Tick(Channel, i32),
    Power,
    White(Option<u8>, Option<u8>),
    Show(Option<EntityId>),
    Wait(Duration),
    Connect(bool),
    Resync,
    Quit,
}

fn parse_level(word: Option<&str>) -> anyhow::Result<Option<u8>> {
    match word {
        None | Some("-") => Ok(None),
        Some(w) => Ok(Some(w.parse().with_context(|| format!("bad level {:?}", w))?)),
    }
}

fn parse_command(line: &str) -> anyhow::Result<Option<Command>> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };

    let command = match verb {
        "enter" => Command::Enter(EntityId::new(words.next().context("enter needs an entity")?)),
        "leave" => Command::Leave,
        "tick" => {
            let channel = words.next().context("tick needs a channel")?;
            let channel: Channel = channel
                .parse()
                .with_context(|| format!("unknown channel {:?}", channel))?;
            let delta = words.next().context("tick needs a delta")?;
            let delta = delta
                .parse()
                .with_context(|| format!("bad delta {:?}", delta))?;
            Command::Tick(channel, delta)
        }
        "power" => Command::Power,
        "white" => Command::White(parse_level(words.next())?, parse_level(words.next())?),
        "show" => Command::Show(words.next().map(EntityId::new)),
        "wait" => {
            let ms = words.next().context("wait needs milliseconds")?;
            Command::Wait(Duration::from_millis(
                ms.parse().with_context(|| format!("bad duration {:?}", ms))?,
            ))
        }
        "connect" => Command::Connect(true),
        "disconnect" => Command::Connect(false),
        "resync" => Command::Resync,
        "quit" | "exit" => Command::Quit,
        other => bail!("unknown command {:?}", other),
    };

    Ok(Some(command))
}

fn show(engine: &Engine, id: &EntityId) {
    let caps = engine.capabilities(id);
    let labels: Vec<_> = Channel::iter()
        .filter(|channel| caps.allows(*channel))
        .map(|channel| format!("{}={}", channel, engine.current_display_value(id, channel)))
        .collect();
    println!(
        "{} {} preview={}",
        id,
        labels.join(" "),
        engine.current_preview_color(id)
    );
}

fn focused(engine: &Engine) -> anyhow::Result<EntityId> {
    engine.focused().context("no entity selected; use `enter <entity>`")
}

/// Returns `false` once the session should end.
async fn execute(engine: &Engine, hub: &LoopbackHub, command: Command) -> anyhow::Result<bool> {
    match command {
        Command::Enter(id) => {
            if let Some(previous) = engine.focused() {
                engine.leave_context(&previous);
            }
            engine.enter_context(&id).await;
            show(engine, &id);
        }
        Command::Leave => engine.leave_context(&focused(engine)?),
        Command::Tick(channel, delta) => {
            let id = focused(engine)?;
            if engine.apply_tick(&id, channel, delta).is_none() {
                println!("{} does not support {}", id, channel);
            } else {
                println!("{}={}", channel, engine.current_display_value(&id, channel));
            }
        }
        Command::Power => {
            let id = focused(engine)?;
            if let Err(e) = engine.toggle_power(&id).await {
                println!("power: {}", e);
            }
            println!("power={}", engine.current_display_value(&id, Channel::Power));
        }
        Command::White(cold, warm) => engine.set_white_levels(&focused(engine)?, cold, warm),
        Command::Show(Some(id)) => show(engine, &id),
        Command::Show(None) => {
            for id in engine.entity_ids() {
                show(engine, &id);
            }
        }
        Command::Wait(duration) => tokio::time::sleep(duration).await,
        Command::Connect(connected) => {
            hub.set_connected(connected);
            if connected {
                let refreshed = engine.resync().await?;
                println!("resynced {} entities", refreshed);
            }
        }
        Command::Resync => {
            let refreshed = engine.resync().await?;
            println!("resynced {} entities", refreshed);
        }
        Command::Quit => return Ok(false),
    }
    Ok(true)
}

async fn command_loop(engine: &Engine, hub: &LoopbackHub) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                println!("error: {:#}", e);
                continue;
            }
        };

        match execute(engine, hub, command).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => println!("error: {:#}", e),
        }
    }

    Ok(())
}

fn init_logging(config: &Config) {
    let mut targets = Targets::new().with_default(LevelFilter::from(config.logging.level));
    for (target, level) in &config.logging.overrides {
        targets = targets.with_target(target.clone(), LevelFilter::from(*level));
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(targets)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    init_logging(&config);

    info!("dialsync starting");
    if let Some(path) = &args.config {
        info!("Loaded config from: {}", path.display());
    }

    let hub = Arc::new(LoopbackHub::from_config(&config.simulator));
    let engine = Arc::new(Engine::new(hub.clone(), EngineSettings::from(&config.engine)));
    engine.start().await?;

    tokio::spawn({
        let engine = engine.clone();
        async move { engine.run().await }
    });

    let mut ui = engine.subscribe_ui();
    tokio::spawn({
        let engine = engine.clone();
        async move {
            loop {
                match ui.recv().await {
                    Ok(UiEvent::ChannelRefreshed { entity_id, channel }) => println!(
                        "{} {}={} (remote)",
                        entity_id,
                        channel,
                        engine.current_display_value(&entity_id, channel)
                    ),
                    Ok(UiEvent::DispatchFailed {
                        entity_id,
                        channel,
                        reason,
                    }) => println!("{} {} not sent: {}", entity_id, channel, reason),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("UI fell behind by {} events", n)
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    });

    tokio::select! {
        result = command_loop(&engine, &hub) => result?,
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    info!("dialsync shutting down");
    Ok(())
}
