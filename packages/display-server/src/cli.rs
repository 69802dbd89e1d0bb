use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use glam::{Quat, Vec3};
use std::path::{Path, PathBuf};

use crate::config::{DisplayServerConfig, ViewerConfig};
use crate::display_server::DisplayServer;
use crate::gpu::GpuPresenter;
use crate::stimulus::{MessageEnvelope, StimulusRegistry, TopicRouter};
use crate::viewer::{OffscreenViewer, Viewer};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the display loop headlessly for a fixed number of frames
    Render {
        /// Display server configuration (JSON)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Viewer configuration (JSON); overrides --width/--height
        #[arg(long)]
        viewer: Option<PathBuf>,

        #[arg(long, default_value_t = 800)]
        width: u32,

        #[arg(long, default_value_t = 600)]
        height: u32,

        /// Number of frames to produce
        #[arg(long, default_value_t = 120)]
        frames: u64,

        /// Simulated frames per second
        #[arg(long, default_value_t = 60.0)]
        fps: f64,

        /// Write every frame into this directory
        #[arg(long)]
        out: Option<PathBuf>,

        /// Stimulus to activate before the first frame
        #[arg(long)]
        stimulus: Option<String>,

        /// JSON-lines message stream ({"topic", "payload", "plugin"?, "frame"?})
        #[arg(long)]
        messages: Option<PathBuf>,

        /// Save the last frame as an image
        #[arg(long)]
        capture: Option<PathBuf>,

        /// Save the last frame's scene description as JSON
        #[arg(long)]
        capture_scene: Option<PathBuf>,

        /// Restore and save viewer session state here
        #[arg(long)]
        session: Option<PathBuf>,

        /// Present through the GPU instead of in memory
        #[arg(long)]
        gpu: bool,

        /// Fixed observer position "x,y,z"
        #[arg(long, default_value = "0,0,0")]
        position: String,

        #[arg(long)]
        gamma: Option<f32>,

        #[arg(long)]
        red_max: bool,
    },
    /// List discovered stimulus plugins and their topics
    Plugins {
        /// Directory of script plugins
        #[arg(long)]
        plugin_path: Option<PathBuf>,
    },
}

struct RenderArgs {
    config: Option<PathBuf>,
    viewer: Option<PathBuf>,
    width: u32,
    height: u32,
    frames: u64,
    fps: f64,
    out: Option<PathBuf>,
    stimulus: Option<String>,
    messages: Option<PathBuf>,
    capture: Option<PathBuf>,
    capture_scene: Option<PathBuf>,
    session: Option<PathBuf>,
    gpu: bool,
    position: Vec3,
    gamma: Option<f32>,
    red_max: bool,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Render {
            config,
            viewer,
            width,
            height,
            frames,
            fps,
            out,
            stimulus,
            messages,
            capture,
            capture_scene,
            session,
            gpu,
            position,
            gamma,
            red_max,
        } => {
            let position = parse_position(&position)?;
            render(RenderArgs {
                config,
                viewer,
                width,
                height,
                frames,
                fps,
                out,
                stimulus,
                messages,
                capture,
                capture_scene,
                session,
                gpu,
                position,
                gamma,
                red_max,
            })?;
        }
        Commands::Plugins { plugin_path } => list_plugins(plugin_path.as_deref()),
    }
    Ok(())
}

fn render(args: RenderArgs) -> Result<()> {
    if args.fps <= 0.0 {
        return Err(anyhow!("--fps must be positive"));
    }
    let mut config = match &args.config {
        Some(path) => DisplayServerConfig::from_file(path)?,
        None => DisplayServerConfig::default(),
    };
    if args.stimulus.is_some() {
        config.initial_stimulus = args.stimulus.clone();
    }

    let viewer_json = match &args.viewer {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading viewer config {}", path.display()))?,
        None => serde_json::to_string(&ViewerConfig {
            width: args.width,
            height: args.height,
            ..ViewerConfig::default()
        })?,
    };

    let mut messages = match &args.messages {
        Some(path) => read_messages(path)?,
        None => Vec::new(),
    };
    messages.sort_by_key(|m| m.frame.unwrap_or(0));
    let mut pending = messages.into_iter().peekable();

    let mut server = DisplayServer::new(config)?;
    for failure in server.plugin_load_failures() {
        log::warn!("{}: {}", failure.source.display(), failure.reason);
    }

    let viewer: Box<dyn Viewer> = if args.gpu {
        let mut presenter = GpuPresenter::new();
        if let Some(dir) = &args.out {
            presenter = presenter.with_output_dir(dir.clone());
        }
        Box::new(presenter)
    } else {
        let mut offscreen = OffscreenViewer::new();
        if let Some(dir) = &args.out {
            offscreen = offscreen.with_output_dir(dir.clone());
        }
        Box::new(offscreen)
    };
    server.setup_viewer(viewer, &viewer_json)?;

    if let Some(path) = &args.session {
        if path.exists() {
            server.load_session(path)?;
            log::info!("Restored session from {}", path.display());
        }
    }
    if let Some(gamma) = args.gamma {
        server.set_gamma(gamma)?;
    }
    server.set_red_max(args.red_max);

    let dt = 1.0 / args.fps;
    for frame in 0..args.frames {
        while let Some(message) = pending.next_if(|m| m.frame.unwrap_or(0) <= frame) {
            deliver(&mut server, &message);
        }

        server.update(frame as f64 * dt, args.position, Quat::IDENTITY)?;

        if frame + 1 == args.frames {
            if let Some(path) = &args.capture {
                server.set_capture_image_filename(path);
            }
            if let Some(path) = &args.capture_scene {
                server.set_capture_scene_filename(path);
            }
        }

        server.frame()?;

        if frame % 60 == 0 {
            log::info!(
                "Frame {}/{} ({}, {:.1} fps)",
                frame,
                args.frames,
                server.current_stimulus_name(),
                server.frame_rate()
            );
        }
        if server.done() {
            break;
        }
    }

    if let Some(path) = &args.session {
        server.save_session(path)?;
    }
    if server.handler_failures() > 0 {
        log::warn!("{} messages failed in their handlers", server.handler_failures());
    }
    println!("Rendered {} frames", server.frame_count());
    Ok(())
}

/// Hand one scripted message to the server. A message for a plugin that was
/// never discovered is logged and skipped.
fn deliver(server: &mut DisplayServer, message: &MessageEnvelope) {
    let json = message.payload.to_string();
    match &message.plugin {
        Some(plugin) => {
            if let Err(e) = server.stimulus_receive_json_message(plugin, &message.topic, &json) {
                log::warn!("Skipping message on '{}': {}", message.topic, e);
            }
        }
        None => server.topic_receive_json_message(&message.topic, &json),
    }
}

fn list_plugins(plugin_path: Option<&Path>) {
    let registry = StimulusRegistry::discover(plugin_path);
    let router = TopicRouter::new(&registry);
    for name in registry.list_plugin_names() {
        println!("{}", name);
        for topic in router.topics_of(&name).unwrap_or_default() {
            let message_type = router.message_type_of(&name, &topic).unwrap_or_default();
            println!("    {:<24} {}", topic, message_type);
        }
    }
    for failure in registry.load_failures() {
        println!("failed: {} ({})", failure.source.display(), failure.reason);
    }
}

fn read_messages(path: &Path) -> Result<Vec<MessageEnvelope>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading messages {}", path.display()))?;
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            MessageEnvelope::parse_line(line)
                .with_context(|| format!("{}:{}", path.display(), i + 1))
        })
        .collect()
}

fn parse_position(text: &str) -> Result<Vec3> {
    let parts = text
        .split(',')
        .map(|p| p.trim().parse::<f32>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| anyhow!("position '{}' is not x,y,z", text))?;
    match parts.as_slice() {
        [x, y, z] => Ok(Vec3::new(*x, *y, *z)),
        _ => Err(anyhow!("position '{}' is not x,y,z", text)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_position() {
        assert_eq!(parse_position("1, 2.5,-3").unwrap(), Vec3::new(1.0, 2.5, -3.0));
        assert!(parse_position("1,2").is_err());
        assert!(parse_position("a,b,c").is_err());
    }

    #[test]
    fn test_message_for_unknown_plugin_is_skipped() {
        let mut server = DisplayServer::new(DisplayServerConfig::default()).unwrap();
        let stream = [
            r#"{"plugin": "NoSuchStimulus", "topic": "background_color", "payload": {}}"#,
            r#"{"plugin": "StimulusStandby", "topic": "background_color", "payload": "red"}"#,
        ];
        for line in stream {
            deliver(&mut server, &MessageEnvelope::parse_line(line).unwrap());
        }
        // The second message was still handed over, and its bad payload counted.
        assert_eq!(server.handler_failures(), 1);
    }

    #[test]
    fn test_cli_parses_render_flags() {
        let cli = Cli::try_parse_from([
            "display-server",
            "render",
            "--frames",
            "3",
            "--stimulus",
            "Stimulus3DDemo",
            "--red-max",
        ])
        .unwrap();
        match cli.command {
            Commands::Render {
                frames,
                stimulus,
                red_max,
                gpu,
                ..
            } => {
                assert_eq!(frames, 3);
                assert_eq!(stimulus.as_deref(), Some("Stimulus3DDemo"));
                assert!(red_max);
                assert!(!gpu);
            }
            _ => panic!("expected render"),
        }
    }
}
