// SPDX-License-Identifier: GPL-3.0-only

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cli;

#[derive(Parser)]
#[command(name = "camera-hal")]
#[command(about = "V4L2 camera HAL bring-up tool")]
#[command(version = env!("GIT_VERSION"))]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List V4L2 video devices
    Devices,

    /// Inspect or route the media controller graph
    Media {
        /// Media device (default: from configuration)
        #[arg(short, long)]
        device: Option<String>,

        #[command(subcommand)]
        command: MediaCommands,
    },

    /// Stream frames from a video node
    Stream {
        /// Video node to stream from
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,

        #[arg(long, default_value = "1920")]
        width: u32,

        #[arg(long, default_value = "1080")]
        height: u32,

        /// Pixel format fourcc
        #[arg(short, long, default_value = "NV12")]
        format: String,

        /// Buffers in the pool
        #[arg(short, long, default_value = "4")]
        buffers: usize,

        /// Frames to grab
        #[arg(short = 'n', long, default_value = "30")]
        frames: u32,

        /// Raw dump file or directory
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Frame rate to request from the driver
        #[arg(long)]
        fps: Option<f32>,
    },

    /// Print the effective configuration
    Config,
}

#[derive(Subcommand)]
enum MediaCommands {
    /// Show media device identity
    Info,
    /// List entities
    Entities,
    /// List links of an entity
    Links { entity: String },
    /// Disable every mutable link
    ResetLinks,
    /// Enable (or disable) a link
    Link {
        source: String,
        source_pad: u16,
        sink: String,
        sink_pad: u16,
        #[arg(long)]
        disable: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // RUST_LOG overrides the default level
    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(true)
        .with_level(true)
        .init();

    match cli.command {
        Commands::Devices => cli::list_devices(),
        Commands::Media { device, command } => {
            let device = device.as_deref();
            match command {
                MediaCommands::Info => cli::media_info(device),
                MediaCommands::Entities => cli::media_entities(device),
                MediaCommands::Links { entity } => cli::media_links(device, &entity),
                MediaCommands::ResetLinks => cli::media_reset_links(device),
                MediaCommands::Link {
                    source,
                    source_pad,
                    sink,
                    sink_pad,
                    disable,
                } => cli::media_link(device, &source, source_pad, &sink, sink_pad, !disable),
            }
        }
        Commands::Stream {
            device,
            width,
            height,
            format,
            buffers,
            frames,
            output,
            fps,
        } => cli::stream(cli::StreamOptions {
            device,
            width,
            height,
            format,
            buffers,
            frames,
            output,
            fps,
        }),
        Commands::Config => cli::show_config(),
    }
}
