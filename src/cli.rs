// SPDX-License-Identifier: GPL-3.0-only

//! CLI commands for bring-up and debugging
//!
//! This module provides command-line functionality for:
//! - Listing V4L2 devices
//! - Inspecting and routing the media graph
//! - Streaming frames from a single node
//! - Printing the effective configuration

use camera_hal::buffer::allocate_heap_pool;
use camera_hal::config::HalConfig;
use camera_hal::constants::{PixelFormat, fourcc_to_string};
use camera_hal::media_graph::{KernelMediaDriver, MediaGraph};
use camera_hal::v4l2::{FrameInfo, KernelDriver, MemoryType, NodeDirection, VideoNode, kernel_driver_factory};
use chrono::Local;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

type CliResult = Result<(), Box<dyn std::error::Error>>;

/// List all V4L2 video devices
pub fn list_devices() -> CliResult {
    let nodes = v4l::context::enum_devices();
    if nodes.is_empty() {
        println!("No V4L2 devices found.");
        return Ok(());
    }

    println!("V4L2 devices:");
    println!();
    for node in nodes {
        let path = node.path().to_path_buf();
        let name = node.name().unwrap_or_else(|| "unknown".to_string());
        println!("  [{}] {} ({})", node.index(), name, path.display());
        match v4l::Device::with_path(&path).and_then(|dev| dev.query_caps()) {
            Ok(caps) => {
                println!("      Driver: {}  Card: {}  Bus: {}", caps.driver, caps.card, caps.bus);
            }
            Err(e) => println!("      (query failed: {})", e),
        }
    }
    Ok(())
}

fn open_media(path: Option<&str>) -> Result<MediaGraph, Box<dyn std::error::Error>> {
    let path = match path {
        Some(path) => path.to_string(),
        None => HalConfig::load().media_device,
    };
    let mut graph = MediaGraph::new(path, Box::new(KernelMediaDriver::default()), kernel_driver_factory());
    graph.open()?;
    Ok(graph)
}

pub fn media_info(device: Option<&str>) -> CliResult {
    let mut graph = open_media(device)?;
    let info = graph.device_info()?;
    println!("Media device: {}", graph.path());
    println!("  Driver:   {}", info.driver);
    println!("  Model:    {}", info.model);
    println!("  Serial:   {}", info.serial);
    println!("  Bus:      {}", info.bus_info);
    println!("  Version:  {:#x} (driver {:#x})", info.media_version, info.driver_version);
    println!("  Entities: {}", graph.entities().len());
    Ok(())
}

pub fn media_entities(device: Option<&str>) -> CliResult {
    let graph = open_media(device)?;
    for entity in graph.entities() {
        println!(
            "  {:3} {:<32} {:<6} pads {:2} links {:2} dev {}:{}",
            entity.id,
            entity.name,
            entity.entity_type.display_name(),
            entity.pads,
            entity.links,
            entity.dev.0,
            entity.dev.1
        );
    }
    Ok(())
}

pub fn media_links(device: Option<&str>, entity: &str) -> CliResult {
    let mut graph = open_media(device)?;
    let links = graph.links(entity)?;
    if links.is_empty() {
        println!("{} has no links.", entity);
    }
    for link in links {
        println!("  {}", link);
    }
    Ok(())
}

pub fn media_reset_links(device: Option<&str>) -> CliResult {
    let mut graph = open_media(device)?;
    graph.reset_links()?;
    println!("All mutable links disabled.");
    Ok(())
}

pub fn media_link(
    device: Option<&str>,
    source: &str,
    source_pad: u16,
    sink: &str,
    sink_pad: u16,
    enable: bool,
) -> CliResult {
    let mut graph = open_media(device)?;
    graph.configure_link(source, source_pad, sink, sink_pad, enable)?;
    println!(
        "{} \"{}\":{} -> \"{}\":{}",
        if enable { "Enabled" } else { "Disabled" },
        source,
        source_pad,
        sink,
        sink_pad
    );
    Ok(())
}

/// Options for [`stream`]
pub struct StreamOptions {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub format: String,
    pub buffers: usize,
    pub frames: u32,
    pub output: Option<PathBuf>,
    pub fps: Option<f32>,
}

fn dump_path(output: &Path) -> PathBuf {
    if output.is_dir() {
        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        output.join(format!("frames_{}.raw", timestamp))
    } else {
        output.to_path_buf()
    }
}

/// Stream frames from one node with heap buffers
pub fn stream(options: StreamOptions) -> CliResult {
    let format = PixelFormat::from_name(&options.format)
        .ok_or_else(|| format!("Unknown pixel format '{}'", options.format))?;
    let config = HalConfig::load();

    let mut node = VideoNode::new(
        options.device.clone(),
        NodeDirection::Input,
        Box::new(KernelDriver::default()),
    );
    node.open()?;
    let mut info = FrameInfo::new(options.width, options.height, format.fourcc());
    node.set_format(&mut info)?;
    if let Some(fps) = options.fps {
        node.set_frame_rate(fps)?;
    }
    println!(
        "Format: {}x{} {} stride {} size {}",
        info.width,
        info.height,
        fourcc_to_string(info.format),
        info.stride,
        info.size
    );

    let buffers = allocate_heap_pool(options.buffers, info.width, info.height, info.stride, info.format)?;
    let pool = buffers.iter().map(|b| b.as_buffer_info()).collect();
    node.set_buffer_pool(pool, config.cached_buffers, MemoryType::UserPtr)?;
    node.start(config.sensor.initial_skip_frames)?;
    for index in 0..buffers.len() {
        node.put_frame(index as u32)?;
    }

    let mut dump = match &options.output {
        Some(output) => {
            let path = dump_path(output);
            println!("Writing frames to {}", path.display());
            Some(File::create(path)?)
        }
        None => None,
    };

    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_flag_clone = stop_flag.clone();
    ctrlc::set_handler(move || {
        stop_flag_clone.store(true, Ordering::SeqCst);
    })?;

    println!("Streaming... (press Ctrl+C to stop early)");
    let start = Instant::now();
    let mut grabbed = 0u32;
    let mut failure = None;
    while grabbed < options.frames {
        if stop_flag.load(Ordering::SeqCst) {
            println!();
            println!("Stopping early...");
            break;
        }
        match frame_ready(node.poll(config.poll_timeout_ms as i32), &options.device) {
            Ok(true) => {}
            Ok(false) => {
                eprintln!("Poll timed out after {}ms", config.poll_timeout_ms);
                continue;
            }
            Err(e) => {
                println!();
                eprintln!("{}", e);
                failure = Some(e);
                break;
            }
        }
        let vbuf = node.grab_frame()?;
        if let (Some(file), Some(buffer)) = (dump.as_mut(), buffers.get(vbuf.index as usize)) {
            let bytes = buffer.read_bytes()?;
            let used = (vbuf.bytesused as usize).min(bytes.len());
            file.write_all(&bytes[..used])?;
        }
        grabbed += 1;
        print!(
            "\rFrame {:4}  seq {:6}  status {:?}",
            grabbed,
            vbuf.sequence,
            vbuf.frame_status()
        );
        std::io::stdout().flush()?;
        node.put_frame(vbuf.index)?;
    }

    let elapsed = start.elapsed().as_secs_f32();
    node.stop(false)?;
    node.close()?;
    println!();
    if elapsed > 0.0 {
        println!("{} frames in {:.1}s ({:.1} fps)", grabbed, elapsed, grabbed as f32 / elapsed);
    }
    match failure {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

/// Interpret a poll return: a frame is ready, the poll timed out, or it failed
fn frame_ready(ready: i32, device: &str) -> Result<bool, String> {
    match ready {
        0 => Ok(false),
        n if n > 0 => Ok(true),
        n => Err(format!(
            "Poll on {} failed: {}",
            device,
            std::io::Error::from_raw_os_error(-n)
        )),
    }
}

/// Print the configuration the HAL would run with
pub fn show_config() -> CliResult {
    if let Some(path) = HalConfig::default_path() {
        println!("# {}", path.display());
    }
    let config = HalConfig::load();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
