// SPDX-License-Identifier: MPL-2.0

//! Integration tests for online and offline bracketing

mod common;

use camera_hal::bracket::{
    AaaControls, AeConfig, BracketFrame, BracketRequest, BracketState, OfflineBracket, OfflineCaptureSource,
    OnlineBracket, Snapshot, SnapshotSource,
};
use camera_hal::buffer::CameraBuffer;
use camera_hal::capture::{ContinuousCaptureConfig, ContinuousTiming, SnapshotDevice};
use camera_hal::constants::{StreamFormat, V4L2_PIX_FMT_NV12};
use camera_hal::errors::HalResult;
use camera_hal::v4l2::{FrameStatus, NodeDirection, VideoNode, VideoNodeState};
use camera_hal::{HalConfig, HalError};
use common::MockDriver;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// What the scripted source and 3A saw, shared with the test
#[derive(Default)]
struct Record {
    handed_out: u32,
    returned: Vec<u32>,
    evs: Vec<f32>,
    focus_steps: Vec<i32>,
    offline: Vec<&'static str>,
}

type Shared = Arc<Mutex<Record>>;

/// Frames with scripted sequence numbers; counting resumes after the script
struct ScriptedSource {
    record: Shared,
    sequences: VecDeque<u32>,
    next: u32,
    /// Fail the nth get_snapshot, counting from 0
    fail_at: Option<u32>,
    buffer: Arc<CameraBuffer>,
}

impl ScriptedSource {
    fn new(record: &Shared, sequences: &[u32]) -> Self {
        Self {
            record: Arc::clone(record),
            sequences: sequences.iter().copied().collect(),
            next: 0,
            fail_at: None,
            buffer: CameraBuffer::heap(16, 16, 16, V4L2_PIX_FMT_NV12, StreamFormat::Ycbcr420).unwrap(),
        }
    }
}

impl SnapshotSource for ScriptedSource {
    fn get_snapshot(&mut self) -> HalResult<Snapshot> {
        let mut record = self.record.lock().unwrap();
        if self.fail_at == Some(record.handed_out) {
            return Err(HalError::Driver {
                call: "VIDIOC_DQBUF",
                errno: libc::EIO,
            });
        }
        record.handed_out += 1;
        let sequence = self.sequences.pop_front().unwrap_or(self.next);
        self.next = sequence + 1;
        Ok(Snapshot {
            buffer: Arc::clone(&self.buffer),
            index: 0,
            sequence,
            timestamp: sequence as i64 * 33_333,
            status: FrameStatus::Ok,
        })
    }

    fn put_snapshot(&mut self, snapshot: Snapshot) -> HalResult<()> {
        self.record.lock().unwrap().returned.push(snapshot.sequence);
        Ok(())
    }
}

impl OfflineCaptureSource for ScriptedSource {
    fn prepare_offline_capture(&mut self, _config: &ContinuousCaptureConfig) -> HalResult<()> {
        self.record.lock().unwrap().offline.push("prepare");
        Ok(())
    }

    fn start_offline_capture(&mut self, _config: &ContinuousCaptureConfig) -> HalResult<()> {
        self.record.lock().unwrap().offline.push("start");
        Ok(())
    }

    fn stop_offline_capture(&mut self) -> HalResult<()> {
        self.record.lock().unwrap().offline.push("stop");
        Ok(())
    }
}

struct RecordingAaa {
    record: Shared,
}

impl AaaControls for RecordingAaa {
    fn init_ae_bracketing(&mut self) -> HalResult<()> {
        Ok(())
    }

    fn apply_ev(&mut self, ev: f32) -> HalResult<()> {
        self.record.lock().unwrap().evs.push(ev);
        Ok(())
    }

    fn exposure_info(&mut self) -> HalResult<AeConfig> {
        Ok(AeConfig {
            ev_bias: 0.0,
            exposure_time: 330,
            analog_gain: 16,
        })
    }

    fn init_af_bracketing(&mut self, _steps: u32) -> HalResult<()> {
        Ok(())
    }

    fn set_manual_focus_increment(&mut self, step: i32) -> HalResult<()> {
        self.record.lock().unwrap().focus_steps.push(step);
        Ok(())
    }
}

fn engine(config: &HalConfig, sequences: &[u32]) -> (OnlineBracket, Shared) {
    let record = Shared::default();
    let source = ScriptedSource::new(&record, sequences);
    let aaa = RecordingAaa {
        record: Arc::clone(&record),
    };
    (OnlineBracket::new(config, Box::new(source), Box::new(aaa)).unwrap(), record)
}

fn take_burst(bracket: &OnlineBracket, count: usize) -> Vec<BracketFrame> {
    (0..count).map(|_| bracket.get_snapshot().unwrap()).collect()
}

fn sequences(frames: &[BracketFrame]) -> Vec<u32> {
    frames.iter().map(|f| f.snapshot.sequence).collect()
}

fn values(frames: &[BracketFrame]) -> Vec<f32> {
    frames.iter().map(|f| f.value.unwrap().value).collect()
}

#[test]
fn test_exposure_burst_without_gaps() {
    let (bracket, record) = engine(&HalConfig::default(), &[]);
    bracket.start(BracketRequest::exposure(5, 0)).unwrap();

    let frames = take_burst(&bracket, 5);
    // Two frames of exposure lag are skipped before the first capture
    assert_eq!(sequences(&frames), vec![2, 3, 4, 5, 6]);
    assert_eq!(values(&frames), vec![-2.0, -1.0, 0.0, 1.0, 2.0]);
    let indices: Vec<u32> = frames.iter().map(|f| f.value.unwrap().index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    // The 3A readback rides along with the value
    let ae = frames[0].value.unwrap().ae.unwrap();
    assert_eq!(ae.ev_bias, -2.0);
    assert_eq!(ae.exposure_time, 330);

    let (state, progress) = bracket.progress().unwrap();
    assert_eq!(state, BracketState::Capture);
    assert_eq!(progress.captured, 5);
    assert_eq!(progress.delivered, 5);
    assert_eq!(progress.retries, 0);
    assert_eq!(record.lock().unwrap().evs, vec![-2.0, -1.0, 0.0, 1.0, 2.0]);
}

#[test]
fn test_gap_is_recovered_within_retry_budget() {
    // Sequence 2 never arrives
    let (bracket, record) = engine(&HalConfig::default(), &[0, 1, 3]);
    bracket.start(BracketRequest::exposure(5, 0)).unwrap();

    let frames = take_burst(&bracket, 5);
    assert_eq!(sequences(&frames), vec![6, 7, 8, 9, 10]);
    assert_eq!(values(&frames), vec![-2.0, -1.0, 0.0, 1.0, 2.0]);

    let (_, progress) = bracket.progress().unwrap();
    assert_eq!(progress.retries, 1);
    assert!(progress.retries <= 2);
    // Values lost with the gap are applied again from the start
    assert_eq!(
        record.lock().unwrap().evs,
        vec![-2.0, -1.0, 0.0, -2.0, -1.0, 0.0, 1.0, 2.0]
    );
}

#[test]
fn test_gap_inside_lag_skip_is_absorbed() {
    let mut config = HalConfig::default();
    config.sensor.exposure_lag = 2;
    config.sensor.css_major_version = 2;
    assert_eq!(config.effective_exposure_lag(), 3);

    let (bracket, _record) = engine(&config, &[0, 2, 3]);
    bracket.start(BracketRequest::exposure(5, 0)).unwrap();
    let frames = take_burst(&bracket, 5);
    assert_eq!(sequences(&frames), vec![3, 4, 5, 6, 7]);
    assert_eq!(values(&frames), vec![-2.0, -1.0, 0.0, 1.0, 2.0]);
    assert_eq!(bracket.progress().unwrap().1.retries, 0);
}

#[test]
fn test_repeated_gaps_exhaust_retries() {
    let (bracket, _record) = engine(&HalConfig::default(), &[0, 1, 3, 4, 5, 7, 8, 9, 11]);
    bracket.start(BracketRequest::exposure(5, 0)).unwrap();

    let err = bracket.get_snapshot().unwrap_err();
    assert_eq!(err, HalError::FrameLoss { lost: 1, retries: 2 });
    // The failure sticks until the engine is stopped
    assert!(matches!(bracket.get_snapshot(), Err(HalError::FrameLoss { .. })));

    bracket.stop().unwrap();
    assert_eq!(bracket.state().unwrap(), BracketState::Stopped);
}

#[test]
fn test_focus_burst_steps_the_lens() {
    let (bracket, record) = engine(&HalConfig::default(), &[]);
    bracket.start(BracketRequest::focus(3, 0)).unwrap();

    let frames = take_burst(&bracket, 3);
    // One frame skipped for the first lens move
    assert_eq!(sequences(&frames), vec![1, 2, 3]);
    assert_eq!(values(&frames), vec![0.0, 1.0, 2.0]);
    assert!(frames.iter().all(|f| f.value.unwrap().ae.is_none()));
    let record = record.lock().unwrap();
    assert_eq!(record.focus_steps, vec![0, 1, 2]);
    assert!(record.evs.is_empty());
}

#[test]
fn test_fps_adapt_skip_drops_frames_between_captures() {
    let (bracket, _record) = engine(&HalConfig::default(), &[]);
    bracket.start(BracketRequest::exposure(3, 1)).unwrap();

    let frames = take_burst(&bracket, 3);
    // Every other frame is dropped after the initial lag skip
    assert_eq!(sequences(&frames), vec![2, 4, 6]);
    assert_eq!(values(&frames), vec![-2.0, 0.0, 2.0]);
}

#[test]
fn test_single_frame_passes_through() {
    let (bracket, record) = engine(&HalConfig::default(), &[]);
    bracket.start(BracketRequest::exposure(1, 0)).unwrap();
    assert_eq!(bracket.state().unwrap(), BracketState::Capture);

    let frame = bracket.get_snapshot().unwrap();
    assert_eq!(frame.snapshot.sequence, 0);
    assert!(frame.value.is_none());
    bracket.put_snapshot(frame.snapshot).unwrap();
    assert_eq!(record.lock().unwrap().returned, vec![0]);
}

#[test]
fn test_engine_state_checks() {
    let (bracket, _record) = engine(&HalConfig::default(), &[]);
    assert!(matches!(
        bracket.get_snapshot(),
        Err(HalError::InvalidState { .. })
    ));
    assert!(matches!(
        bracket.start(BracketRequest::exposure(0, 0)),
        Err(HalError::InvalidArgument(_))
    ));
    assert!(matches!(
        bracket.start(BracketRequest::exposure(3, 0).with_values(vec![0.0])),
        Err(HalError::InvalidArgument(_))
    ));

    bracket.start(BracketRequest::exposure(3, 0)).unwrap();
    assert!(matches!(
        bracket.start(BracketRequest::exposure(3, 0)),
        Err(HalError::InvalidState { .. })
    ));
    bracket.stop().unwrap();
    bracket.start(BracketRequest::exposure(3, 0)).unwrap();
}

#[test]
fn test_stop_returns_undelivered_frames() {
    let (bracket, record) = engine(&HalConfig::default(), &[]);
    bracket.start(BracketRequest::exposure(3, 0)).unwrap();
    let first = bracket.get_snapshot().unwrap();
    // Wait for the rest of the burst to be captured
    assert!(common::wait_for(std::time::Duration::from_secs(3), || {
        bracket.progress().unwrap().1.captured == 3
    }));
    bracket.stop().unwrap();

    let returned = record.lock().unwrap().returned.clone();
    // Lag-skip frames plus the two captured but never handed out
    assert_eq!(returned, vec![0, 1, 3, 4]);
    assert_eq!(first.snapshot.sequence, 2);
}

#[test]
fn test_offline_burst_is_tagged_in_arrival_order() {
    let config = HalConfig::default();
    let offline = OfflineBracket::new(ContinuousTiming::from_config(&config));
    let plan = offline.plan(&BracketRequest::exposure(3, 1), -1).unwrap();
    assert_eq!(plan.config.num_captures, 3);
    assert_eq!(plan.config.skip, 1);

    let record = Shared::default();
    let mut source = ScriptedSource::new(&record, &[20, 22, 25]);
    let frames = offline.run(&mut source, &plan).unwrap();

    assert_eq!(sequences(&frames), vec![20, 22, 25]);
    assert_eq!(values(&frames), vec![-2.0, 0.0, 2.0]);
    assert_eq!(record.lock().unwrap().offline, vec!["prepare", "start", "stop"]);
}

#[test]
fn test_offline_failure_returns_collected_frames() {
    let config = HalConfig::default();
    let offline = OfflineBracket::new(ContinuousTiming::from_config(&config));
    let plan = offline.plan(&BracketRequest::exposure(3, 0), 0).unwrap();

    let record = Shared::default();
    let mut source = ScriptedSource::new(&record, &[]);
    source.fail_at = Some(2);
    let err = offline.run(&mut source, &plan).unwrap_err();
    assert!(matches!(err, HalError::Driver { call: "VIDIOC_DQBUF", .. }));

    let record = record.lock().unwrap();
    assert_eq!(record.returned, vec![0, 1]);
    // The ring request is stopped even on failure
    assert_eq!(record.offline.last(), Some(&"stop"));
}

#[test]
fn test_online_burst_from_a_streaming_node() {
    let config = HalConfig::default();
    let (driver, handle) = MockDriver::new();
    let node = VideoNode::new("/dev/video-still", NodeDirection::Input, Box::new(driver));
    let mut device = SnapshotDevice::new(node, &config);
    // Enough buffers for the whole burst to sit captured but undelivered
    device.configure(640, 480, V4L2_PIX_FMT_NV12, 8).unwrap();
    // One frame goes missing right after the lag skip
    handle.script_sequences(&[0, 1, 3]);
    device.start(0).unwrap();
    assert_eq!(device.node().buffers_in_device(), 8);

    let record = Shared::default();
    let aaa = RecordingAaa {
        record: Arc::clone(&record),
    };
    let bracket = OnlineBracket::new(&config, Box::new(device), Box::new(aaa)).unwrap();
    bracket.start(BracketRequest::exposure(5, 0)).unwrap();

    let frames = take_burst(&bracket, 5);
    assert_eq!(sequences(&frames), vec![6, 7, 8, 9, 10]);
    assert_eq!(values(&frames), vec![-2.0, -1.0, 0.0, 1.0, 2.0]);
    assert_eq!(bracket.progress().unwrap().1.retries, 1);
    for frame in frames {
        assert_eq!(frame.snapshot.buffer.sequence(), frame.snapshot.sequence);
        bracket.put_snapshot(frame.snapshot).unwrap();
    }
}

#[test]
fn test_offline_burst_from_the_raw_ring() {
    let config = HalConfig::default();
    let (driver, handle) = MockDriver::new();
    let node = VideoNode::new("/dev/video-still", NodeDirection::Input, Box::new(driver));
    let mut device = SnapshotDevice::new(node, &config);
    device.configure(640, 480, V4L2_PIX_FMT_NV12, 4).unwrap();

    let offline = OfflineBracket::new(ContinuousTiming::from_config(&config));
    let plan = offline.plan(&BracketRequest::exposure(3, 0), 0).unwrap();
    let frames = offline.run(&mut device, &plan).unwrap();

    assert_eq!(frames.len(), 3);
    assert_eq!(values(&frames), vec![-2.0, 0.0, 2.0]);
    let requested = handle.state().continuous.unwrap();
    assert_eq!(requested.num_captures, 3);
    assert_eq!(requested.offset, plan.config.offset);
    assert_eq!(requested.skip_frames, 0);
    // Buffers stay registered for the next burst
    assert_eq!(device.node().state(), VideoNodeState::Prepared);
}
