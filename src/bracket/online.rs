// SPDX-License-Identifier: GPL-3.0-only

//! Online bracketing on a live stream
//!
//! Exposure changes reach the output `exposure_lag` frames after they are
//! applied, so the engine keeps that many values in flight: it skips (and
//! applies ahead) before the first frame, then applies one value per
//! captured frame. Each captured frame is tagged with the oldest value
//! still queued.
//!
//! When the stream drops frames the alignment between applied values and
//! frames breaks. Gaps that fall inside frames being skipped anyway are
//! absorbed. Anything else rewinds to the first uncaptured value and skips
//! frames until the pipeline is realigned, at most `MAX_BRACKET_RETRIES`
//! times per burst.

use super::{
    AaaControls, BracketFrame, BracketMode, BracketRequest, BurstProgress, SequenceTracker, Snapshot, SnapshotSource,
    ValueQueue, bracket_values,
};
use crate::config::HalConfig;
use crate::constants::MAX_BRACKET_RETRIES;
use crate::errors::{HalError, HalResult};
use crate::message_queue::{MessageQueue, Reply, reply};
use std::collections::VecDeque;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BracketState {
    #[default]
    Stopped,
    /// Capturing the burst in the background
    Bracketing,
    /// Burst done or not bracketing; frames pass straight through
    Capture,
}

/// Burst bookkeeping, independent of the worker thread
struct BurstSession {
    source: Box<dyn SnapshotSource>,
    aaa: Box<dyn AaaControls>,
    exposure_lag: u32,
    mode: BracketMode,
    fps_adapt_skip: u32,
    values: Vec<f32>,
    progress: BurstProgress,
    applied_values: ValueQueue,
    tracker: SequenceTracker,
}

impl BurstSession {
    fn new(source: Box<dyn SnapshotSource>, aaa: Box<dyn AaaControls>, exposure_lag: u32) -> Self {
        Self {
            source,
            aaa,
            exposure_lag,
            mode: BracketMode::None,
            fps_adapt_skip: 0,
            values: Vec::new(),
            progress: BurstProgress::default(),
            applied_values: ValueQueue::default(),
            tracker: SequenceTracker::default(),
        }
    }

    fn begin(&mut self, request: &BracketRequest) -> HalResult<()> {
        request.validate()?;
        self.mode = request.effective_mode();
        self.fps_adapt_skip = request.fps_adapt_skip;
        self.values = bracket_values(request);
        self.progress = BurstProgress::new(request.burst_length);
        self.applied_values.clear();
        self.tracker.reset();

        match self.mode {
            BracketMode::None => return Ok(()),
            BracketMode::Exposure => self.aaa.init_ae_bracketing()?,
            BracketMode::Focus => self.aaa.init_af_bracketing(request.burst_length)?,
        }

        let (skip, bracket) = self.initial_skip();
        info!(
            mode = self.mode.display_name(),
            burst = request.burst_length,
            fps_adapt_skip = self.fps_adapt_skip,
            lag = self.exposure_lag,
            skip,
            bracket,
            "Starting bracketing"
        );
        if skip > 0 {
            self.skip_frames(skip, bracket)?;
        }
        Ok(())
    }

    /// Frames to skip before the first capture, and how many of them carry a value
    fn initial_skip(&self) -> (u32, u32) {
        match self.mode {
            BracketMode::Exposure if self.fps_adapt_skip < self.exposure_lag => {
                let skip = self.exposure_lag - self.fps_adapt_skip;
                (skip, skip)
            }
            BracketMode::Focus if self.fps_adapt_skip < 1 => (1, 0),
            _ => (0, 0),
        }
    }

    /// Skip and bracket counts used to realign after lost frames
    fn recovery_skip(&self) -> (u32, u32) {
        let skip = self.exposure_lag;
        let bracket = if self.fps_adapt_skip > 0 { skip.saturating_sub(1) } else { skip };
        (skip, bracket)
    }

    fn apply_next(&mut self) -> HalResult<()> {
        if !self.progress.can_apply() {
            return Ok(());
        }
        let index = self.progress.applied;
        let value = self.values.get(index as usize).copied().unwrap_or(0.0);
        let ae = match self.mode {
            BracketMode::Exposure => {
                self.aaa.apply_ev(value)?;
                let mut ae = self.aaa.exposure_info()?;
                ae.ev_bias = value;
                Some(ae)
            }
            BracketMode::Focus => {
                self.aaa.set_manual_focus_increment(index as i32)?;
                None
            }
            BracketMode::None => return Ok(()),
        };
        debug!(index, value, "Applied bracket value");
        self.applied_values.push(super::BracketValue { index, value, ae });
        self.progress.record_applied()
    }

    /// Drop values applied for frames that will never arrive in order
    fn rewind(&mut self) {
        self.applied_values.discard_from(self.progress.captured);
        self.progress.rewind_to_captured();
        self.progress.retries += 1;
        warn!(
            captured = self.progress.captured,
            retries = self.progress.retries,
            "Realigning bracket values after frame loss"
        );
    }

    fn skip_frames(&mut self, count: u32, bracket: u32) -> HalResult<()> {
        let mut count = count;
        let mut bracket = bracket;
        let mut i = 0;
        while i < count {
            if i < bracket {
                self.apply_next()?;
            }
            let snapshot = self.source.get_snapshot()?;
            let lost = self.tracker.observe(snapshot.sequence);
            self.source.put_snapshot(snapshot)?;

            if self.mode == BracketMode::Exposure && lost > 0 {
                if self.progress.retries >= MAX_BRACKET_RETRIES {
                    error!(lost, retries = self.progress.retries, "Frame loss while skipping, out of retries");
                    break;
                }
                if i + lost < count {
                    debug!(lost, skipped = i, "Frame loss absorbed by skip");
                    i += lost;
                } else {
                    self.rewind();
                    (count, bracket) = self.recovery_skip();
                    i = 0;
                    continue;
                }
            }
            i += 1;
        }
        Ok(())
    }

    /// Capture the next frame of the burst
    fn capture_frame(&mut self) -> HalResult<BracketFrame> {
        if self.fps_adapt_skip > 0 {
            let bracket = match self.mode {
                BracketMode::Exposure if self.fps_adapt_skip >= 2 => 1,
                BracketMode::Focus if self.fps_adapt_skip >= 1 => 1,
                _ => 0,
            };
            self.skip_frames(self.fps_adapt_skip, bracket)?;
        }
        let apply_now = match self.mode {
            BracketMode::Exposure => self.fps_adapt_skip < 2,
            BracketMode::Focus => self.fps_adapt_skip < 1,
            BracketMode::None => false,
        };
        if apply_now {
            self.apply_next()?;
        }

        let snapshot = loop {
            let snapshot = self.source.get_snapshot()?;
            let lost = self.tracker.observe(snapshot.sequence);
            if self.mode != BracketMode::Exposure || lost == 0 {
                break snapshot;
            }
            self.source.put_snapshot(snapshot)?;
            if self.progress.retries >= MAX_BRACKET_RETRIES {
                error!(lost, retries = self.progress.retries, "Bracketing failed");
                return Err(HalError::FrameLoss {
                    lost,
                    retries: self.progress.retries,
                });
            }
            self.rewind();
            let (skip, bracket) = self.recovery_skip();
            self.skip_frames(skip, bracket)?;
        };

        let value = self.applied_values.pop();
        self.progress.record_captured()?;
        debug!(
            sequence = snapshot.sequence,
            captured = self.progress.captured,
            value = ?value.map(|v| v.value),
            "Captured bracket frame"
        );
        Ok(BracketFrame { snapshot, value })
    }
}

enum BracketMessage {
    Start {
        request: BracketRequest,
        reply: Reply<()>,
    },
    Stop {
        reply: Reply<()>,
    },
    GetSnapshot {
        reply: Reply<BracketFrame>,
    },
    PutSnapshot {
        snapshot: Snapshot,
        reply: Reply<()>,
    },
    Progress {
        reply: Reply<(BracketState, BurstProgress)>,
    },
    Exit,
}

struct BracketWorker {
    queue: MessageQueue<BracketMessage>,
    session: BurstSession,
    state: BracketState,
    ready: VecDeque<BracketFrame>,
    waiting: VecDeque<Reply<BracketFrame>>,
    failure: Option<HalError>,
}

impl BracketWorker {
    fn run(mut self) {
        debug!("Bracket worker started");
        loop {
            let message = if self.state == BracketState::Bracketing {
                self.queue.try_receive()
            } else {
                self.queue.receive()
            };
            match message {
                Some(BracketMessage::Exit) => break,
                Some(message) => self.dispatch(message),
                None if self.state == BracketState::Bracketing => self.capture_next(),
                None => break,
            }
        }
        self.queue.close();
        while let Some(message) = self.queue.try_receive() {
            drop(message);
        }
        self.return_ready_frames();
        debug!("Bracket worker exiting");
    }

    fn dispatch(&mut self, message: BracketMessage) {
        match message {
            BracketMessage::Start { request, reply: tx } => reply(tx, self.start(request)),
            BracketMessage::Stop { reply: tx } => reply(tx, self.stop()),
            BracketMessage::GetSnapshot { reply: tx } => self.get_snapshot(tx),
            BracketMessage::PutSnapshot { snapshot, reply: tx } => {
                reply(tx, self.session.source.put_snapshot(snapshot))
            }
            BracketMessage::Progress { reply: tx } => reply(tx, Ok((self.state, self.session.progress))),
            BracketMessage::Exit => {}
        }
    }

    fn start(&mut self, request: BracketRequest) -> HalResult<()> {
        if self.state != BracketState::Stopped {
            return Err(HalError::InvalidState {
                operation: "start bracketing",
                state: format!("{:?}", self.state),
            });
        }
        self.failure = None;
        self.session.begin(&request)?;
        self.state = if self.session.mode == BracketMode::None {
            BracketState::Capture
        } else {
            BracketState::Bracketing
        };
        Ok(())
    }

    fn capture_next(&mut self) {
        match self.session.capture_frame() {
            Ok(frame) => {
                self.ready.push_back(frame);
                if self.session.progress.all_captured() {
                    info!(retries = self.session.progress.retries, "Bracketing burst captured");
                    self.state = BracketState::Capture;
                }
                self.serve_waiting();
            }
            Err(e) => {
                error!(error = %e, "Bracket capture failed");
                for tx in self.waiting.drain(..) {
                    reply(tx, Err(e.clone()));
                }
                self.failure = Some(e);
                self.state = BracketState::Capture;
            }
        }
    }

    fn serve_waiting(&mut self) {
        while !self.waiting.is_empty() {
            let Some(frame) = self.take_ready() else {
                break;
            };
            if let Some(tx) = self.waiting.pop_front() {
                reply(tx, frame);
            }
        }
    }

    fn take_ready(&mut self) -> Option<HalResult<BracketFrame>> {
        let frame = self.ready.pop_front()?;
        Some(self.session.progress.record_delivered().map(|_| frame))
    }

    fn get_snapshot(&mut self, tx: Reply<BracketFrame>) {
        if let Some(frame) = self.take_ready() {
            reply(tx, frame);
            return;
        }
        if let Some(e) = &self.failure {
            reply(tx, Err(e.clone()));
            return;
        }
        match self.state {
            BracketState::Bracketing => self.waiting.push_back(tx),
            BracketState::Capture => {
                let frame = self
                    .session
                    .source
                    .get_snapshot()
                    .map(|snapshot| BracketFrame { snapshot, value: None });
                reply(tx, frame);
            }
            BracketState::Stopped => reply(
                tx,
                Err(HalError::InvalidState {
                    operation: "get snapshot",
                    state: "stopped".to_string(),
                }),
            ),
        }
    }

    fn return_ready_frames(&mut self) {
        while let Some(frame) = self.ready.pop_front() {
            if let Err(e) = self.session.source.put_snapshot(frame.snapshot) {
                warn!(error = %e, "Failed to return undelivered bracket frame");
            }
        }
    }

    fn stop(&mut self) -> HalResult<()> {
        debug!(state = ?self.state, progress = ?self.session.progress, "Stopping bracketing");
        // Pending waiters see Flushed
        self.waiting.clear();
        self.return_ready_frames();
        self.session.applied_values.clear();
        self.failure = None;
        self.state = BracketState::Stopped;
        Ok(())
    }
}

/// Online bracketing engine running on its own thread
pub struct OnlineBracket {
    queue: MessageQueue<BracketMessage>,
    thread: Option<JoinHandle<()>>,
}

impl OnlineBracket {
    pub fn new(config: &HalConfig, source: Box<dyn SnapshotSource>, aaa: Box<dyn AaaControls>) -> HalResult<Self> {
        let queue = MessageQueue::new("bracket");
        let worker = BracketWorker {
            queue: queue.clone(),
            session: BurstSession::new(source, aaa, config.effective_exposure_lag()),
            state: BracketState::Stopped,
            ready: VecDeque::new(),
            waiting: VecDeque::new(),
            failure: None,
        };
        let thread = thread::Builder::new()
            .name("bracket".to_string())
            .spawn(move || worker.run())
            .map_err(|e| HalError::from_io("spawn", &e))?;
        Ok(Self {
            queue,
            thread: Some(thread),
        })
    }

    /// Initialize 3A for the burst and skip up to the first bracketed frame
    pub fn start(&self, request: BracketRequest) -> HalResult<()> {
        self.queue.request(|reply| BracketMessage::Start { request, reply })
    }

    /// Next frame of the burst; blocks until it is captured
    pub fn get_snapshot(&self) -> HalResult<BracketFrame> {
        self.queue.request(|reply| BracketMessage::GetSnapshot { reply })
    }

    pub fn put_snapshot(&self, snapshot: Snapshot) -> HalResult<()> {
        self.queue.request(|reply| BracketMessage::PutSnapshot { snapshot, reply })
    }

    pub fn stop(&self) -> HalResult<()> {
        self.queue.request(|reply| BracketMessage::Stop { reply })
    }

    pub fn state(&self) -> HalResult<BracketState> {
        self.progress().map(|(state, _)| state)
    }

    pub fn progress(&self) -> HalResult<(BracketState, BurstProgress)> {
        self.queue.request(|reply| BracketMessage::Progress { reply })
    }
}

impl Drop for OnlineBracket {
    fn drop(&mut self) {
        if self.queue.send(BracketMessage::Exit).is_err() {
            debug!("Bracket queue already closed");
        }
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("Bracket thread panicked");
            }
        }
    }
}
