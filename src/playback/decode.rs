//! Decode worker: packets in, presentation-stamped frames out.
//!
//! One loop serves both the video and the audio stream. The decoder lock is
//! held only around single codec calls, never while blocked on a queue, so a
//! seek can always take it.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::state::WorkerStatus;
use super::sync::ClockState;
use super::worker::WorkerControl;
use crate::media::{DecodeStatus, MediaFrame, SendStatus, StreamDecoder, StreamKind};
use crate::queue::{BoundedChannel, FrameTimeline, PushOutcome};
use crate::time::{pts_to_ms, Millis, TimeBase, NOPTS};

/// What travels through a packet channel. `epoch` is the seek epoch the
/// packet was read under.
#[derive(Debug)]
pub enum PacketMessage<P> {
    Packet { epoch: u64, packet: P },
    /// The demuxer hit end of file.
    EndOfStream { epoch: u64 },
}

impl<P> PacketMessage<P> {
    pub fn epoch(&self) -> u64 {
        match self {
            PacketMessage::Packet { epoch, .. } | PacketMessage::EndOfStream { epoch } => *epoch,
        }
    }
}

/// Everything belonging to one elementary stream.
pub struct StreamPipeline<D: StreamDecoder> {
    pub kind: StreamKind,
    pub stream_index: usize,
    pub time_base: TimeBase,
    pub packets: BoundedChannel<PacketMessage<D::Packet>>,
    pub decoder: Mutex<D>,
    pub timeline: Arc<FrameTimeline<D::Frame>>,
    pub control: WorkerControl,
}

impl<D: StreamDecoder> StreamPipeline<D> {
    pub fn new(
        kind: StreamKind,
        stream_index: usize,
        time_base: TimeBase,
        decoder: D,
        packet_capacity: usize,
        frame_capacity: usize,
    ) -> Self {
        let (packets_name, frames_name, worker_name) = match kind {
            StreamKind::Video => ("video-packets", "video-frames", "video-decode"),
            StreamKind::Audio => ("audio-packets", "audio-frames", "audio-decode"),
        };
        Self {
            kind,
            stream_index,
            time_base,
            packets: BoundedChannel::new(packets_name, packet_capacity),
            decoder: Mutex::new(decoder),
            timeline: Arc::new(FrameTimeline::new(frames_name, frame_capacity)),
            control: WorkerControl::new(worker_name, WorkerStatus::Working),
        }
    }

    pub fn present_ms(&self, frame: &D::Frame) -> Option<Millis> {
        let pts = frame.pts();
        (pts != NOPTS).then(|| pts_to_ms(pts, self.time_base))
    }

    /// Close both queues and mark the worker exiting.
    pub fn shut_down(&self) {
        self.control.set(WorkerStatus::Exiting);
        self.packets.close();
        self.timeline.close();
    }

    /// Drop everything queued (seek). Returns the timeline's new generation.
    pub fn clear(&self) -> u64 {
        self.packets.clear();
        self.timeline.clear()
    }
}

enum Step {
    Continue,
    Exit,
}

/// Decode loop state local to the worker thread
struct DecodeLoop<'a, D: StreamDecoder> {
    pipe: &'a StreamPipeline<D>,
    epoch: &'a AtomicU64,
    clock: &'a ClockState,
    /// Packet the decoder refused with `Again`
    stash: Option<PacketMessage<D::Packet>>,
    /// Epoch in which end of input was signalled to the decoder
    eos_epoch: Option<u64>,
    dropped: u64,
}

impl<'a, D: StreamDecoder> DecodeLoop<'a, D> {
    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn drain_one(&mut self) -> Step {
        let (status, generation, epoch) = {
            let mut decoder = self.pipe.decoder.lock();
            let generation = self.pipe.timeline.generation();
            let epoch = self.current_epoch();
            (decoder.receive_frame(), generation, epoch)
        };
        match status {
            Ok(DecodeStatus::Ready(frame)) => self.push(frame, generation),
            Ok(DecodeStatus::Eof) => {
                if self.eos_epoch.take() == Some(epoch) {
                    tracing::info!(stream = ?self.pipe.kind, "stream fully decoded");
                    if self.pipe.timeline.push_end_of_stream(generation) == PushOutcome::Closed {
                        return Step::Exit;
                    }
                }
                self.feed()
            }
            Ok(DecodeStatus::Again) => self.feed(),
            Err(e) => {
                tracing::warn!(stream = ?self.pipe.kind, error = %e, "decode error");
                self.feed()
            }
        }
    }

    fn push(&mut self, frame: D::Frame, generation: u64) -> Step {
        let Some(present_ms) = self.pipe.present_ms(&frame) else {
            tracing::debug!(stream = ?self.pipe.kind, "frame without timestamp dropped");
            return Step::Continue;
        };
        let played_ms = self.clock.played_ms();
        match self.pipe.timeline.push_fresh(frame, present_ms, played_ms, generation) {
            PushOutcome::Queued => Step::Continue,
            PushOutcome::Closed => Step::Exit,
            outcome => {
                self.dropped += 1;
                tracing::debug!(
                    stream = ?self.pipe.kind,
                    present_ms,
                    played_ms,
                    ?outcome,
                    dropped = self.dropped,
                    "frame dropped"
                );
                Step::Continue
            }
        }
    }

    fn feed(&mut self) -> Step {
        let message = match self.stash.take() {
            Some(message) => message,
            None => match self.pipe.packets.receive() {
                Some(message) => message,
                None => return Step::Exit,
            },
        };

        let mut decoder = self.pipe.decoder.lock();
        let current = self.current_epoch();
        if message.epoch() != current {
            // read before the last seek
            return Step::Continue;
        }
        match message {
            PacketMessage::Packet { epoch, packet } => match decoder.send_packet(&packet) {
                Ok(SendStatus::Accepted) => {}
                Ok(SendStatus::Again) => self.stash = Some(PacketMessage::Packet { epoch, packet }),
                Ok(SendStatus::Eof) => {
                    tracing::debug!(stream = ?self.pipe.kind, "packet after end of input ignored");
                }
                Err(e) => tracing::warn!(stream = ?self.pipe.kind, error = %e, "packet rejected"),
            },
            PacketMessage::EndOfStream { epoch } => match decoder.send_eof() {
                Ok(()) => self.eos_epoch = Some(epoch),
                Err(e) => tracing::warn!(stream = ?self.pipe.kind, error = %e, "failed to signal end of input"),
            },
        }
        Step::Continue
    }
}

/// Body of a decode worker thread. Returns when its queues are closed.
pub fn run<D: StreamDecoder>(pipe: &StreamPipeline<D>, epoch: &AtomicU64, clock: &ClockState) {
    tracing::debug!(worker = pipe.control.name(), "decode worker started");
    let mut state = DecodeLoop {
        pipe,
        epoch,
        clock,
        stash: None,
        eos_epoch: None,
        dropped: 0,
    };
    while !pipe.control.is_exiting() {
        if let Step::Exit = state.drain_one() {
            break;
        }
    }
    pipe.control.set(WorkerStatus::Exiting);
    tracing::info!(worker = pipe.control.name(), dropped = state.dropped, "decode worker exiting");
}

/// Outcome of feeding one packet while priming after a seek
pub enum Prime<P> {
    /// A frame at or after the target was queued.
    Primed,
    /// No usable frame yet.
    NeedMore,
    /// Primed, but the decoder did not take this packet; it goes back to the
    /// worker.
    Leftover(P),
}

/// Feed `packet` to the (locked) decoder and queue the first frame at or
/// after `target_ms`. Earlier frames are dropped. The stream only counts as
/// primed once the timeline actually took a frame.
pub fn prime_with<D: StreamDecoder>(
    pipe: &StreamPipeline<D>,
    decoder: &mut D,
    packet: D::Packet,
    target_ms: Millis,
    generation: u64,
) -> Prime<D::Packet> {
    loop {
        let sent = match decoder.send_packet(&packet) {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(stream = ?pipe.kind, error = %e, "packet rejected while priming");
                return Prime::NeedMore;
            }
        };
        let mut drained = 0;
        loop {
            match decoder.receive_frame() {
                Ok(DecodeStatus::Ready(frame)) => {
                    drained += 1;
                    let Some(present_ms) = pipe.present_ms(&frame) else { continue };
                    if present_ms < target_ms {
                        continue;
                    }
                    let outcome = pipe.timeline.push_fresh(frame, present_ms, target_ms, generation);
                    if outcome != PushOutcome::Queued {
                        tracing::debug!(stream = ?pipe.kind, ?outcome, present_ms, "primed frame not queued");
                        continue;
                    }
                    return match sent {
                        SendStatus::Again => Prime::Leftover(packet),
                        _ => Prime::Primed,
                    };
                }
                Ok(_) => break,
                Err(e) => {
                    tracing::warn!(stream = ?pipe.kind, error = %e, "decode error while priming");
                    break;
                }
            }
        }
        if sent != SendStatus::Again || drained == 0 {
            return Prime::NeedMore;
        }
    }
}
