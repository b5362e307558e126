//! Demux worker: the only thread that reads the container during playback.

use std::sync::atomic::Ordering;

use super::fatal;
use super::session::{Readahead, Session};
use super::state::WorkerStatus;
use crate::media::{Demuxer, MediaBackend};

/// Body of the demux thread.
///
/// Reads while `Working`, first draining whatever the last seek read ahead.
/// At end of file the worker marks itself `Idle`, signals end of stream
/// downstream and waits; a seek sets it back to `Working`. Packets are sent
/// after the demuxer lock is released so a full channel never blocks a seek.
pub fn run<B: MediaBackend>(session: &Session<B>) {
    let control = &session.demux_control;
    tracing::debug!("demux worker started");
    let mut read = 0u64;
    loop {
        if control.wait_until_active() == WorkerStatus::Exiting {
            break;
        }

        let mut demuxer = session.demuxer.lock();
        if control.status() != WorkerStatus::Working {
            continue;
        }
        let epoch = session.epoch.load(Ordering::SeqCst);
        let next = match session.readahead.lock().pop_front() {
            Some(Readahead::Packet(packet)) => Ok(Some(packet)),
            Some(Readahead::EndOfFile) => Ok(None),
            None => demuxer.read_packet(),
        };
        match next {
            Ok(Some(packet)) => {
                drop(demuxer);
                read += 1;
                if !session.route(packet, epoch) {
                    break;
                }
            }
            Ok(None) => {
                let idled = control.compare_and_set(WorkerStatus::Working, WorkerStatus::Idle);
                drop(demuxer);
                if idled {
                    tracing::info!(packets = read, epoch, "end of file reached");
                    session.send_end_of_stream(epoch);
                }
            }
            Err(e) => fatal("demuxer read failed", &e),
        }
    }
    tracing::info!(packets = read, "demux worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlayerConfig;
    use crate::media::synthetic::{SyntheticBackend, SyntheticSpec};
    use crate::playback::decode::PacketMessage;
    use crate::playback::sync::ClockState;
    use std::path::Path;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn session(spec: SyntheticSpec) -> Arc<Session<SyntheticBackend>> {
        let backend = SyntheticBackend::new(spec);
        let opened = backend.open(Path::new("clip.mp4")).unwrap();
        Arc::new(Session::new(opened, Arc::new(ClockState::new()), &PlayerConfig::default()))
    }

    #[test]
    fn test_demux_routes_and_idles_at_end_of_file() {
        let session = session(SyntheticSpec::default().with_duration_ms(200).with_unknown_stream_every(5));
        let worker = {
            let session = Arc::clone(&session);
            thread::spawn(move || run(&session))
        };

        let video = session.video.as_ref().unwrap();
        let audio = session.audio.as_ref().unwrap();
        let mut video_packets = 0;
        loop {
            match video.packets.receive_timeout(Duration::from_secs(2)).unwrap() {
                PacketMessage::Packet { .. } => video_packets += 1,
                PacketMessage::EndOfStream { epoch } => {
                    assert_eq!(epoch, 0);
                    break;
                }
            }
        }
        assert_eq!(video_packets, 6);
        let mut audio_packets = 0;
        while let PacketMessage::Packet { .. } = audio.packets.receive_timeout(Duration::from_secs(2)).unwrap() {
            audio_packets += 1;
        }
        assert_eq!(audio_packets, 10);

        assert_eq!(session.demux_control.status(), WorkerStatus::Idle);
        session.shutdown();
        worker.join().unwrap();
    }

    #[test]
    fn test_shutdown_releases_demux_blocked_on_full_channel() {
        let session = session(SyntheticSpec::default());
        let worker = {
            let session = Arc::clone(&session);
            thread::spawn(move || run(&session))
        };
        // default capacity fills long before ten seconds of packets
        thread::sleep(Duration::from_millis(50));
        let (tx, rx) = crossbeam::channel::bounded(1);
        thread::spawn(move || {
            worker.join().unwrap();
            tx.send(()).unwrap();
        });
        session.shutdown();
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn test_readahead_is_replayed_before_reading() {
        let backend = SyntheticBackend::new(SyntheticSpec::default());
        let mut opened = backend.open(Path::new("clip.mp4")).unwrap();
        let first = opened.demuxer.read_packet().unwrap().unwrap();
        let session = Arc::new(Session::new(opened, Arc::new(ClockState::new()), &PlayerConfig::default()));
        {
            let mut readahead = session.readahead.lock();
            readahead.push_back(Readahead::Packet(first));
            readahead.push_back(Readahead::EndOfFile);
        }
        let worker = {
            let session = Arc::clone(&session);
            thread::spawn(move || run(&session))
        };

        let video = session.video.as_ref().unwrap();
        assert!(matches!(
            video.packets.receive_timeout(Duration::from_secs(2)).unwrap(),
            PacketMessage::Packet { epoch: 0, .. }
        ));
        assert!(matches!(
            video.packets.receive_timeout(Duration::from_secs(2)).unwrap(),
            PacketMessage::EndOfStream { epoch: 0 }
        ));
        let audio = session.audio.as_ref().unwrap();
        assert!(matches!(
            audio.packets.receive_timeout(Duration::from_secs(2)).unwrap(),
            PacketMessage::EndOfStream { epoch: 0 }
        ));
        assert_eq!(session.demux_control.status(), WorkerStatus::Idle);
        // only the packet read above came from the file
        assert_eq!(backend.stats().packets_read, 1);
        session.shutdown();
        worker.join().unwrap();
    }
}
