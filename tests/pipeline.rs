//! Whole-pipeline scenarios on generated media and a virtual sound card.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cadence::audio::{AudioOutput, VirtualOutput};
use cadence::config::PlayerConfig;
use cadence::media::synthetic::{SyntheticBackend, SyntheticSpec};
use cadence::time::Millis;
use cadence::{FetchedFrame, PlaybackError, PlaybackPhase, Player};

/// One device period at 48 kHz
const PERIOD_FRAMES: usize = 480;

fn player(spec: SyntheticSpec) -> (Player<SyntheticBackend>, VirtualOutput) {
    let output = VirtualOutput::new();
    let player = Player::with_defaults(SyntheticBackend::new(spec), Box::new(output.clone()));
    (player, output)
}

/// Presentation times of every video frame due now.
fn drain_due(player: &Player<SyntheticBackend>, seen: &mut Vec<Millis>) -> bool {
    let mut ended = false;
    while let Some(fetched) = player.try_fetch_due_video_frame() {
        match fetched {
            FetchedFrame::Frame { present_ms, .. } => seen.push(present_ms),
            FetchedFrame::EndOfStream => ended = true,
        }
    }
    ended
}

/// Drive the device until `done` holds, fetching video as a renderer would.
fn play_until(
    player: &Player<SyntheticBackend>,
    output: &VirtualOutput,
    seen: &mut Vec<Millis>,
    mut done: impl FnMut(&Player<SyntheticBackend>) -> bool,
) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done(player) {
        assert!(Instant::now() < deadline, "timed out at {} ms", player.played_ms());
        let before = player.played_ms();
        output.pull(PERIOD_FRAMES);
        drain_due(player, seen);
        if player.played_ms() == before {
            // decoders have not caught up yet
            thread::sleep(Duration::from_millis(1));
        }
    }
}

fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn test_end_to_end_video_follows_audio_clock() {
    let (player, output) = player(SyntheticSpec::default());
    player.open("ten_seconds.mp4").unwrap();
    player.start_playback().unwrap();
    assert_eq!(output.spec().map(|s| s.sample_rate), Some(48_000));

    let mut seen = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    while player.played_ms() < 3_000 {
        assert!(Instant::now() < deadline, "timed out at {} ms", player.played_ms());
        let before = player.played_ms();
        output.pull(PERIOD_FRAMES);
        let played = player.played_ms();
        let start = seen.len();
        drain_due(&player, &mut seen);
        for present in &seen[start..] {
            assert!(*present <= player.played_ms(), "frame {} shown at {}", present, played);
        }
        if played == before {
            thread::sleep(Duration::from_millis(1));
        }
    }

    assert!(seen.len() > 30, "only {} frames shown", seen.len());
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "frames out of order: {:?}", seen);
    // 3000 ms plus one device period
    assert!(seen.iter().all(|ms| *ms <= 3_010));
    player.close();
}

#[test]
fn test_seek_before_start_primes_one_frame_per_stream() {
    let (player, _output) = player(SyntheticSpec::default());
    player.open("clip.mp4").unwrap();
    assert_eq!(player.seek_to(5_000).unwrap(), 5_000);

    let depths = player.queue_depths();
    assert_eq!(depths.video_frames, 1);
    assert_eq!(depths.audio_frames, 1);
    assert!((player.played_ms() - 5_000).abs() <= 21);
    assert_eq!(player.phase(), PlaybackPhase::Idle);

    match player.try_fetch_due_video_frame_at(5_000) {
        Some(FetchedFrame::Frame { present_ms, .. }) => assert_eq!(present_ms, 5_000),
        other => panic!("expected the primed frame, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_seek_while_playing_only_shows_later_frames() {
    let (player, output) = player(SyntheticSpec::default());
    player.open("clip.mp4").unwrap();
    player.start_playback().unwrap();

    let mut before_seek = Vec::new();
    play_until(&player, &output, &mut before_seek, |p| p.played_ms() >= 500);

    assert_eq!(player.seek_to(5_100).unwrap(), 5_100);
    assert_eq!(player.phase(), PlaybackPhase::Playing);
    assert!((player.played_ms() - 5_100).abs() <= 21);

    let mut after_seek = Vec::new();
    play_until(&player, &output, &mut after_seek, |p| p.played_ms() >= 6_000);
    assert!(!after_seek.is_empty());
    assert!(after_seek.iter().all(|ms| *ms >= 5_100), "stale frame after seek: {:?}", after_seek);
    assert!(after_seek.windows(2).all(|w| w[0] <= w[1]));
    player.close();
}

#[test]
fn test_seek_backward_then_forward() {
    let (player, output) = player(SyntheticSpec::default());
    player.open("clip.mp4").unwrap();
    player.start_playback().unwrap();
    play_until(&player, &output, &mut Vec::new(), |p| p.played_ms() >= 1_000);

    let back = player.seek_backward().unwrap();
    assert_eq!(back, 0);
    let forward = player.seek_forward().unwrap();
    assert_eq!(forward, 5_000);
    player.close();
}

#[test]
fn test_close_releases_workers_blocked_on_full_queues() {
    let (player, _output) = player(SyntheticSpec::default());
    let player = Arc::new(player);
    player.open("clip.mp4").unwrap();
    player.start_playback().unwrap();

    // nothing pulls, so the timelines and then the channels fill up
    wait_for(|| player.queue_depths().audio_frames == 100);
    thread::sleep(Duration::from_millis(50));

    let (tx, rx) = crossbeam::channel::bounded(1);
    {
        let player = Arc::clone(&player);
        thread::spawn(move || {
            player.close();
            tx.send(()).unwrap();
        });
    }
    assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok(), "close did not finish");
    assert_eq!(player.phase(), PlaybackPhase::Idle);
    assert!(player.media_info().is_none());
}

#[test]
fn test_pause_freezes_clock() {
    let (player, output) = player(SyntheticSpec::default());
    player.open("clip.mp4").unwrap();
    player.start_playback().unwrap();
    play_until(&player, &output, &mut Vec::new(), |p| p.played_ms() >= 500);

    player.pause().unwrap();
    let frozen = player.played_ms();
    assert!(output.is_paused());
    assert!(output.pull(PERIOD_FRAMES).is_none());
    thread::sleep(Duration::from_millis(20));
    assert_eq!(player.played_ms(), frozen);

    player.unpause().unwrap();
    play_until(&player, &output, &mut Vec::new(), |p| p.played_ms() > frozen);
    player.close();
}

#[test]
fn test_speed_change_reopens_device_at_scaled_rate() {
    let (player, output) = player(SyntheticSpec::default());
    player.open("clip.mp4").unwrap();
    player.start_playback().unwrap();
    wait_for(|| player.queue_depths().audio_frames >= 20);

    assert_eq!(player.set_speed(2.0).unwrap(), 2.0);
    let history = output.open_history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].sample_rate, 96_000);
    assert!(!output.is_paused());

    // 100 ms of device time is 200 ms of media
    output.pull_ms(100).unwrap();
    assert_eq!(player.played_ms(), 200);
    player.close();
}

#[test]
fn test_speed_change_while_paused_stays_paused() {
    let (player, output) = player(SyntheticSpec::default());
    player.open("clip.mp4").unwrap();
    player.start_playback().unwrap();
    player.pause().unwrap();
    player.speed_down().unwrap();
    assert_eq!(output.spec().map(|s| s.sample_rate), Some(24_000));
    assert!(output.is_paused());
    assert_eq!(player.phase(), PlaybackPhase::Paused);
    player.close();
}

#[test]
fn test_refused_speed_keeps_previous_rate() {
    let (player, output) = player(SyntheticSpec::default());
    player.open("clip.mp4").unwrap();
    player.start_playback().unwrap();
    wait_for(|| player.queue_depths().audio_frames >= 20);
    output.refuse_rate(72_000);

    assert!(matches!(player.set_speed(1.5), Err(PlaybackError::Audio(_))));
    assert_eq!(player.speed(), 1.0);
    assert_eq!(output.spec().map(|s| s.sample_rate), Some(48_000));
    assert!(!output.is_paused());
    assert_eq!(player.phase(), PlaybackPhase::Playing);

    let before = player.played_ms();
    output.pull_ms(100).unwrap();
    assert_eq!(player.played_ms() - before, 100);
    player.close();
}

#[test]
fn test_refused_speed_while_paused_stays_paused() {
    let (player, output) = player(SyntheticSpec::default());
    player.open("clip.mp4").unwrap();
    player.start_playback().unwrap();
    player.pause().unwrap();
    output.refuse_rate(24_000);

    assert!(player.speed_down().is_err());
    assert_eq!(player.speed(), 1.0);
    assert_eq!(output.spec().map(|s| s.sample_rate), Some(48_000));
    assert!(output.is_paused());
    assert_eq!(player.phase(), PlaybackPhase::Paused);
    player.close();
}

#[test]
fn test_video_only_media_uses_wall_clock() {
    let (player, output) = player(SyntheticSpec::video_only().with_duration_ms(2_000));
    player.open("silent.mp4").unwrap();
    player.start_playback().unwrap();
    assert!(output.open_history().is_empty());

    let mut seen = Vec::new();
    wait_for(|| {
        drain_due(&player, &mut seen);
        player.played_ms() >= 300
    });
    drain_due(&player, &mut seen);
    assert!(!seen.is_empty());
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));

    player.pause().unwrap();
    let frozen = player.played_ms();
    thread::sleep(Duration::from_millis(30));
    assert_eq!(player.played_ms(), frozen);
    player.close();
}

#[test]
fn test_open_failure_reports_and_starts_nothing() {
    let (player, output) = player(SyntheticSpec::failing());
    assert!(matches!(player.open("broken.mp4"), Err(PlaybackError::Media(_))));
    assert!(!player.open_path("broken.mp4"));
    assert!(matches!(player.start_playback(), Err(PlaybackError::NotOpened)));
    assert!(output.open_history().is_empty());
    assert_eq!(player.backend().stats().packets_read, 0);
}

#[test]
fn test_playback_runs_to_end_of_stream() {
    let (player, output) = player(SyntheticSpec::default().with_duration_ms(500).with_unknown_stream_every(4));
    player.open("short.mp4").unwrap();
    player.start_playback().unwrap();

    let mut seen = Vec::new();
    play_until(&player, &output, &mut seen, |p| p.is_finished());
    assert!(seen.len() >= 10, "only {} frames shown", seen.len());
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    assert!(player.played_ms() >= 480);

    // seeking revives a finished pipeline
    player.seek_to(0).unwrap();
    assert!(!player.is_finished());
    player.close();
}

#[test]
fn test_no_packet_or_frame_outlives_the_session() {
    let (player, output) = player(SyntheticSpec::default());
    player.open("clip.mp4").unwrap();
    player.start_playback().unwrap();
    play_until(&player, &output, &mut Vec::new(), |p| p.played_ms() >= 1_000);
    player.seek_to(7_000).unwrap();
    play_until(&player, &output, &mut Vec::new(), |p| p.played_ms() >= 7_500);
    player.close();

    let stats = player.backend().stats();
    assert!(stats.packets_read > 0);
    assert_eq!(stats.live_packets, 0);
    assert_eq!(stats.live_frames, 0);
}

#[test]
fn test_reopen_after_close() {
    let (player, output) = player(SyntheticSpec::default());
    player.open("first.mp4").unwrap();
    player.start_playback().unwrap();
    play_until(&player, &output, &mut Vec::new(), |p| p.played_ms() >= 200);

    player.open("second.mp4").unwrap();
    assert_eq!(player.phase(), PlaybackPhase::Idle);
    assert_eq!(player.played_ms(), 0);
    assert!(!output.is_open());
    player.start_playback().unwrap();
    play_until(&player, &output, &mut Vec::new(), |p| p.played_ms() >= 200);
    drop(player);
}

#[test]
fn test_seek_past_short_audio_with_small_channels() {
    let spec = SyntheticSpec::default().with_audio_duration_ms(2_000);
    let config = PlayerConfig {
        packet_channel_capacity: 4,
        ..PlayerConfig::default()
    };
    let output = VirtualOutput::new();
    let player = Arc::new(Player::new(SyntheticBackend::new(spec), Box::new(output), config).unwrap());
    player.open("short_audio.mp4").unwrap();

    // the last audio frame starts at 1984 ms, so priming reads to end of file
    let (tx, rx) = crossbeam::channel::bounded(1);
    {
        let player = Arc::clone(&player);
        thread::spawn(move || tx.send(player.seek_to(1_990)).unwrap());
    }
    let landed = rx.recv_timeout(Duration::from_secs(2)).expect("seek did not finish");
    assert_eq!(landed.unwrap(), 1_990);
    let depths = player.queue_depths();
    assert_eq!(depths.video_frames, 1);
    assert_eq!(depths.audio_frames, 0);

    player.start_playback().unwrap();
    wait_for(|| player.queue_depths().video_frames > 1);

    let (tx, rx) = crossbeam::channel::bounded(1);
    {
        let player = Arc::clone(&player);
        thread::spawn(move || {
            player.close();
            tx.send(()).unwrap();
        });
    }
    assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok(), "close did not finish");
    assert_eq!(player.backend().stats().live_packets, 0);
}

#[test]
fn test_seek_beyond_audio_end_skips_audio_priming() {
    let (player, _output) = player(SyntheticSpec::default().with_audio_duration_ms(2_000));
    player.open("short_audio.mp4").unwrap();
    assert_eq!(player.seek_to(6_000).unwrap(), 6_000);
    let depths = player.queue_depths();
    assert_eq!(depths.video_frames, 1);
    assert_eq!(depths.audio_frames, 0);
    // priming stops at the video keyframe instead of reading to end of file
    assert!(player.backend().stats().packets_read < 300);
    player.close();
}

#[test]
fn test_slow_video_decode_drops_late_frames_in_order() {
    let spec = SyntheticSpec::video_only()
        .with_duration_ms(4_000)
        .with_decode_delay(Duration::from_millis(25));
    let (player, _output) = player(spec);
    player.open("slow.mp4").unwrap();
    player.start_playback().unwrap();

    let mut seen = Vec::new();
    wait_for(|| {
        drain_due(&player, &mut seen);
        player.played_ms() >= 500
    });
    // the clock now outruns the decoder
    player.set_speed(2.0).unwrap();
    wait_for(|| {
        drain_due(&player, &mut seen);
        player.played_ms() >= 3_000
    });
    drain_due(&player, &mut seen);

    assert!(!seen.is_empty());
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "frames out of order: {:?}", seen);
    // 90 frames fall before 3000 ms
    assert!(seen.len() < 70, "{} frames shown, none dropped", seen.len());
    assert!(player.backend().stats().frames_decoded as usize > seen.len());
    player.close();
}

