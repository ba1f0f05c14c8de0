mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cadence_host::{
    AvatarData, Callback, FunctionRef, HostConfig, HostEvent, Node, NodeType, PacketType,
    ScriptHost, ScriptRegistry, ScriptSignal, ScriptValue, Sound,
};
use common::*;
use glam::{Quat, Vec3};
use uuid::Uuid;

fn registry() -> Arc<ScriptRegistry> {
    Arc::new(ScriptRegistry::new())
}

#[test]
fn test_run_emits_lifecycle_events_in_order() {
    let evaluator = ScriptedEvaluator::new().program("main", |ctx| {
        ctx.set_timeout(stopper(), 20);
        Ok(ScriptValue::Number(1.0))
    });
    let host = ScriptHost::builder(registry(), evaluator.boxed())
        .contents("main")
        .origin("file:///scripts/main.js")
        .config(test_config())
        .build();
    let mut rx = host.subscribe();

    host.run().unwrap();
    let events = drain_events(&mut rx);

    assert_eq!(events.first(), Some(&HostEvent::RunningStateChanged));
    assert_eq!(
        events[1],
        HostEvent::EvaluationFinished {
            result: ScriptValue::Number(1.0),
            had_exception: false,
        }
    );
    assert!(events.iter().any(|e| matches!(e, HostEvent::Update { .. })));

    let ending = position_of(&events, &HostEvent::ScriptEnding).unwrap();
    let finished = position_of(
        &events,
        &HostEvent::Finished {
            origin: "file:///scripts/main.js".to_string(),
        },
    )
    .unwrap();
    assert!(ending < finished);
    assert_eq!(events.last(), Some(&HostEvent::DoneRunning));
    assert_eq!(events[events.len() - 2], HostEvent::RunningStateChanged);

    assert!(!host.is_running());
    assert!(host.is_finished());
    assert_eq!(evaluator.init_count(), 1);
}

#[test]
fn test_body_fault_is_reported_and_loop_keeps_running() {
    let evaluator = ScriptedEvaluator::new();
    let host = ScriptHost::builder(registry(), evaluator.boxed())
        .contents("throw ReferenceError: x is not defined")
        .origin("main.js")
        .config(test_config())
        .build();
    let mut rx = host.subscribe();

    host.handle()
        .invoke(|ctx| {
            ctx.set_timeout(stopper(), 10);
        })
        .unwrap();
    host.run().unwrap();
    let events = drain_events(&mut rx);

    assert!(events.contains(&HostEvent::ErrorMessage {
        message: "Uncaught exception at (main.js) line 1: ReferenceError: x is not defined"
            .to_string(),
    }));
    assert!(events.contains(&HostEvent::EvaluationFinished {
        result: ScriptValue::String("ReferenceError: x is not defined".to_string()),
        had_exception: true,
    }));
    assert_eq!(events.last(), Some(&HostEvent::DoneRunning));
}

#[test]
fn test_update_signal_receives_delta_seconds() {
    let deltas = Arc::new(Mutex::new(Vec::new()));
    let recorded = deltas.clone();
    let evaluator = ScriptedEvaluator::new().program("main", move |ctx| {
        let recorded = recorded.clone();
        ctx.connect(
            ScriptSignal::Update,
            Callback::native(move |ctx, args| {
                let mut deltas = recorded.lock().unwrap();
                deltas.push(args[0].as_number().unwrap_or(-1.0));
                if deltas.len() == 3 {
                    ctx.stop();
                }
                Ok(ScriptValue::Undefined)
            }),
        );
        Ok(ScriptValue::Undefined)
    });
    let host = ScriptHost::builder(registry(), evaluator.boxed())
        .contents("main")
        .config(test_config())
        .build();
    let mut rx = host.subscribe();

    host.run().unwrap();

    let deltas = deltas.lock().unwrap();
    assert_eq!(deltas.len(), 3, "stopping inside update ends the loop");
    assert!(deltas.iter().all(|d| *d >= 0.0 && *d < 1.0));

    let updates = drain_events(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, HostEvent::Update { .. }))
        .count();
    assert_eq!(updates, 3);
}

#[test]
fn test_timer_fault_does_not_stop_loop() {
    let evaluator = ScriptedEvaluator::new().program("main", |ctx| {
        ctx.set_interval(FunctionRef::new("missing"), 5);
        ctx.set_timeout(stopper(), 40);
        Ok(ScriptValue::Undefined)
    });
    let host = ScriptHost::builder(registry(), evaluator.boxed())
        .contents("main")
        .origin("tick.js")
        .config(test_config())
        .build();
    let mut rx = host.subscribe();

    host.run().unwrap();
    let events = drain_events(&mut rx);

    let faults = events
        .iter()
        .filter(|e| matches!(e, HostEvent::ErrorMessage { .. }))
        .count();
    assert!(faults >= 2, "interval kept firing after a fault, got {faults}");
    assert!(evaluator.called().iter().all(|name| name == "missing"));
    assert_eq!(events.last(), Some(&HostEvent::DoneRunning));
}

#[test]
fn test_cleared_timer_never_fires() {
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let evaluator = ScriptedEvaluator::new().program("main", move |ctx| {
        let counter = counter.clone();
        let interval = ctx.set_interval(
            Callback::native(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(ScriptValue::Undefined)
            }),
            5,
        );
        assert!(ctx.clear_timer(interval.unwrap()));
        assert!(!ctx.clear_timer(interval.unwrap()));
        ctx.set_timeout(stopper(), 30);
        Ok(ScriptValue::Undefined)
    });
    let host = ScriptHost::builder(registry(), evaluator.boxed())
        .contents("main")
        .config(test_config())
        .build();

    host.run().unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn test_timers_are_cancelled_before_script_ending() {
    let timers_at_ending = Arc::new(Mutex::new(None));
    let observed = timers_at_ending.clone();
    let evaluator = ScriptedEvaluator::new().program("main", move |ctx| {
        ctx.set_interval(Callback::native(|_, _| Ok(ScriptValue::Undefined)), 5);
        ctx.set_timeout(Callback::native(|_, _| Ok(ScriptValue::Undefined)), 60_000);
        let observed = observed.clone();
        ctx.connect(
            ScriptSignal::ScriptEnding,
            Callback::native(move |ctx, _| {
                *observed.lock().unwrap() = Some(ctx.active_timers());
                // the host is on its way out, new timers are refused
                assert!(ctx.set_timeout(stopper(), 1).is_none());
                Ok(ScriptValue::Undefined)
            }),
        );
        ctx.set_timeout(stopper(), 20);
        Ok(ScriptValue::Undefined)
    });
    let host = ScriptHost::builder(registry(), evaluator.boxed())
        .contents("main")
        .config(test_config())
        .build();

    host.run().unwrap();
    assert_eq!(*timers_at_ending.lock().unwrap(), Some(0));
}

#[test]
fn test_invoke_runs_on_host_thread() {
    let thread_name = Arc::new(Mutex::new(None));
    let seen = thread_name.clone();
    let evaluator = ScriptedEvaluator::new();
    let host = ScriptHost::builder(registry(), evaluator.boxed())
        .config(test_config())
        .build();
    let expected = format!("script-{}", host.id());
    let mut rx = host.subscribe();

    let (handle, thread) = host.spawn().unwrap();
    handle
        .invoke(move |ctx| {
            *seen.lock().unwrap() = std::thread::current().name().map(str::to_string);
            ctx.print("from outside");
            ctx.stop();
        })
        .unwrap();
    thread.join().unwrap();

    assert_eq!(thread_name.lock().unwrap().as_deref(), Some(expected.as_str()));
    assert!(drain_events(&mut rx).contains(&HostEvent::PrintedMessage {
        message: "from outside".to_string()
    }));
    // the host was dropped with its thread
    assert!(handle.invoke(|_| {}).is_err());
}

#[test]
fn test_entity_edits_flush_every_tick_and_on_exit() {
    let sender = Arc::new(CountingEntitySender::default());
    let updates = Arc::new(AtomicUsize::new(0));
    let counter = updates.clone();
    let evaluator = ScriptedEvaluator::new().program("main", move |ctx| {
        let counter = counter.clone();
        ctx.connect(
            ScriptSignal::Update,
            Callback::native(move |ctx, _| {
                if counter.fetch_add(1, Ordering::SeqCst) + 1 == 4 {
                    ctx.stop();
                }
                Ok(ScriptValue::Undefined)
            }),
        );
        Ok(ScriptValue::Undefined)
    });
    let host = ScriptHost::builder(registry(), evaluator.boxed())
        .contents("main")
        .config(test_config())
        .entity_sender(sender.clone())
        .build();

    host.run().unwrap();

    assert_eq!(updates.load(Ordering::SeqCst), 4);
    assert_eq!(sender.released.load(Ordering::SeqCst), 5);
    assert_eq!(sender.processed.load(Ordering::SeqCst), 5);
}

struct FixedAvatar;

impl AvatarData for FixedAvatar {
    fn position(&self) -> Vec3 {
        Vec3::new(0.5, 1.5, 2.5)
    }
    fn head_orientation(&self) -> Quat {
        Quat::IDENTITY
    }
    fn to_byte_array(&self) -> Vec<u8> {
        vec![7, 7, 7]
    }
    fn send_identity_packet(&self) {}
    fn send_billboard_packet(&self) {}
}

#[test]
fn test_avatar_sound_streams_until_detached() {
    let audio_mixer = Node::new(Uuid::new_v4(), NodeType::AudioMixer);
    let avatar_mixer = Node::new(Uuid::new_v4(), NodeType::AvatarMixer);
    let nodes = RecordingNodes::with_nodes(vec![audio_mixer.clone(), avatar_mixer.clone()]);
    let avatar: Arc<dyn AvatarData> = Arc::new(FixedAvatar);

    // 5ms at 24kHz: 120 samples per tick, so 300 samples take three frames
    let config = HostConfig {
        sample_rate: 24_000,
        ..test_config()
    };
    let sound = Arc::new(Sound::from_samples(&[100i16; 300]));
    let script_avatar = avatar.clone();
    let evaluator = ScriptedEvaluator::new().program("main", move |ctx| {
        ctx.set_is_avatar(true);
        ctx.set_avatar_data(Some(&script_avatar));
        ctx.set_avatar_sound(Some(sound.clone()));
        ctx.connect(
            ScriptSignal::Update,
            Callback::native(|ctx, _| {
                if !ctx.is_playing_avatar_sound() {
                    ctx.stop();
                }
                Ok(ScriptValue::Undefined)
            }),
        );
        Ok(ScriptValue::Undefined)
    });
    let host = ScriptHost::builder(registry(), evaluator.boxed())
        .contents("main")
        .config(config)
        .node_directory(nodes.clone())
        .build();

    host.run().unwrap();

    let audio = nodes.packets_to(audio_mixer.id, PacketType::MicrophoneAudioNoEcho as u8);
    assert_eq!(audio.len(), 3);
    let sequences: Vec<u16> = audio
        .iter()
        .map(|p| u16::from_le_bytes([p[2], p[3]]))
        .collect();
    assert_eq!(sequences, vec![0, 1, 2]);
    let payload = |p: &Vec<u8>| p.len() - (2 + 2 + 1 + 12 + 16);
    assert_eq!(payload(&audio[0]), 240);
    assert_eq!(payload(&audio[2]), 120);

    let avatar_packets = nodes.packets_to(avatar_mixer.id, PacketType::AvatarData as u8);
    assert_eq!(avatar_packets.len(), 3);
    assert_eq!(&avatar_packets[0][2..], &[7, 7, 7]);

    // nothing silent was sent: not listening
    assert!(nodes
        .packets_to(audio_mixer.id, PacketType::SilentAudioFrame as u8)
        .is_empty());
    drop(avatar);
}

#[test]
fn test_avatar_data_is_not_kept_alive() {
    let avatar_mixer = Node::new(Uuid::new_v4(), NodeType::AvatarMixer);
    let nodes = RecordingNodes::with_nodes(vec![avatar_mixer]);
    let avatar: Arc<dyn AvatarData> = Arc::new(FixedAvatar);

    let host = ScriptHost::builder(registry(), ScriptedEvaluator::new().boxed())
        .config(test_config())
        .node_directory(nodes.clone())
        .build();
    host.set_avatar_data(Some(&avatar));
    drop(avatar);

    let handle = host.handle();
    handle
        .invoke(|ctx| {
            ctx.set_is_avatar(true);
            ctx.set_timeout(stopper(), 20);
        })
        .unwrap();
    host.run().unwrap();

    assert!(nodes.sent.lock().unwrap().is_empty());
}

#[test]
fn test_set_script_contents_and_filename() {
    let host = ScriptHost::builder(registry(), ScriptedEvaluator::new().boxed())
        .contents("old")
        .origin("https://example.com/scripts/old.js")
        .build();
    assert_eq!(host.filename(), "old.js");

    host.set_script_contents("new", "/local/dir/new.js").unwrap();
    assert_eq!(host.contents(), "new");
    assert_eq!(host.origin(), "/local/dir/new.js");
    assert_eq!(host.filename(), "new.js");
}

#[test]
fn test_load_url_reads_local_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("local.js");
    std::fs::write(&path, "print('local')").unwrap();

    let host = ScriptHost::builder(registry(), ScriptedEvaluator::new().boxed()).build();
    let mut rx = host.subscribe();

    host.load_url(path.to_str().unwrap()).unwrap();
    assert_eq!(host.contents(), "print('local')");
    assert_eq!(
        drain_events(&mut rx),
        vec![HostEvent::ScriptLoaded {
            origin: path.display().to_string()
        }]
    );

    let missing = dir.path().join("missing.js");
    host.load_url(missing.to_str().unwrap()).unwrap();
    assert_eq!(
        drain_events(&mut rx),
        vec![HostEvent::ErrorLoadingScript {
            origin: missing.display().to_string()
        }]
    );
}

#[test]
fn test_load_url_remote_lands_through_fetcher() {
    let fetcher = MapFetcher::new(&[("https://example.com/remote.js", "remote body")]);
    let host = ScriptHost::builder(registry(), ScriptedEvaluator::new().boxed())
        .fetcher(fetcher)
        .build();
    let mut rx = host.subscribe();

    host.load_url("https://example.com/remote.js").unwrap();
    let envelope = rx.blocking_recv().unwrap();

    assert_eq!(
        envelope.event,
        HostEvent::ScriptLoaded {
            origin: "https://example.com/remote.js".to_string()
        }
    );
    assert_eq!(host.contents(), "remote body");
}

#[test]
fn test_spawned_host_finishes_and_unregisters() {
    let registry = registry();
    let host = ScriptHost::builder(registry.clone(), ScriptedEvaluator::new().boxed())
        .config(test_config())
        .build();
    assert!(registry.contains(host.id()));

    let (handle, thread) = host.spawn().unwrap();
    assert!(wait_until(Duration::from_secs(2), || handle.is_running()));
    handle.stop();
    thread.join().unwrap();

    assert!(!handle.is_running());
    assert!(registry.is_empty());
}

#[test]
fn test_ticks_follow_a_fixed_schedule_and_catch_up() {
    const TICKS: usize = 40;
    const SLOW_TICK: usize = 10;
    let stamps = Arc::new(Mutex::new(Vec::new()));
    let recorded = stamps.clone();
    let evaluator = ScriptedEvaluator::new().program("main", move |ctx| {
        let recorded = recorded.clone();
        ctx.connect(
            ScriptSignal::Update,
            Callback::native(move |ctx, _| {
                let mut stamps = recorded.lock().unwrap();
                stamps.push(Instant::now());
                if stamps.len() == SLOW_TICK {
                    std::thread::sleep(Duration::from_millis(60));
                }
                if stamps.len() == TICKS {
                    ctx.stop();
                }
                Ok(ScriptValue::Undefined)
            }),
        );
        Ok(ScriptValue::Undefined)
    });
    let host = ScriptHost::builder(registry(), evaluator.boxed())
        .contents("main")
        .config(test_config())
        .build();

    host.run().unwrap();

    let stamps = stamps.lock().unwrap();
    assert_eq!(stamps.len(), TICKS);

    // Overdue ticks after the stall run back to back
    let catch_up = stamps[SLOW_TICK..SLOW_TICK + 6]
        .windows(2)
        .filter(|pair| pair[1] - pair[0] < Duration::from_millis(3))
        .count();
    assert!(catch_up >= 3, "expected catch-up ticks, got {catch_up}");

    // The stall is absorbed: the last tick is still due at (TICKS - 1) * 5ms
    let elapsed = stamps[TICKS - 1] - stamps[0];
    assert!(elapsed >= Duration::from_millis(190), "ran ahead: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(240), "drifted: {elapsed:?}");
}
