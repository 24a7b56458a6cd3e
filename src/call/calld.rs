use anyhow::Result;
use clap::Parser;
use peer::{CallController, CallEvent};
use peercall::{init_runtime, CallArgs, MqttArgs, PeerArgs};
use signal::{ParticipantId, Signal, SignalingChannel};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "calld")]
#[command(about = "WebRTC Call - Two-party audio/video call negotiated over MQTT")]
struct Args {
    #[command(flatten)]
    call: CallArgs,

    #[command(flatten)]
    mqtt: MqttArgs,

    #[command(flatten)]
    peer: PeerArgs,
}

/// Returns false when the user asked to hang up.
async fn handle_input(controller: &CallController, line: &str) -> bool {
    match line {
        "a" => match controller.toggle_audio().await {
            Some(enabled) => info!("Audio {}", if enabled { "on" } else { "muted" }),
            None => warn!("No local audio track"),
        },
        "v" => match controller.toggle_video().await {
            Some(enabled) => info!("Video {}", if enabled { "on" } else { "off" }),
            None => warn!("No local video track"),
        },
        "c" => match controller.switch_camera().await {
            Ok(true) => info!("Camera switched"),
            Ok(false) => warn!("Camera can only be switched during a connected call"),
            Err(e) => warn!("Failed to switch camera: {}", e),
        },
        "q" => return false,
        "" => {}
        other => warn!("Unknown command {:?} (a: audio, v: video, c: camera, q: hang up)", other),
    }
    true
}

#[tokio::main]
async fn main() -> Result<()> {
    init_runtime();

    let args = Args::parse();
    let local_id = ParticipantId::new(args.call.local_id.as_str());

    let (signal, signal_events) = Signal::connect(local_id, args.mqtt.to_config()?).await?;
    let signal = Arc::new(signal);

    let (controller, event_loop) = CallController::builder()
        .signaling(signal.clone(), signal_events)
        .peer(args.peer.to_config())
        .constraints(args.call.to_constraints())
        .run()
        .await?;

    let mut call_events = controller.subscribe();
    controller.start_call().await?;
    info!("Waiting for a peer in room {}", args.mqtt.room);

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = stdin.next_line() => match line? {
                Some(line) => {
                    if !handle_input(&controller, line.trim()).await {
                        break;
                    }
                }
                None => break,
            },
            event = call_events.recv() => match event {
                Ok(CallEvent::State(state)) => info!("Call {}", state),
                Ok(CallEvent::RemoteMedia(media)) => {
                    info!("Receiving {} from peer: {}", media.kind, media.track_id)
                }
                Ok(CallEvent::LocalMedia(tracks)) => debug!("Local stream {}", tracks.stream_id),
                Ok(CallEvent::Ended(reason)) => {
                    info!("Call ended: {:?}", reason);
                    break;
                }
                Err(RecvError::Lagged(n)) => warn!("Missed {} call events", n),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    controller.hangup().await;
    signal.disconnect().await;
    event_loop.abort();

    Ok(())
}
