use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::EnvFilter;

use toy_link::voice::{
    CpalMicrophone, CpalSpeaker, MediaTrack, PlaybackSink, SAMPLE_RATE, analyze_frame,
    samples_to_wav,
};
use toy_link::{
    ClientConfig, ClientEvent, ConfigOverrides, CpalDevices, ErrorKind, MediaDevices,
    SilentDevices, ToyClient,
};

/// Toy Link - Device-side voice client for AI toys
#[derive(Parser)]
#[command(name = "toy-link", version, about)]
struct Cli {
    /// Gateway base URL (e.g. `https://gateway.example.com`)
    #[arg(long)]
    gateway_url: Option<String>,

    /// Device identifier
    #[arg(long)]
    device_id: Option<String>,

    /// Toy identifier
    #[arg(long)]
    toy_id: Option<String>,

    /// User identifier
    #[arg(long)]
    user_id: Option<String>,

    /// ICE server URL (repeatable)
    #[arg(long = "ice-server")]
    ice_servers: Vec<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to the gateway and stream audio until interrupted
    Run {
        /// Use silent audio devices (for hosts without audio hardware)
        #[arg(long, env = "TOY_LINK_HEADLESS")]
        headless: bool,

        /// Send `start_recording` as soon as the control channel opens
        #[arg(long)]
        record_on_connect: bool,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,

        /// Write the captured audio to a WAV file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Test speaker output
    TestSpeaker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,toy_link=info",
        1 => "info,toy_link=debug",
        2 => "debug",
        _ => "trace",
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let overrides = ConfigOverrides {
        gateway_url: cli.gateway_url,
        device_id: cli.device_id,
        toy_id: cli.toy_id,
        user_id: cli.user_id,
        ice_servers: (!cli.ice_servers.is_empty()).then_some(cli.ice_servers),
    };

    match cli.command {
        Some(Command::TestMic { duration, output }) => test_mic(duration, output).await,
        Some(Command::TestSpeaker) => test_speaker().await,
        Some(Command::Run {
            headless,
            record_on_connect,
        }) => run_client(overrides, headless, record_on_connect).await,
        None => run_client(overrides, false, false).await,
    }
}

/// Connect and report events until Ctrl-C or the reconnect budget runs out
async fn run_client(
    overrides: ConfigOverrides,
    headless: bool,
    record_on_connect: bool,
) -> anyhow::Result<()> {
    let config = ClientConfig::load_with(overrides)?;
    tracing::debug!(?config, "loaded configuration");

    let devices: Arc<dyn MediaDevices> = if headless {
        tracing::info!("headless mode, using silent audio devices");
        Arc::new(SilentDevices)
    } else {
        Arc::new(CpalDevices)
    };

    let client = ToyClient::builder(config).devices(devices).build()?;
    let mut events = client.subscribe();

    tracing::info!(gateway = %client.config().gateway_url, "connecting");
    match client.connect().await {
        Ok(session) => tracing::info!(
            session_id = %session.session_id,
            thread_id = %session.thread_id,
            "session established"
        ),
        Err(e) if e.kind() == ErrorKind::MediaAcquisition => {
            anyhow::bail!("microphone unavailable: {e}");
        }
        Err(e) if e.triggers_reconnect() => {
            tracing::warn!(error = %e, "initial connection failed, retrying");
        }
        Err(e) => return Err(e.into()),
    }

    let result = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break Ok(());
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if let Some(outcome) = report(&client, &event, record_on_connect).await {
                        break outcome;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "event listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break Ok(()),
            },
        }
    };

    client.disconnect().await;
    result
}

/// Log one client event; `Some` ends the run
async fn report(
    client: &ToyClient,
    event: &ClientEvent,
    record_on_connect: bool,
) -> Option<anyhow::Result<()>> {
    match event {
        ClientEvent::Connected { session } => {
            tracing::info!(session_id = %session.session_id, "connected");
        }
        ClientEvent::ConnectionStateChange { state } => {
            tracing::info!(state = %state, "connection state");
        }
        ClientEvent::DataChannelOpen => {
            tracing::info!("control channel open");
            if record_on_connect && !client.start_recording().await {
                tracing::warn!("could not request recording");
            }
        }
        ClientEvent::RemoteAudio { stream_id, .. } => {
            tracing::info!(stream_id = %stream_id, "receiving gateway audio");
        }
        ClientEvent::Transcription { text } => tracing::info!(text = %text, "heard"),
        ClientEvent::AiResponse { text } => tracing::info!(text = %text, "reply"),
        ClientEvent::ServerError { message } => {
            tracing::warn!(message = %message, "gateway error");
        }
        ClientEvent::VoiceActivity { .. } | ClientEvent::AudioLevel { .. } => {}
        ClientEvent::Error { kind, message } => {
            tracing::warn!(kind = ?kind, message = %message, "client error");
        }
        ClientEvent::MaxReconnectAttemptsReached { attempts } => {
            return Some(Err(anyhow::anyhow!(
                "gave up after {attempts} reconnect attempts"
            )));
        }
        other => tracing::debug!(event = other.name(), "event"),
    }
    None
}

/// Test microphone input
async fn test_mic(duration: u64, output: Option<PathBuf>) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let (tx, mut rx) = mpsc::channel(64);
    let mut microphone = CpalMicrophone::open(tx)?;

    println!("Sample rate: {SAMPLE_RATE} Hz");
    println!("---");

    let mut recorded = Vec::new();
    for i in 0..duration {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        let mut second = Vec::new();
        while let Ok(Some(frame)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            second.extend_from_slice(&frame);
        }

        let level = analyze_frame(&second);
        let peak = second.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (level.level * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | {} [{}]",
            i + 1,
            level.level,
            peak,
            if level.is_speaking { "voice" } else { "     " },
            meter
        );

        recorded.extend_from_slice(&second);
    }

    microphone.stop();

    if let Some(path) = output {
        let wav = samples_to_wav(&recorded, SAMPLE_RATE)?;
        tokio::fs::write(&path, wav).await?;
        println!("\nWrote {} samples to {}", recorded.len(), path.display());
    }

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Test speaker output with a sine wave
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let speaker = CpalSpeaker::open()?;

    let frequency = 440.0_f32;
    let num_samples = SAMPLE_RATE as usize * 2;

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..num_samples)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
        })
        .collect();

    println!("Playing {} samples at {} Hz...", samples.len(), SAMPLE_RATE);
    speaker.write(&samples);

    while speaker.queued() > 0 {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    speaker.stop();

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}
