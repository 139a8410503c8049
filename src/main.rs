use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use axum_server::tls_rustls::RustlsConfig;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{info, warn};

use voice_relay_gateway::{
    ServerConfig, build_router,
    client::{
        ConversationState, NullOutput, SessionEvent, VoiceSession, VoiceSessionConfig,
        WavFileMicrophone, WavFileOutput,
    },
    core::audio::{AudioOutput, PlaybackQueue},
    core::realtime::{DEFAULT_RESPONSE_INSTRUCTIONS, REALTIME_SAMPLE_RATE, SessionMode},
    state::AppState,
};

/// Silence appended to the input in auto mode so server VAD ends the turn
const AUTO_TRAILING_SILENCE: Duration = Duration::from_millis(1500);

/// Voice relay - realtime audio relay for the research assistant
#[derive(Parser, Debug)]
#[command(name = "voice-relay-gateway")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Subcommand to run (defaults to `serve`)
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the relay server
    Serve,

    /// Hold one spoken turn with a running relay, using WAV files as audio devices
    Talk {
        /// Mono 16-bit 24 kHz WAV to send as microphone input
        #[arg(short = 'i', long = "input")]
        input: PathBuf,

        /// Where to write the assistant's audio (discarded if not set)
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,

        /// Turn-taking mode: manual (push-to-talk) or auto (server VAD)
        #[arg(short = 'm', long = "mode", default_value = "manual")]
        mode: SessionMode,

        /// Relay endpoint
        #[arg(long = "url", default_value = "ws://localhost:3005/realtime")]
        url: String,

        /// Relay API secret
        #[arg(long = "token")]
        token: Option<String>,

        /// Instructions sent with each response request
        #[arg(long = "instructions", default_value = DEFAULT_RESPONSE_INSTRUCTIONS)]
        instructions: String,

        /// Seconds to wait for commit and response acknowledgements
        #[arg(long = "ack-timeout-secs", default_value_t = 15)]
        ack_timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt::init();

    // Must be installed before any TLS connection is attempted
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(cli.config).await,
        Commands::Talk {
            input,
            output,
            mode,
            url,
            token,
            instructions,
            ack_timeout_secs,
        } => {
            let mut session = VoiceSessionConfig::new(url, mode);
            session.token = token;
            session.instructions = instructions;
            session.ack_timeout = Duration::from_secs(ack_timeout_secs);
            talk(session, input, output).await
        }
    }
}

async fn serve(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = if let Some(config_path) = config_path {
        info!("Loading configuration from {}", config_path.display());
        ServerConfig::from_file(&config_path).map_err(|e| anyhow!(e.to_string()))?
    } else {
        ServerConfig::from_env().map_err(|e| anyhow!(e.to_string()))?
    };

    if config.openai_api_key.is_none() {
        warn!("OPENAI_API_KEY is not set, relay sessions will fail to reach the realtime service");
    }

    let address = config.address();
    let tls_config = config.tls.clone();

    let socket_addr: SocketAddr = address
        .parse()
        .map_err(|e| anyhow!("Invalid server address '{}': {}", address, e))?;

    let app_state = AppState::new(config).await;
    let app = build_router(app_state);

    if let Some(tls) = tls_config {
        let rustls_config = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
            .await
            .map_err(|e| {
                anyhow!(
                    "Failed to load TLS certificates from {} and {}: {}",
                    tls.cert_path.display(),
                    tls.key_path.display(),
                    e
                )
            })?;

        info!("Server listening on https://{} (TLS enabled)", socket_addr);

        axum_server::bind_rustls(socket_addr, rustls_config)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .map_err(|e| anyhow!("TLS server error: {}", e))?;
    } else {
        info!("Server listening on http://{}", socket_addr);

        let listener = TcpListener::bind(&socket_addr).await?;
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;
    }

    Ok(())
}

async fn talk(
    config: VoiceSessionConfig,
    input: PathBuf,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let mode = config.mode;
    let mut microphone = WavFileMicrophone::from_wav(&input)?;
    if mode == SessionMode::Auto {
        microphone = microphone.with_trailing_silence(AUTO_TRAILING_SILENCE);
    }
    let speaking_time = microphone.duration();

    let wav_output = match &output {
        Some(path) => Some(Arc::new(WavFileOutput::create(path, REALTIME_SAMPLE_RATE)?)),
        None => None,
    };
    let sink: Arc<dyn AudioOutput> = match &wav_output {
        Some(wav) => wav.clone(),
        None => Arc::new(NullOutput),
    };
    let playback = PlaybackQueue::new(sink, REALTIME_SAMPLE_RATE);

    let mut handle = VoiceSession::connect(config, Arc::new(microphone), playback).await?;

    if mode == SessionMode::Manual {
        handle.press();
        tokio::time::sleep(speaking_time).await;
        handle.release();
    }

    let mut turn = TurnTracker::new(mode);
    loop {
        let event = tokio::select! {
            event = handle.next_event() => event,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        };
        let Some(event) = event else {
            break;
        };
        match &event {
            SessionEvent::StateChanged(state) => info!(%state, "Conversation state"),
            SessionEvent::Transcript(text) => info!(chars = text.len(), "Transcript updated"),
            SessionEvent::Error(message) => warn!(%message, "Session error"),
        }
        if turn.observe(&event) {
            break;
        }
    }

    let report = handle.finish().await?;
    if let Some(wav) = &wav_output {
        wav.finalize()?;
    }

    println!("{}", report.transcript.trim_end());
    info!(
        frames_sent = report.frames_sent,
        audio_chunks = report.audio_chunks_received,
        errors = report.errors.len(),
        "Session finished"
    );

    Ok(())
}

/// Decides when `talk` has seen its one turn through.
#[derive(Debug)]
struct TurnTracker {
    mode: SessionMode,
    responded: bool,
}

impl TurnTracker {
    fn new(mode: SessionMode) -> Self {
        Self {
            mode,
            responded: false,
        }
    }

    /// Record `event`; true once the turn is over.
    ///
    /// A turn ends when the controller leaves `AwaitingResponse`. Auto mode
    /// has no way out of `Idle`, so reaching it always ends the turn; manual
    /// mode gives up on the first error.
    fn observe(&mut self, event: &SessionEvent) -> bool {
        match event {
            SessionEvent::StateChanged(ConversationState::AwaitingResponse) => {
                self.responded = true;
                false
            }
            SessionEvent::StateChanged(ConversationState::Idle) => {
                self.responded || self.mode == SessionMode::Auto
            }
            SessionEvent::StateChanged(ConversationState::Capturing) => self.responded,
            SessionEvent::Error(_) => self.mode == SessionMode::Manual,
            _ => false,
        }
    }
}
