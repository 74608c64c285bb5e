use clap::{App, Arg};
use rovercore::hal::{before, Clock, SystemClock};
use rovercore::protocol::{CommandFrame, CommandResponse, ProtocolHandler};
use rovercore::{SimConfig, Simulation};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::time;
use tracing::{debug, error, info, warn};

const DEFAULT_PORT: &str = "8080";
const DEFAULT_TELEMETRY_MS: &str = "200";
const CONTROL_PERIOD_MS: u64 = 10;
const TELEMETRY_BROADCAST_BUFFER_SIZE: usize = 64;
const COMMAND_CHANNEL_SIZE: usize = 16;

type CommandRequest = (CommandFrame, oneshot::Sender<CommandResponse>);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("rover-sim")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Closed-loop rover simulator serving JSON commands and telemetry over TCP")
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("TCP port to listen on")
                .takes_value(true)
                .default_value(DEFAULT_PORT),
        )
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("telemetry-ms")
                .long("telemetry-ms")
                .value_name("MS")
                .help("Telemetry broadcast period")
                .takes_value(true)
                .default_value(DEFAULT_TELEMETRY_MS),
        )
        .arg(
            Arg::with_name("polled-encoders")
                .long("polled-encoders")
                .help("Sample encoder pins from the loop instead of feeding edges directly"),
        )
        .get_matches();

    let port: u16 = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?;
    let telemetry_ms: u64 = matches
        .value_of("telemetry-ms")
        .unwrap_or(DEFAULT_TELEMETRY_MS)
        .parse()?;
    let config = match matches.value_of("config") {
        Some(path) => SimConfig::from_json_file(path)?,
        None => SimConfig::default(),
    };

    let mut sim = if matches.is_present("polled-encoders") {
        Simulation::with_polled_encoders(config)
    } else {
        Simulation::new(config)
    };
    info!(polled = sim.is_polled(), wheelbase = config.rover.wheelbase, "simulation ready");

    let (telemetry_tx, _) = broadcast::channel(TELEMETRY_BROADCAST_BUFFER_SIZE);
    let (command_tx, mut command_rx) = mpsc::channel::<CommandRequest>(COMMAND_CHANNEL_SIZE);

    let listener = TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    info!("TCP server listening on port {}", port);
    let tcp_telemetry_tx = telemetry_tx.clone();
    let tcp_server = tokio::spawn(async move {
        if let Err(e) = serve(listener, command_tx, tcp_telemetry_tx).await {
            error!("TCP server error: {}", e);
        }
    });

    let clock = SystemClock::new();
    let mut protocol = ProtocolHandler::new();
    let mut control_tick = time::interval(Duration::from_millis(CONTROL_PERIOD_MS));
    let mut telemetry_tick = time::interval(Duration::from_millis(telemetry_ms.max(1)));

    loop {
        tokio::select! {
            _ = control_tick.tick() => {
                // Catch the simulation up with wall time
                let target_ms = clock.now_ms();
                while before(sim.now_ms(), target_ms) {
                    if sim.step() {
                        tokio::task::yield_now().await;
                    }
                }
            }
            _ = telemetry_tick.tick() => {
                let events = sim.agent().drain_events();
                if !events.is_empty() {
                    debug!(count = events.len(), "bus events");
                }
                let frame = sim.telemetry();
                match protocol.serialize_telemetry(&frame) {
                    Ok(json) => {
                        // No receivers is fine
                        let _ = telemetry_tx.send(json.to_string());
                    }
                    Err(e) => warn!("Failed to serialize telemetry: {}", e),
                }
            }
            Some((frame, reply)) = command_rx.recv() => {
                let response = match sim.submit(frame.command) {
                    Ok(()) => CommandResponse::ack(frame.id),
                    Err(e) => CommandResponse::nack(frame.id, e.to_string()),
                };
                if reply.send(response).is_err() {
                    debug!(id = frame.id, "client left before reply");
                }
                tokio::task::yield_now().await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    sim.agent_mut().stop();
    tcp_server.abort();
    Ok(())
}

async fn serve(
    listener: TcpListener,
    commands: mpsc::Sender<CommandRequest>,
    telemetry_tx: broadcast::Sender<String>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("Client connected: {}", addr);
                let client_commands = commands.clone();
                let client_telemetry_rx = telemetry_tx.subscribe();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, client_commands, client_telemetry_rx).await {
                        warn!("Client {} error: {}", addr, e);
                    }
                    info!("Client {} disconnected", addr);
                });
            }
            Err(e) => error!("Failed to accept connection: {}", e),
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    commands: mpsc::Sender<CommandRequest>,
    mut telemetry_rx: broadcast::Receiver<String>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let writer = Arc::new(Mutex::new(writer));

    let telemetry_writer = Arc::clone(&writer);
    let telemetry_task = tokio::spawn(async move {
        loop {
            match telemetry_rx.recv().await {
                Ok(line) => {
                    let mut guard = telemetry_writer.lock().await;
                    if guard.write_all(line.as_bytes()).await.is_err()
                        || guard.write_all(b"\n").await.is_err()
                    {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "telemetry client lagging");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut protocol = ProtocolHandler::new();
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }

        let response = match protocol.parse_command(&line) {
            Ok(frame) => {
                debug!(?frame, "command received");
                let (reply_tx, reply_rx) = oneshot::channel();
                commands.send((frame, reply_tx)).await?;
                reply_rx
                    .await
                    .unwrap_or_else(|_| CommandResponse::nack(frame.id, "simulator stopped"))
            }
            Err(e) => {
                warn!("Failed to parse command: {}", e);
                CommandResponse::nack(0, e.to_string())
            }
        };

        let json = protocol.serialize_response(&response)?.to_string();
        let mut guard = writer.lock().await;
        guard.write_all(json.as_bytes()).await?;
        guard.write_all(b"\n").await?;
    }

    telemetry_task.abort();
    Ok(())
}
