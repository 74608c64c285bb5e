use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use rovercore::protocol::{CommandResponse, ProtocolHandler, ServerMessage};
use rovercore::telemetry::TelemetryFrame;
use rovercore::{GotoCommand, PidCommand, RoverCommand, TankCommand, WheelMask};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8080";
const RESPONSE_TIMEOUT_SECS: u64 = 5;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

fn number_validator(value: String) -> Result<(), String> {
    value
        .parse::<f32>()
        .map(|_| ())
        .map_err(|_| format!("'{}' is not a number", value))
}

fn number_arg(name: &'static str, help: &'static str) -> Arg<'static, 'static> {
    Arg::with_name(name)
        .help(help)
        .required(true)
        .allow_hyphen_values(true)
        .validator(number_validator)
}

#[tokio::main]
async fn main() -> CliResult<()> {
    let matches = App::new("rover")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Command-line client for the rover simulator")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("host")
                .short("H")
                .long("host")
                .value_name("HOST")
                .help("Simulator host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Simulator port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table"])
                .default_value("table")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("tank")
                .about("Drive both wheels; negative values reverse")
                .arg(number_arg("left", "Left wheel duty, or speed with --speed"))
                .arg(number_arg("right", "Right wheel duty, or speed with --speed"))
                .arg(
                    Arg::with_name("speed")
                        .short("s")
                        .long("speed")
                        .help("Treat values as speeds under closed-loop control"),
                ),
        )
        .subcommand(SubCommand::with_name("halt").about("Stop both wheels and cancel any goal"))
        .subcommand(
            SubCommand::with_name("pid")
                .about("Tune wheel speed control")
                .arg(
                    Arg::with_name("wheels")
                        .help("Wheels to tune")
                        .required(true)
                        .possible_values(&["left", "right", "both"]),
                )
                .arg(number_arg("min-speed", "Minimum controllable speed"))
                .arg(number_arg("max-speed", "Maximum speed"))
                .arg(number_arg("kp", "Proportional gain"))
                .arg(number_arg("ki", "Integral gain"))
                .arg(number_arg("kd", "Derivative gain")),
        )
        .subcommand(
            SubCommand::with_name("stall")
                .about("Set per-wheel stall duty as a fraction of max duty")
                .arg(number_arg("left", "Left stall fraction (0-1)"))
                .arg(number_arg("right", "Right stall fraction (0-1)")),
        )
        .subcommand(SubCommand::with_name("reset-pose").about("Re-zero the odometry"))
        .subcommand(
            SubCommand::with_name("goto")
                .about("Drive to a point in the odometry frame")
                .arg(number_arg("x", "Goal x"))
                .arg(number_arg("y", "Goal y"))
                .arg(
                    Arg::with_name("tolerance")
                        .long("tolerance")
                        .takes_value(true)
                        .default_value("0.05")
                        .validator(number_validator),
                )
                .arg(
                    Arg::with_name("point-forward")
                        .long("point-forward")
                        .takes_value(true)
                        .default_value("0.5")
                        .validator(number_validator),
                ),
        )
        .subcommand(SubCommand::with_name("watch").about("Stream telemetry until interrupted"))
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST).to_string();
    let port: u16 = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?;
    let format = matches.value_of("format").unwrap_or("table").to_string();

    let command = match matches.subcommand() {
        ("tank", Some(sub)) => tank_command(sub),
        ("halt", _) => RoverCommand::Halt,
        ("pid", Some(sub)) => pid_command(sub),
        ("stall", Some(sub)) => RoverCommand::Stall {
            left: number(sub, "left"),
            right: number(sub, "right"),
        },
        ("reset-pose", _) => RoverCommand::ResetPose,
        ("goto", Some(sub)) => RoverCommand::Goto(GotoCommand {
            x: number(sub, "x"),
            y: number(sub, "y"),
            tolerance: number(sub, "tolerance"),
            point_forward: number(sub, "point-forward"),
        }),
        ("watch", _) => return watch(&host, port, &format).await,
        _ => unreachable!("subcommand required"),
    };

    let response = send_command(&host, port, command).await?;
    print_response(&command, &response, &format);
    Ok(())
}

fn number(matches: &ArgMatches<'_>, name: &str) -> f32 {
    // Validated by clap
    matches
        .value_of(name)
        .and_then(|value| value.parse().ok())
        .unwrap_or(0.0)
}

fn tank_command(matches: &ArgMatches<'_>) -> RoverCommand {
    let left = number(matches, "left");
    let right = number(matches, "right");
    if matches.is_present("speed") {
        RoverCommand::Tank(TankCommand::speed(left, right))
    } else {
        let duty = |value: f32| value.abs().min(f32::from(u16::MAX)) as u16;
        RoverCommand::Tank(TankCommand::power(left >= 0.0, duty(left), right >= 0.0, duty(right)))
    }
}

fn pid_command(matches: &ArgMatches<'_>) -> RoverCommand {
    let wheels = match matches.value_of("wheels") {
        Some("left") => WheelMask::Left,
        Some("right") => WheelMask::Right,
        _ => WheelMask::Both,
    };
    RoverCommand::Pid(PidCommand {
        wheels,
        min_speed: number(matches, "min-speed"),
        max_speed: number(matches, "max-speed"),
        kp: number(matches, "kp"),
        ki: number(matches, "ki"),
        kd: number(matches, "kd"),
    })
}

async fn connect(host: &str, port: u16) -> CliResult<TcpStream> {
    let addr = format!("{}:{}", host, port);
    match TcpStream::connect(&addr).await {
        Ok(stream) => Ok(stream),
        Err(e) => {
            eprintln!("{} Failed to connect to rover simulator at {}", "error:".red(), addr.bright_white());
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                eprintln!("{} Start it with {}", "hint:".yellow(), "cargo run --bin rover-sim".bright_cyan());
            }
            Err(e.into())
        }
    }
}

async fn send_command(host: &str, port: u16, command: RoverCommand) -> CliResult<CommandResponse> {
    let stream = connect(host, port).await?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut protocol = ProtocolHandler::new();
    let frame = protocol.frame(command);

    let exchange = async {
        writer
            .write_all(serde_json::to_string(&frame)?.as_bytes())
            .await?;
        writer.write_all(b"\n").await?;

        // Telemetry may arrive first; skip until our reply
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                return Err::<CommandResponse, Box<dyn std::error::Error>>("server closed connection".into());
            }
            if let Ok(ServerMessage::Response(response)) = protocol.parse_server_message(&line) {
                if response.id == frame.id || response.id == 0 {
                    return Ok(response);
                }
            }
        }
    };

    match tokio::time::timeout(Duration::from_secs(RESPONSE_TIMEOUT_SECS), exchange).await {
        Ok(result) => result,
        Err(_) => {
            eprintln!("{} Command timed out after {} seconds", "error:".red(), RESPONSE_TIMEOUT_SECS);
            Err("command timeout".into())
        }
    }
}

fn print_response(command: &RoverCommand, response: &CommandResponse, format: &str) {
    if format == "json" {
        match serde_json::to_string_pretty(response) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("{} {}", "error:".red(), e),
        }
        return;
    }

    if response.is_ack() {
        println!("{} {:?}", "ok".green().bold(), command);
    } else {
        println!(
            "{} {:?}: {}",
            "rejected".red().bold(),
            command,
            response.message.as_deref().unwrap_or("no reason given")
        );
    }
}

async fn watch(host: &str, port: u16, format: &str) -> CliResult<()> {
    let stream = connect(host, port).await?;
    let mut reader = BufReader::new(stream);
    let protocol = ProtocolHandler::new();

    if format == "table" {
        println!("{}", header_line().bold());
    }

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            println!("{}", "simulator closed the connection".yellow());
            return Ok(());
        }
        if format == "json" {
            print!("{}", line);
            continue;
        }
        if let Ok(ServerMessage::Telemetry(frame)) = protocol.parse_server_message(&line) {
            print_frame(&frame);
        }
    }
}

fn header_line() -> String {
    format!(
        "{:>8} {:>8} {:>8} {:>7} {:>6} {:>6} {:>7} {:>7} {:>11}",
        "t(ms)", "x", "y", "angle", "dutyL", "dutyR", "speedL", "speedR", "goal"
    )
}

fn print_frame(frame: &TelemetryFrame) {
    let goal = format!("{:?}", frame.goal_state);
    let goal = match frame.goal_state {
        rovercore::GoalState::Achieved => goal.green(),
        rovercore::GoalState::Running | rovercore::GoalState::Starting => goal.cyan(),
        rovercore::GoalState::NotRunning => goal.normal(),
    };
    println!(
        "{:>8} {:>8.3} {:>8.3} {:>7.3} {:>6} {:>6} {:>7.3} {:>7.3} {:>11}",
        frame.timestamp_ms,
        frame.pose.x,
        frame.pose.y,
        frame.pose.angle,
        frame.left.duty,
        frame.right.duty,
        frame.left.speed,
        frame.right.speed,
        goal
    );
}
