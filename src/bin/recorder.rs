//! Trajectory recorder and player.
//!
//! Records timestamped raw joint positions to a JSON file while the operator
//! moves the arm by hand, and replays such files with the original timing.
//!
//! Usage: arm-recorder <record|play> <file> [OPTIONS]
//!
//! Options:
//!   --port <path>        Serial port (default: /dev/ttyUSB0)
//!   --baud <rate>        Baud rate (default: 1000000)
//!   --period-ms <ms>     Sample period when recording (default: 100)
//!   --duration <secs>    Stop recording after N seconds (default: Ctrl+C)
//!   --name <name>        Trajectory name (default: file stem)
//!
//! Examples:
//!   arm-recorder record wave.json --period-ms 50
//!   arm-recorder record wave.json --duration 10
//!   arm-recorder play wave.json

use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};

use soarm::{shared, Arm, ArmConfig, Player, Recorder, SerialBus, Trajectory, DEFAULT_BAUD_RATE};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Command {
    Record,
    Play,
}

struct Args {
    command: Command,
    file: String,
    port: String,
    baud_rate: u32,
    period: Duration,
    duration: Option<Duration>,
    name: Option<String>,
}

fn parse_args() -> Option<Args> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 3 {
        return None;
    }

    let command = match args[1].as_str() {
        "record" => Command::Record,
        "play" => Command::Play,
        _ => return None,
    };
    let file = args[2].clone();

    let mut port = "/dev/ttyUSB0".to_string();
    let mut baud_rate = DEFAULT_BAUD_RATE;
    let mut period = Duration::from_millis(100);
    let mut duration = None;
    let mut name = None;
    let mut i = 3;

    while i < args.len() {
        let arg = &args[i];

        if i + 1 >= args.len() {
            eprintln!("Error: {} requires an argument", arg);
            return None;
        }
        let value = &args[i + 1];

        match arg.as_str() {
            "--port" => port = value.clone(),
            "--baud" => match value.parse() {
                Ok(b) => baud_rate = b,
                Err(_) => {
                    eprintln!("Error: invalid baud rate '{}'", value);
                    return None;
                }
            },
            "--period-ms" => match value.parse::<u64>() {
                Ok(ms) if ms > 0 => period = Duration::from_millis(ms),
                _ => {
                    eprintln!("Error: invalid period '{}'", value);
                    return None;
                }
            },
            "--duration" => match value.parse::<f64>() {
                Ok(s) if s > 0.0 => duration = Some(Duration::from_secs_f64(s)),
                _ => {
                    eprintln!("Error: invalid duration '{}'", value);
                    return None;
                }
            },
            "--name" => name = Some(value.clone()),
            _ => {
                eprintln!("Error: unknown argument '{}'", arg);
                return None;
            }
        }
        i += 2;
    }

    Some(Args {
        command,
        file,
        port,
        baud_rate,
        period,
        duration,
        name,
    })
}

fn print_usage() {
    println!("Usage: arm-recorder <record|play> <file> [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --port <path>        Serial port (default: /dev/ttyUSB0)");
    println!("  --baud <rate>        Baud rate (default: 1000000)");
    println!("  --period-ms <ms>     Sample period when recording (default: 100)");
    println!("  --duration <secs>    Stop recording after N seconds (default: Ctrl+C)");
    println!("  --name <name>        Trajectory name (default: file stem)");
    println!();
    println!("Examples:");
    println!("  arm-recorder record wave.json --period-ms 50");
    println!("  arm-recorder record wave.json --duration 10");
    println!("  arm-recorder play wave.json");
}

fn open_arm(args: &Args) -> Result<Arm> {
    let bus = SerialBus::open(&args.port, args.baud_rate, Duration::from_millis(100))
        .with_context(|| format!("cannot open {}", args.port))?;
    Ok(Arm::new(ArmConfig::so_arm(), shared(bus)))
}

fn trajectory_name(args: &Args) -> String {
    args.name.clone().unwrap_or_else(|| {
        std::path::Path::new(&args.file)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "trajectory".to_string())
    })
}

fn run_record(args: &Args, running: Arc<AtomicBool>) -> Result<()> {
    let arm = open_arm(args)?;
    let recorder = Recorder::new(arm.clone(), soarm::SessionLock::new());

    // Torque off so the operator can demonstrate the motion by hand.
    arm.release()?;
    recorder.start(args.period)?;

    match args.duration {
        Some(d) => println!("Recording for {:.1}s...", d.as_secs_f64()),
        None => println!("Recording. Press Ctrl+C to stop."),
    }

    let started = Instant::now();
    let mut last_report = 0;
    while running.load(Ordering::SeqCst) {
        if let Some(limit) = args.duration {
            if started.elapsed() >= limit {
                break;
            }
        }
        std::thread::sleep(Duration::from_millis(100));

        let elapsed = started.elapsed().as_secs();
        if elapsed > last_report {
            last_report = elapsed;
            println!("  {}s: {} frame(s)", elapsed, recorder.frame_count());
        }
    }

    recorder.stop();
    let trajectory = recorder.snapshot(&trajectory_name(args));
    if trajectory.is_empty() {
        bail!("no frames captured");
    }

    trajectory.save(&args.file)?;
    println!(
        "Saved {} frame(s) ({:.1}s) to {}",
        trajectory.len(),
        trajectory.duration_s(),
        args.file
    );
    arm.shutdown()?;
    Ok(())
}

fn run_play(args: &Args, running: Arc<AtomicBool>) -> Result<()> {
    let trajectory = Trajectory::load(&args.file)?;
    if trajectory.is_empty() {
        bail!("{}: trajectory has no frames", args.file);
    }
    println!(
        "Playing '{}': {} frame(s), {:.1}s",
        trajectory.name,
        trajectory.len(),
        trajectory.duration_s()
    );

    let arm = open_arm(args)?;
    // Motors must hold position before goal writes start driving them.
    arm.hold_and_lock()?;

    let player = Player::new(arm.clone(), soarm::SessionLock::new());
    let total = trajectory.len();
    player.play_with_progress(trajectory, move |done, _| {
        println!("  frame {}/{}", done, total);
    })?;

    while player.is_playing() && running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(50));
    }
    player.stop();

    if let Some(e) = player.last_error() {
        bail!("playback aborted: {}", e);
    }
    if running.load(Ordering::SeqCst) {
        println!("Done.");
    } else {
        println!("Stopped at frame {}.", player.current_frame());
    }
    arm.shutdown()?;
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("soarm=info".parse()?)
                .add_directive("warn".parse()?),
        )
        .init();

    let args = match parse_args() {
        Some(a) => a,
        None => {
            print_usage();
            return Ok(());
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    match args.command {
        Command::Record => run_record(&args, running),
        Command::Play => run_play(&args, running),
    }
}
