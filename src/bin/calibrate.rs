//! Arm calibration tool.
//!
//! Usage: arm-calibrate <command> [OPTIONS]
//!
//! Commands:
//!   auto      Drive each joint to its end stops and record the extremes
//!   manual    Guided capture: move the arm by hand, confirm each point
//!   show      Print the stored calibration table
//!   reset     Remove stored calibration
//!
//! Options:
//!   --port <path>     Serial port (default: /dev/ttyUSB0)
//!   --baud <rate>     Baud rate (default: 1000000)
//!   --file <path>     Calibration file (default: calibration.json)
//!   --joint <name>    Restrict to one joint (repeatable)
//!
//! Examples:
//!   arm-calibrate auto --port /dev/ttyUSB0
//!   arm-calibrate manual --joint gripper
//!   arm-calibrate show

use std::env;
use std::io::{BufRead, Write};
use std::time::Duration;

use anyhow::{bail, Context, Result};

use soarm::config::DEFAULT_CALIBRATION_FILE;
use soarm::{
    shared, Arm, ArmConfig, AutoCalTiming, AutoCalibrator, CalibrationStore, Joint, ManualSession,
    SerialBus, Slot, DEFAULT_BAUD_RATE,
};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Command {
    Auto,
    Manual,
    Show,
    Reset,
}

struct Args {
    command: Command,
    port: String,
    baud_rate: u32,
    file: String,
    joints: Vec<String>,
}

fn parse_args() -> Option<Args> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        return None;
    }

    let command = match args[1].as_str() {
        "auto" => Command::Auto,
        "manual" => Command::Manual,
        "show" => Command::Show,
        "reset" => Command::Reset,
        _ => return None,
    };

    let mut port = "/dev/ttyUSB0".to_string();
    let mut baud_rate = DEFAULT_BAUD_RATE;
    let mut file = DEFAULT_CALIBRATION_FILE.to_string();
    let mut joints = Vec::new();
    let mut i = 2;

    while i < args.len() {
        let arg = &args[i];

        if arg == "--port" || arg == "--baud" || arg == "--file" || arg == "--joint" {
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
                "--file" => file = value.clone(),
                _ => joints.push(value.clone()),
            }
            i += 2;
            continue;
        }

        eprintln!("Error: unknown argument '{}'", arg);
        return None;
    }

    Some(Args {
        command,
        port,
        baud_rate,
        file,
        joints,
    })
}

fn print_usage() {
    println!("Usage: arm-calibrate <command> [OPTIONS]");
    println!();
    println!("Commands:");
    println!("  auto      Drive each joint to its end stops and record the extremes");
    println!("  manual    Guided capture: move the arm by hand, confirm each point");
    println!("  show      Print the stored calibration table");
    println!("  reset     Remove stored calibration");
    println!();
    println!("Options:");
    println!("  --port <path>     Serial port (default: /dev/ttyUSB0)");
    println!("  --baud <rate>     Baud rate (default: 1000000)");
    println!("  --file <path>     Calibration file (default: calibration.json)");
    println!("  --joint <name>    Restrict to one joint (repeatable)");
    println!();
    println!("Examples:");
    println!("  arm-calibrate auto --port /dev/ttyUSB0");
    println!("  arm-calibrate manual --joint gripper");
    println!("  arm-calibrate show");
}

/// Resolve `--joint` selections against the config, defaulting to all.
fn select_joints(config: &ArmConfig, names: &[String]) -> Result<Vec<Joint>> {
    if names.is_empty() {
        return Ok(config.joints().to_vec());
    }
    names
        .iter()
        .map(|name| {
            config
                .joint_by_name(name)
                .cloned()
                .with_context(|| format!("unknown joint '{}'", name))
        })
        .collect()
}

fn open_arm(config: &ArmConfig, args: &Args) -> Result<Arm> {
    let bus = SerialBus::open(&args.port, args.baud_rate, Duration::from_millis(100))
        .with_context(|| format!("cannot open {}", args.port))?;
    Ok(Arm::new(config.clone(), shared(bus)))
}

fn show(store: &CalibrationStore, config: &ArmConfig) {
    if store.is_empty() {
        println!("No calibration stored in {}", store.file_path().display());
        return;
    }

    println!(
        "{:<14} {:>3} {:>6} {:>6} {:>6} {:>6}  {}",
        "joint", "id", "left", "right", "center", "range", "path"
    );
    for joint in config.joints() {
        match store.get(&joint.name) {
            Some(rec) => {
                let path = rec.path();
                println!(
                    "{:<14} {:>3} {:>6} {:>6} {:>6} {:>6}  {}",
                    joint.name,
                    rec.id,
                    rec.left,
                    rec.right,
                    rec.center,
                    path.total_range,
                    if path.wraps { "wraps zero" } else { "direct" }
                );
            }
            None => println!("{:<14} {:>3}  (not calibrated)", joint.name, joint.id),
        }
    }
}

fn run_auto(config: &ArmConfig, store: &mut CalibrationStore, args: &Args) -> Result<()> {
    let joints = select_joints(config, &args.joints)?;
    let arm = open_arm(config, args)?;

    println!("Auto-calibrating {} joint(s). Keep clear of the arm.", joints.len());
    let calibrator = AutoCalibrator::new(arm.clone(), AutoCalTiming::default());
    let outcomes = calibrator.run(&joints, store);

    let mut failures = 0;
    for outcome in &outcomes {
        match &outcome.result {
            Ok(rec) => println!(
                "  {:<14} left={} right={} center={}",
                outcome.joint, rec.left, rec.right, rec.center
            ),
            Err(e) => {
                failures += 1;
                println!("  {:<14} FAILED: {}", outcome.joint, e);
            }
        }
    }

    arm.shutdown()?;
    if failures > 0 {
        bail!("{} of {} joint(s) failed to calibrate", failures, outcomes.len());
    }
    println!("Calibration saved to {}", store.file_path().display());
    Ok(())
}

/// Prompt, wait for Enter, then sample the joint's present position.
fn capture_point(arm: &Arm, joint: &Joint, prompt: &str) -> Result<u16> {
    print!("  Move '{}' to the {} and press Enter... ", joint.name, prompt);
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;

    let positions = arm.read_positions();
    let raw = positions.get(&joint.id).copied().unwrap_or(0);
    println!("    captured {}", raw);
    Ok(raw)
}

fn run_manual(config: &ArmConfig, store: &mut CalibrationStore, args: &Args) -> Result<()> {
    let joints = select_joints(config, &args.joints)?;
    let arm = open_arm(config, args)?;

    // Torque off so the operator can move the arm freely.
    arm.release()?;
    println!("Motors released. Calibrating {} joint(s).", joints.len());

    let mut session = ManualSession::new();
    for joint in &joints {
        println!("{}:", joint.name);
        let left = capture_point(&arm, joint, "LEFT limit")?;
        session.capture(joint, Slot::Left, left, store);
        let right = capture_point(&arm, joint, "RIGHT limit")?;
        session.capture(joint, Slot::Right, right, store);
        let center = capture_point(&arm, joint, "CENTER")?;
        session.capture(joint, Slot::Center, center, store);
    }

    arm.shutdown()?;
    println!("Calibration saved to {}", store.file_path().display());
    show(store, config);
    Ok(())
}

fn run_reset(config: &ArmConfig, store: &mut CalibrationStore, args: &Args) -> Result<()> {
    let joints = select_joints(config, &args.joints)?;
    let mut session = ManualSession::new();
    for joint in &joints {
        session.reset(joint, store);
        println!("Cleared calibration for '{}'", joint.name);
    }
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

    let config = ArmConfig::so_arm();
    let mut store = CalibrationStore::new(&args.file);
    store.load(&config);

    match args.command {
        Command::Auto => run_auto(&config, &mut store, &args),
        Command::Manual => run_manual(&config, &mut store, &args),
        Command::Show => {
            show(&store, &config);
            Ok(())
        }
        Command::Reset => run_reset(&config, &mut store, &args),
    }
}
