//! Standalone range calibration tool for the rig's Dynamixel servos.
//!
//! ```sh
//! cargo run --bin dxl-calibrate -- /dev/ttyUSB0 1 2 3 4 5 6
//! cargo run --bin dxl-calibrate -- /dev/ttyUSB0 3 4 --output pan_tilt.json
//! ```
//!
//! Torque is released on every listed motor so it can be moved by hand.
//! Move each one through its safe range; the tool continuously sync-reads
//! positions and tracks min and max. Press Enter when done. Torque is left
//! off; the daemon re-enables it on request.

use anyhow::{Context, bail};
use clap::Parser;
use sc_dynamixel::calibration::{CalibrationData, MotorRange};
use sc_dynamixel::{BusGateway, DEFAULT_BAUD, Register, open_serial};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "dxl-calibrate", about = "Record travel limits of Dynamixel servos")]
struct Args {
    /// Serial device of the bus adapter.
    device: String,
    /// Motor ids to calibrate.
    #[arg(required = true)]
    ids: Vec<u8>,
    #[arg(short, long, default_value = "calibration.json")]
    output: PathBuf,
    #[arg(long, default_value_t = DEFAULT_BAUD)]
    baud: u32,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let n = args.ids.len();

    let mut bus = open_serial(&args.device, args.baud, Duration::from_millis(100))
        .with_context(|| format!("opening {}", args.device))?;

    for &id in &args.ids {
        bus.write(id, Register::TorqueEnable, 0)
            .with_context(|| format!("releasing torque on motor {id}"))?;
    }

    let mut mins = vec![u16::MAX; n];
    let mut maxs = vec![u16::MIN; n];

    println!("Calibrating {n} motors on {}", args.device);
    println!("Move every motor through its safe range of motion.");
    println!("Press Enter when done.\n");

    // Background thread waits for Enter so the main loop stays non-blocking.
    let done = Arc::new(AtomicBool::new(false));
    let done2 = done.clone();
    std::thread::spawn(move || {
        let mut buf = [0u8; 1];
        let _ = io::stdin().read(&mut buf);
        done2.store(true, Ordering::Relaxed);
    });

    let mut cycles = 0u64;
    while !done.load(Ordering::Relaxed) {
        if let Ok(readings) = bus.bulk_read(&args.ids) {
            for (i, id) in args.ids.iter().enumerate() {
                if let Some(t) = readings.get(id) {
                    let pos = t.position.rem_euclid(4096) as u16;
                    mins[i] = mins[i].min(pos);
                    maxs[i] = maxs[i].max(pos);
                }
            }
        }
        cycles += 1;

        if cycles % 30 == 0 {
            print!("\r");
            for (i, &id) in args.ids.iter().enumerate() {
                print!("  m{id}:[{:>4}-{:>4}]", mins[i], maxs[i]);
            }
            io::stdout().flush().ok();
        }
    }

    println!("\n");

    if let Some(i) = mins.iter().position(|&m| m == u16::MAX) {
        bail!("motor {} never answered; nothing saved", args.ids[i]);
    }

    let data = CalibrationData {
        motors: args
            .ids
            .iter()
            .enumerate()
            .map(|(i, &id)| MotorRange {
                id,
                min: mins[i],
                max: maxs[i],
            })
            .collect(),
    };
    data.save(&args.output)
        .with_context(|| format!("writing {}", args.output.display()))?;

    println!("Saved to {}:", args.output.display());
    for m in &data.motors {
        println!(
            "  motor {:>2}: min={:>4}  max={:>4}  center={:>6.1}  span={:>4}",
            m.id,
            m.min,
            m.max,
            m.center(),
            m.span()
        );
    }
    Ok(())
}
