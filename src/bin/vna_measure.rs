
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use log::{error, info, warn};
use serde_json::json;

use vna_sweep::config::MeasurementConfig;
use vna_sweep::devices::simulated::{Resonance, SimulatedVna};
use vna_sweep::devices::vna::{Identity, Vna, VnaModel};
use vna_sweep::measurement::{record_frequency_sweep, record_power_sweep, take_snapshot};
use vna_sweep::registry::SessionRegistry;
use vna_sweep::sink::TextFileSink;
use vna_sweep::vxi11::DEFAULT_IO_TIMEOUT_MS;
use vna_sweep::{Interrupt, Result, SweepController, VnaSession};

type BoxedSession = Box<dyn VnaSession + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Routine {
    /// One sweep over the configured frequency band
    Frequency,
    /// One sweep per power step around the band center
    Power,
    /// Store the trace currently on screen without sweeping
    Snapshot,
}

#[derive(Parser, Debug)]
#[command(name = "vna_measure", version, about = "Take VNA sweeps and store them as text tables")]
struct Args {
    /// Measurement configuration (TOML)
    #[arg(short, long)]
    config: PathBuf,

    /// Use an in-process simulated VNA instead of the instrument at the configured address
    #[arg(long)]
    simulate: bool,

    #[arg(value_enum)]
    routine: Routine,
}

fn open_session(address: &str, config: &MeasurementConfig, simulate: bool, identity: &mut Option<Identity>) -> Result<BoxedSession> {
    let model: VnaModel = config.model()?;
    if simulate {
        // A resonance in the middle of the band, a tenth of the band wide
        let center: f64 = (config.frequency.start + config.frequency.stop) / 2.0;
        let width: f64 = (config.frequency.stop - config.frequency.start) / 10.0;
        let vna = SimulatedVna::new()
            .with_model(model)
            .completing_on_read(Some(3))
            .with_resonance(Resonance { center_hz: center, quality: center / width, depth: 0.8 });
        *identity = Some(vna.identity());
        return Ok(Box::new(vna));
    }

    let vna = Vna::open(address, model, Duration::from_millis(DEFAULT_IO_TIMEOUT_MS as u64))?;
    *identity = Some(vna.identity().clone());
    Ok(Box::new(vna))
}

fn run(args: &Args, interrupt: &Interrupt) -> Result<Option<PathBuf>> {
    let config: MeasurementConfig = MeasurementConfig::load(&args.config)?;
    let controller = SweepController::new(config.sweep_options()?).with_interrupt(interrupt);

    let mut registry: SessionRegistry<BoxedSession> = SessionRegistry::new();
    let mut identity: Option<Identity> = None;
    let address: &str = &config.instrument.address;
    let shared = registry.acquire(address, |a| open_session(a, &config, args.simulate, &mut identity))?;
    if let Some(id) = &identity {
        info!("{} is {} {} (serial {}, firmware {})", config.instrument.name, id.manufacturer, id.model, id.serial_num, id.fw_version);
    }

    // A Ctrl-C pressed before this routine must not abort its first sweep
    if interrupt.take() {
        info!("Discarding an interrupt raised before the {:?} routine", args.routine);
    }

    let mut sink = TextFileSink::new(
        &config.experiment.data_root,
        &config.experiment.cooldown_date,
        &config.experiment.sample,
        &config.experiment.name,
    );

    let result = {
        let mut guard = shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let session: &mut dyn VnaSession = &mut **guard;
        match args.routine {
            Routine::Frequency => record_frequency_sweep(session, &mut sink, &controller, &config.frequency_plan(), config.sweep.finish_continuous),
            Routine::Power => record_power_sweep(session, &mut sink, &controller, &config.power_sweep_plan(), config.sweep.finish_continuous),
            Routine::Snapshot => take_snapshot(session, &mut sink),
        }
    };

    drop(shared);
    registry.release(address)?;

    let path: Option<PathBuf> = result?;
    let summary = json!({
        "instrument": &config.instrument.name,
        "identity": &identity,
        "routine": format!("{:?}", args.routine).to_lowercase(),
        "file": &path,
    });
    println!("{}", summary);
    Ok(path)
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let interrupt = Interrupt::new();
    let handler_flag = interrupt.clone();
    let handler = move || {
        // Only a pending sweep wait consumes the flag; a second press while it is still set exits
        if handler_flag.raise_again() {
            eprintln!("Interrupted again, exiting");
            std::process::exit(130);
        }
        warn!("Interrupt received, sweeping stops at the next mode poll. Press Ctrl-C again to exit");
    };
    if let Err(e) = ctrlc::set_handler(handler) {
        warn!("Unable to install the Ctrl-C handler, sweeps cannot be interrupted: {}", e);
    }

    match run(&args, &interrupt) {
        Ok(Some(path)) => {
            info!("Data written to {}", path.display());
            ExitCode::SUCCESS
        }
        Ok(None) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
