//! `pitaya`: manual access to a Red Pitaya, real or simulated.
//!
//! Every invocation goes through the same connection registry the
//! acquisition and control code uses, so it exercises the worker, broker and
//! teardown path end to end.
//!
//! ```bash
//! pitaya --mock pid-set pid0 0.2
//! pitaya --address rp-f0a1b2.local idn
//! pitaya --mock demo --setpoint 0.4 --steps 2000
//! pitaya --config lab.toml config
//! ```

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pitaya_core::{PitayaConfig, TransportMode, TriggerSource};
use pitaya_hub::{init_tracing, ConnectOptions, ConnectionHandle, ConnectionRegistry, ScopeSettings};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "pitaya")]
#[command(about = "Shared access to Red Pitaya FPGA modules", long_about = None)]
struct Cli {
    /// Configuration file (TOML); PITAYA_* variables still apply
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Device hostname or address
    #[arg(long, global = true, default_value = "sim-pitaya")]
    address: String,

    /// Name of the module configuration on the device
    #[arg(long, global = true, default_value = "default")]
    config_name: String,

    /// Use the simulated plant instead of hardware
    #[arg(long, global = true)]
    mock: bool,

    /// Run the backend in this process instead of a worker
    #[arg(long, global = true)]
    direct: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the worker answers
    Ping,

    /// Print the device identification
    Idn,

    /// Write a PID setpoint (volts)
    PidSet {
        /// PID channel, e.g. pid0
        channel: String,
        /// Setpoint in volts
        #[arg(allow_hyphen_values = true)]
        value: f64,
    },

    /// Read a PID setpoint (volts)
    PidGet {
        /// PID channel, e.g. pid0
        channel: String,
    },

    /// Read IQ demodulator quadratures
    Iq {
        /// IQ channel, e.g. iq0
        channel: String,
    },

    /// Sample one signal
    Sampler {
        /// Signal name, e.g. in1
        signal: String,
    },

    /// Acquire one scope trace and print a summary
    Scope {
        /// Decimation factor (power of two)
        #[arg(long, default_value_t = 1)]
        decimation: u32,
        /// Input signal
        #[arg(long, default_value = "in1")]
        input: String,
        /// Acquisition timeout in seconds
        #[arg(long, default_value_t = 1.0)]
        timeout: f64,
    },

    /// Close a PI loop around the simulated plant and report the step response
    Demo {
        /// Step target in volts
        #[arg(long, default_value_t = 0.4)]
        setpoint: f64,
        /// Proportional gain
        #[arg(long, default_value_t = 0.5)]
        kp: f64,
        /// Integral gain (1/s)
        #[arg(long, default_value_t = 40.0)]
        ki: f64,
        /// Time step in seconds
        #[arg(long, default_value_t = 1e-3)]
        dt: f64,
        /// Number of simulation steps
        #[arg(long, default_value_t = 1000)]
        steps: usize,
        /// Settling band as a fraction of the target
        #[arg(long, default_value_t = 0.02)]
        tolerance: f64,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => PitayaConfig::load_from(path),
        None => PitayaConfig::load(),
    }
    .context("failed to load configuration")?;
    init_tracing(&config.logging)?;

    if let Commands::Config = cli.command {
        let text = toml::to_string_pretty(&config).context("failed to render configuration")?;
        print!("{text}");
        return Ok(());
    }

    let mut options = if cli.mock {
        ConnectOptions::mock()
    } else {
        ConnectOptions::default()
    };
    if cli.direct {
        options = options.with_transport(TransportMode::Direct);
    }

    let registry = ConnectionRegistry::new(config)?;
    let conn = registry
        .connect_with(&cli.address, &cli.config_name, options)
        .await
        .with_context(|| format!("failed to connect to {}", cli.address))?;

    let key = conn.key().to_string();
    let result = run(&conn, cli.command).await;

    if let Some(report) = conn.disconnect().await {
        report.log(&key);
    }
    for (key, report) in registry.shutdown_all().await {
        report.log(&key.to_string());
    }
    result
}

async fn run(conn: &ConnectionHandle, command: Commands) -> Result<()> {
    match command {
        Commands::Ping => {
            conn.ping().await?;
            println!("pong");
        }
        Commands::Idn => {
            let identity = conn.identify().await?;
            println!("{} ({})", identity.identity, identity.backend);
        }
        Commands::PidSet { channel, value } => {
            let applied = conn.set_pid_setpoint(&channel, value).await?;
            println!("{channel} setpoint = {applied}");
        }
        Commands::PidGet { channel } => {
            let value = conn.get_pid_setpoint(&channel).await?;
            println!("{channel} setpoint = {value}");
        }
        Commands::Iq { channel } => {
            let quad = conn.get_iq_quadratures(&channel).await?;
            println!("{channel}: i = {}, q = {}", quad.i, quad.q);
        }
        Commands::Sampler { signal } => {
            let value = conn.read_sampler(&signal).await?;
            println!("{signal} = {value}");
        }
        Commands::Scope {
            decimation,
            input,
            timeout,
        } => {
            let settings = ScopeSettings {
                decimation,
                trigger_source: TriggerSource::Immediately,
                input: input.parse()?,
                timeout: Duration::try_from_secs_f64(timeout)
                    .context("timeout must be a non-negative number of seconds")?,
            };
            let trace = conn.acquire_scope(&settings).await?;
            let (min, max) = trace
                .voltage
                .iter()
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                    (lo.min(v), hi.max(v))
                });
            let span = trace.time.last().copied().unwrap_or_default();
            println!(
                "{} samples over {span:.6} s, min {min:.4} V, max {max:.4} V",
                trace.len()
            );
        }
        Commands::Demo {
            setpoint,
            kp,
            ki,
            dt,
            steps,
            tolerance,
        } => demo(conn, setpoint, kp, ki, dt, steps, tolerance).await?,
        Commands::Config => unreachable!("handled before connecting"),
    }
    Ok(())
}

async fn demo(
    conn: &ConnectionHandle,
    setpoint: f64,
    kp: f64,
    ki: f64,
    dt: f64,
    steps: usize,
    tolerance: f64,
) -> Result<()> {
    // Hold the session so other clients cannot interleave with the loop
    let _session = conn.lock().await;

    let mut measured = 0.0;
    let mut integral = 0.0;
    for _ in 0..steps {
        let error = setpoint - measured;
        integral += error * dt;
        let output = kp * error + ki * integral;
        measured = conn.sim_step(output, dt).await?;
    }
    let metrics = conn.sim_metrics(setpoint, tolerance).await?;

    println!("final value   {measured:.4} V");
    println!("overshoot     {:.1} %", metrics.overshoot * 100.0);
    match metrics.settling_time {
        Some(t) => println!("settling time {t:.4} s"),
        None => println!("settling time not reached"),
    }
    println!("samples       {}", metrics.samples);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_negative_setpoint_parses() {
        let cli = Cli::try_parse_from(["pitaya", "--mock", "pid-set", "pid1", "-0.3"]).unwrap();
        assert!(cli.mock);
        match cli.command {
            Commands::PidSet { channel, value } => {
                assert_eq!(channel, "pid1");
                assert_eq!(value, -0.3);
            }
            _ => panic!("expected pid-set"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["pitaya", "idn", "--address", "10.0.0.7", "--direct"])
            .unwrap();
        assert_eq!(cli.address, "10.0.0.7");
        assert!(cli.direct);
        assert!(!cli.mock);
    }
}
