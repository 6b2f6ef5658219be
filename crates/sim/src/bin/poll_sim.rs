//! poll loop over the DTD radio link
//!
//! usage: poll_sim [config.json] [--scenarios]

use std::ops::ControlFlow;
use std::time::Duration;

use anyhow::{Context, Result};
use colored::Colorize;
use dtd_radio::{LinkConfig, RadioLink};
use dtd_sim::{display, load_config, scenarios, SimulationPresets};
use tokio::time::Instant;

const STATS_INTERVAL: Duration = Duration::from_secs(30);

async fn run_scenarios() -> Result<()> {
    println!("{}", "DTD Radio Link Scenarios".bright_blue().bold());
    println!("{}", "========================".bright_blue());

    let presets = [
        ("Good Conditions", SimulationPresets::good_conditions()),
        ("Average Conditions", SimulationPresets::average_conditions()),
        ("Poor Conditions", SimulationPresets::poor_conditions()),
    ];

    for (name, config) in presets {
        println!("{}", format!("\n>>> Testing: {}", name).bright_green().bold());
        println!("Latency: {} ms ± {} ms", config.synthetic.latency_ms, config.synthetic.jitter_ms);
        if let Some(faults) = &config.faults {
            println!(
                "Drop: {}%  Corrupt: {}%",
                (faults.drop_probability * 100.0) as u32,
                (faults.corrupt_probability * 100.0) as u32
            );
        }

        scenarios::poll_cycle_test(config.clone(), 5).await?;
        scenarios::fault_isolation_test(config.clone(), 3, 3).await?;
        scenarios::queue_pressure_test(config).await?;

        println!("{}", "Test complete!".bright_yellow());
        println!("{}", "-".repeat(50));
    }

    println!("{}", "\n>>> Testing: Extreme Conditions".bright_red().bold());
    let extreme = SimulationPresets::extreme_conditions();
    println!(
        "Latency: {} ms ± {} ms, most replies need a retry",
        extreme.synthetic.latency_ms, extreme.synthetic.jitter_ms
    );
    let report = scenarios::poll_cycle_test(extreme, 5).await?;
    log::debug!("extreme report: {}", serde_json::to_string(&report)?);

    println!("\n{}", "All simulations complete!".bright_green().bold());
    Ok(())
}

async fn run_poller(config: LinkConfig) -> Result<()> {
    let (link, mut outcomes) = RadioLink::connect(config)
        .await
        .context("radio link failed to start")?
        .with_outcomes();

    println!(
        "{}",
        format!(
            "DTD poll loop: {} link, units {:?}, every {:?}",
            link.mode(),
            link.config().allowed_addresses,
            link.config().poll_period()
        )
        .bright_blue()
        .bold()
    );

    tokio::spawn(async move {
        while let Some(outcome) = outcomes.recv().await {
            let cmd = &outcome.command;
            match outcome.reply {
                Ok(Some(frame)) => log::info!("{:?} to unit {}: {:02X?}", cmd.command, cmd.address, frame.payload),
                Ok(None) => log::warn!("{:?} to unit {}: no reply", cmd.command, cmd.address),
                Err(e) => log::warn!("{:?} to unit {}: {}", cmd.command, cmd.address, e),
            }
        }
    });

    let mut cycle = 0u64;
    let mut last_stats = Instant::now();
    let poll = link.run(|snapshot, stats| {
        cycle += 1;
        display::print_snapshot(cycle, snapshot);
        if last_stats.elapsed() >= STATS_INTERVAL {
            display::print_stats(stats);
            last_stats = Instant::now();
        }
        ControlFlow::Continue(())
    });

    tokio::select! {
        _ = poll => {}
        result = tokio::signal::ctrl_c() => {
            result.context("cannot listen for ctrl-c")?;
            println!("\n{}", "shutting down".bright_yellow());
            display::print_stats(&link.get_stats().await);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let mut config_path = None;
    let mut scenario_mode = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--scenarios" => scenario_mode = true,
            _ => config_path = Some(arg),
        }
    }

    if scenario_mode {
        return run_scenarios().await;
    }

    let config = match config_path {
        Some(path) => load_config(&path).with_context(|| format!("config {}", path))?,
        None => LinkConfig::default(),
    };
    run_poller(config).await
}
