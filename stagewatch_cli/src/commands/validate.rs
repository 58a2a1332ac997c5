use crate::ui;
use anyhow::Result;
use stagewatch_config::{parse_config_from_file, SloDefinition, SloIndicator};
use std::path::PathBuf;

pub async fn execute(config_file: PathBuf) -> Result<()> {
    ui::print_header("Validating Configuration");
    ui::print_field("File", config_file.display());

    match parse_config_from_file(&config_file).await {
        Ok(config) => {
            println!();
            ui::print_success("Configuration is valid!");

            println!("\nServer:");
            ui::print_field("Address", config.server.socket_addr());
            ui::print_field("Drain timeout", humantime::format_duration(config.server.drain_timeout));

            println!("\nRetention:");
            ui::print_field("Window", humantime::format_duration(config.retention.window));
            ui::print_field("Sweep period", humantime::format_duration(config.retention.sweep_period));

            println!("\nPipeline:");
            ui::print_field("Stages", config.pipeline.stages.join(" -> "));
            ui::print_field(
                "Completion timeout",
                humantime::format_duration(config.pipeline.completion_timeout),
            );

            println!("\nSLOs: {}", config.slos.len());
            if config.slos.is_empty() {
                ui::print_warning("No SLOs defined, /slos will be empty");
            }
            for (i, slo) in config.slos.iter().enumerate() {
                println!("  {}: {}", i + 1, describe(slo));
            }

            Ok(())
        }
        Err(e) => {
            println!();
            ui::print_error("Configuration is invalid!");
            println!("\nError: {:#}", e);
            Err(e)
        }
    }
}

fn describe(slo: &SloDefinition) -> String {
    let indicator = match &slo.indicator {
        SloIndicator::Ratio { good, bad } => format!("ratio({} / ({} + {}))", good, good, bad),
        SloIndicator::Percentile { metric, percentile } => format!("p{}({})", percentile * 100.0, metric),
        SloIndicator::Gauge { metric } => format!("gauge({})", metric),
    };
    format!(
        "{} {} {} {} over {}",
        slo.name,
        indicator,
        slo.comparator.as_str(),
        slo.threshold,
        humantime::format_duration(slo.window)
    )
}
