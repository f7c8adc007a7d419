//! `lanshim validate` and `lanshim status` commands

use super::{Context, GlobalArgs};
use anyhow::Result;
use colored::Colorize;
use lanshim_core::error::exit_code;
use lanshim_core::network::create_host_network;
use lanshim_core::{load_and_validate, ShimState};
use tabled::{settings::Style, Table, Tabled};

#[derive(Tabled)]
struct RouteRow {
    #[tabled(rename = "SERVICE")]
    service: String,
    #[tabled(rename = "ADDRESS")]
    address: String,
    #[tabled(rename = "ROUTE")]
    route: String,
}

/// Validate the configuration against the host without changing anything.
pub async fn validate(global: &GlobalArgs, json: bool) -> Result<u8> {
    let net = create_host_network()?;
    let descriptor = load_and_validate(&global.raw_config()?, net.as_ref()).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&descriptor)?);
        return Ok(exit_code::SUCCESS);
    }

    println!("{} Configuration is valid", "✓".green().bold());
    println!("  Parent:        {}", descriptor.host_interface());
    println!("  Subnet:        {}", descriptor.subnet());
    println!("  Service range: {}", descriptor.service_range());
    println!("  Shim:          {} at {}", descriptor.shim_name(), descriptor.host_endpoint());
    for (name, addr) in descriptor.services() {
        println!("  Service:       {} {}", name, addr);
    }
    Ok(exit_code::SUCCESS)
}

/// Show the shim, its routes and the unit.
pub async fn status(global: &GlobalArgs, json: bool) -> Result<u8> {
    let ctx = Context::load(global).await?;
    let report = ctx.lifecycle.status(&ctx.descriptor).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(exit_code::SUCCESS);
    }

    let state = match report.shim.state {
        ShimState::Routed => report.shim.state.to_string().green(),
        ShimState::Created => report.shim.state.to_string().yellow(),
        ShimState::Absent => report.shim.state.to_string().red(),
    };
    println!(
        "Shim {} on {} at {}: {}",
        report.shim.name.bold(),
        report.shim.parent,
        report.shim.host_endpoint,
        state
    );

    let rows: Vec<RouteRow> = report
        .routes
        .iter()
        .map(|r| RouteRow {
            service: r.service.clone(),
            address: r.destination.to_string(),
            route: match (&r.foreign_dev, r.present) {
                (Some(dev), _) => format!("conflict via {}", dev).red().to_string(),
                (None, true) => format!("via {}", report.shim.name).green().to_string(),
                (None, false) => "missing".yellow().to_string(),
            },
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::modern());
    println!("{}", table);

    let unit = if report.unit_installed { "installed".green() } else { "not installed".red() };
    println!("Unit {}: {}", report.unit.bold(), unit);
    Ok(exit_code::SUCCESS)
}
