//! `lanshim install|apply|remove|uninstall|unregister` commands

use super::{Context, GlobalArgs};
use anyhow::{Context as _, Result};
use colored::Colorize;
use lanshim_core::error::exit_code;
use lanshim_core::ApplyReport;

fn print_applied(report: &ApplyReport) {
    println!(
        "{} Shim {} up at {} on {}",
        "✓".green().bold(),
        report.shim.name.bold(),
        report.shim.host_endpoint,
        report.shim.parent
    );
    for route in &report.routes {
        println!("  {} {} via {}", route.service, route.destination, route.via);
    }
}

/// Create the shim and routes, then register the boot-time unit.
pub async fn install(global: &GlobalArgs) -> Result<u8> {
    let ctx = Context::load(global).await?;
    let lock = ctx.lock(global, "install the shim").await?;
    let executable =
        std::env::current_exe().context("cannot determine the path of this executable")?;

    let report = ctx.lifecycle.install(&lock, &ctx.descriptor, &executable).await?;
    print_applied(&report.applied);
    println!(
        "{} Unit {} enabled (config snapshot {})",
        "✓".green().bold(),
        report.unit.name.bold(),
        ctx.lifecycle.registrar().snapshot_path().display()
    );
    Ok(exit_code::SUCCESS)
}

/// Create the shim and routes.
pub async fn apply(global: &GlobalArgs) -> Result<u8> {
    let ctx = Context::load(global).await?;
    let lock = ctx.lock(global, "apply the shim").await?;

    let report = ctx.lifecycle.apply(&lock, &ctx.descriptor).await?;
    print_applied(&report);
    Ok(exit_code::SUCCESS)
}

/// Remove the routes and the shim.
pub async fn remove(global: &GlobalArgs) -> Result<u8> {
    let ctx = Context::load(global).await?;
    let lock = ctx.lock(global, "remove the shim").await?;

    ctx.lifecycle.remove(&lock, &ctx.descriptor).await?;
    println!("{} Shim {} removed", "✓".green().bold(), ctx.descriptor.shim_name().bold());
    Ok(exit_code::SUCCESS)
}

/// Unregister the unit, then remove the routes and the shim.
pub async fn uninstall(global: &GlobalArgs) -> Result<u8> {
    let ctx = Context::load(global).await?;
    let lock = ctx.lock(global, "uninstall the shim").await?;

    ctx.lifecycle.uninstall(&lock, &ctx.descriptor).await?;
    println!(
        "{} Unit {} and shim {} removed",
        "✓".green().bold(),
        ctx.descriptor.unit_name().bold(),
        ctx.descriptor.shim_name().bold()
    );
    Ok(exit_code::SUCCESS)
}

/// Unregister the unit; the shim stays up.
pub async fn unregister(global: &GlobalArgs) -> Result<u8> {
    let ctx = Context::load(global).await?;

    ctx.lifecycle.unregister(&ctx.descriptor).await?;
    println!("{} Unit {} unregistered", "✓".green().bold(), ctx.descriptor.unit_name().bold());
    Ok(exit_code::SUCCESS)
}
