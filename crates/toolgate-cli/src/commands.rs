//! Administrative subcommands, run directly against the database

use anyhow::{Context, Result, bail};
use std::path::Path;

use toolgate_core::config::{ServerManifest, expand_env};
use toolgate_core::RuleAction;
use toolgate_gateway::Gateway;

/// Parse a server manifest file, with `${VAR}` expansion
pub fn load_manifest(path: &Path) -> Result<ServerManifest> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest {}", path.display()))?;
    parse_manifest(&raw).with_context(|| format!("Invalid manifest {}", path.display()))
}

fn parse_manifest(raw: &str) -> Result<ServerManifest> {
    let manifest: ServerManifest = toml::from_str(&expand_env(raw))?;
    if manifest.name.trim().is_empty() {
        bail!("Server name cannot be empty");
    }
    Ok(manifest)
}

pub async fn create_key(gateway: &Gateway, name: &str, role: &str) -> Result<()> {
    let key = gateway.policy().create_api_key(name, role).await?;
    println!("Created key for role '{}':", role.trim());
    println!("  {}", key);
    println!("Store it now; it cannot be shown again.");
    Ok(())
}

pub async fn list_keys(gateway: &Gateway) -> Result<()> {
    let keys = gateway.policy().list_api_keys().await?;
    if keys.is_empty() {
        println!("No API keys.");
        return Ok(());
    }
    println!("{:<38} {:<20} {:<12} {:<8} CREATED", "ID", "NAME", "ROLE", "ACTIVE");
    for key in keys {
        println!(
            "{:<38} {:<20} {:<12} {:<8} {}",
            key.id,
            key.name,
            key.role,
            if key.is_active { "yes" } else { "no" },
            key.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

pub async fn deactivate_key(gateway: &Gateway, id: &str) -> Result<()> {
    if !gateway.policy().deactivate_api_key(id).await? {
        bail!("No active key with id '{}'", id);
    }
    println!("Deactivated key {}", id);
    Ok(())
}

pub async fn register_server(gateway: &Gateway, manifest: &Path) -> Result<()> {
    let manifest = load_manifest(manifest)?;
    let registration = gateway.register(manifest).await?;
    println!(
        "Registered '{}' ({}) with {} tools",
        registration.name, registration.id, registration.tools
    );
    if let Some(e) = registration.sync_error {
        println!("Warning: tool discovery failed: {}", e);
    }
    Ok(())
}

pub async fn remove_server(gateway: &Gateway, name: &str) -> Result<()> {
    if !gateway.delete_server(name).await? {
        bail!("No server named '{}'", name);
    }
    println!("Removed server {}", name);
    Ok(())
}

pub async fn list_servers(gateway: &Gateway) -> Result<()> {
    let registry = gateway.registry();
    let servers = registry.list_servers().await?;
    if servers.is_empty() {
        println!("No servers registered.");
        return Ok(());
    }
    println!("{:<24} {:<15} {:<9} TOOLS", "NAME", "TRANSPORT", "STATUS");
    for server in servers {
        let tools = registry.list_tools_for(&server.name).await?;
        println!(
            "{:<24} {:<15} {:<9} {}",
            server.name,
            server.transport.kind().to_string(),
            server.status.to_string(),
            tools
                .iter()
                .map(|t| t.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    Ok(())
}

pub async fn add_rule(gateway: &Gateway, role: &str, resource: &str, action: &str) -> Result<()> {
    let action: RuleAction = action.parse()?;
    gateway.policy().add_rule(role, resource, action).await?;
    println!("{} {} {}", role.trim(), action, resource.trim());
    Ok(())
}

pub async fn remove_rule(gateway: &Gateway, role: &str, resource: &str) -> Result<()> {
    if !gateway.policy().remove_rule(role, resource).await? {
        bail!("No rule for role '{}' on '{}'", role, resource);
    }
    println!("Removed rule {} {}", role, resource);
    Ok(())
}

pub async fn list_rules(gateway: &Gateway) -> Result<()> {
    let rules = gateway.policy().list_rules().await?;
    println!("Evaluation: {:?}", gateway.policy().evaluation());
    for rule in rules {
        println!("{:<16} {:<6} {}", rule.role, rule.action.to_string(), rule.resource);
    }
    Ok(())
}

pub async fn stats(gateway: &Gateway) -> Result<()> {
    let log = gateway.call_log();
    let overall = log.get_stats().await?;
    println!("Total calls:   {}", overall.total_calls);
    println!("Errors:        {}", overall.error_count);
    println!("Success rate:  {:.1}%", overall.success_rate);
    println!("Avg latency:   {:.1}ms", overall.avg_latency_ms);

    let servers = log.get_server_stats().await?;
    if !servers.is_empty() {
        println!();
        println!("{:<24} {:>8} {:>8} {:>12}", "SERVER", "CALLS", "ERRORS", "AVG MS");
        for s in servers {
            println!(
                "{:<24} {:>8} {:>8} {:>12.1}",
                s.server_name, s.total_calls, s.error_count, s.avg_latency_ms
            );
        }
    }
    Ok(())
}

pub async fn logs(gateway: &Gateway, limit: usize) -> Result<()> {
    let entries = gateway.call_log().get_recent_logs(limit).await?;
    for entry in entries {
        println!(
            "{} {:<7} {:>6}ms {:<12} {}:{}{}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.status.to_string(),
            entry.latency_ms,
            entry.role,
            entry.server_name,
            entry.tool_name,
            entry
                .error_message
                .map(|e| format!("  ({})", e))
                .unwrap_or_default()
        );
    }
    Ok(())
}
