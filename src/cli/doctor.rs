//! CLI `doctor` command: run database diagnostics and print a health report.

use anyhow::{Context, Result};

use strongroom::config::StrongroomConfig;
use strongroom::db;
use strongroom::models::ModelFiles;

/// Run database diagnostics and print a health report.
pub fn doctor(config: &StrongroomConfig) -> Result<()> {
    let db_path = config.resolved_db_path();

    if !db_path.exists() {
        println!("Database: not found at {}", db_path.display());
        println!("Run `strongroom init` to create it.");
        return Ok(());
    }

    let file_size = std::fs::metadata(&db_path)
        .map(|m| m.len())
        .unwrap_or(0);

    let database = db::open_database(&config.storage, &db_path)
        .context("failed to open database (may be corrupt)")?;
    let report = database.health().context("failed to run health check")?;

    println!("strongroom Health Report");
    println!("========================");
    println!();
    println!("Database:          {}", db_path.display());
    println!("File size:         {}", format_bytes(file_size));
    println!("Schema version:    {}", report.schema_version);
    println!("sqlite-vec:        {}", report.vec_version);
    match report.embedding_model.as_deref() {
        Some(stored) if stored != config.embedding.model => println!(
            "Embedding model:   {stored} (config names {}, open will refuse if chunks exist)",
            config.embedding.model
        ),
        stored => println!("Embedding model:   {}", stored.unwrap_or("(not set)")),
    }
    println!();
    println!("Isolation:");
    println!("  Mode:            {}", report.isolation.as_str());
    println!("  Pool role:       {}", database.role().as_str());
    println!("  Pool bypasses:   {}", if report.pool_bypasses { "YES" } else { "no" });
    if report.missing_policies.is_empty() {
        println!("  Row policies:    installed");
    } else {
        println!("  Row policies:    missing {}", report.missing_policies.join(", "));
    }
    if report.isolation_ok() {
        println!("  Status:          OK");
    } else {
        println!("  Status:          UNSAFE, tenant traffic would not be isolated");
    }
    println!();
    println!("Row counts:");
    for (partition, rows) in report.partition_rows.iter().enumerate() {
        println!("  Partition {partition}:     {rows}");
    }
    println!("  Audit log:       {}", report.audit_rows);
    println!();
    println!("Keys:              {}", if keys_present(config) { "configured" } else { "MISSING" });
    println!(
        "Cross-encoder:     {} ({})",
        config.rerank.model,
        if ModelFiles::in_dir(&config.rerank.cache_dir).exist() { "downloaded" } else { "not downloaded" }
    );
    println!();
    if report.integrity_ok {
        println!("Integrity check:   PASSED");
    } else {
        println!("Integrity check:   FAILED");
        println!();
        println!("Recovery steps:");
        println!("  1. Restore from a backup: cp backup.db ~/.strongroom/vault.db");
        println!("  2. Vectors can be checked per tenant with `strongroom verify --tenant <id>`");
    }

    Ok(())
}

fn keys_present(config: &StrongroomConfig) -> bool {
    strongroom::crypto::TenantCrypto::from_config(&config.crypto).is_ok()
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
