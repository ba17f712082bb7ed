//! CLI `init` and `keygen` commands.

use anyhow::{Context, Result};

use strongroom::config::{default_config_path, StrongroomConfig};
use strongroom::crypto::generate_keys;
use strongroom::db;

/// Write `~/.strongroom/config.toml` with fresh keys, then create the database.
pub fn init(force: bool) -> Result<()> {
    let path = default_config_path();
    if path.exists() && !force {
        anyhow::bail!(
            "config already exists at {}. Re-run with --force to replace it (existing data becomes unreadable).",
            path.display()
        );
    }
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let (encryption_key, tenant_secret) = generate_keys();
    let contents = format!(
        "# Generated by `strongroom init`. Keep this file private.\n\
         [crypto]\n\
         encryption_key = \"{encryption_key}\"\n\
         tenant_secret = \"{tenant_secret}\"\n\n\
         [storage]\n\
         isolation = \"row_policy\"\n"
    );
    std::fs::write(&path, contents)
        .with_context(|| format!("failed to write {}", path.display()))?;
    restrict_permissions(&path)?;
    println!("Config written to {}", path.display());

    let config = StrongroomConfig::load_from(&path)?;
    let db_path = config.resolved_db_path();
    db::open_database(&config.storage, &db_path).context("failed to create database")?;
    println!("Database ready at {}", db_path.display());
    Ok(())
}

/// Print fresh key material in `export` form.
pub fn keygen() {
    let (encryption_key, tenant_secret) = generate_keys();
    println!("export STRONGROOM_ENCRYPTION_KEY={encryption_key}");
    println!("export STRONGROOM_TENANT_SECRET={tenant_secret}");
}

#[cfg(unix)]
fn restrict_permissions(path: &std::path::Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("failed to restrict permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &std::path::Path) -> Result<()> {
    Ok(())
}
