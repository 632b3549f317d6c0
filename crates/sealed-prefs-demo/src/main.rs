mod cli;
mod config;
mod storage;

use std::collections::BTreeSet;

use crate::cli::{ConfigCommand, ValueKind};
use clap::Parser;
use color_eyre::Result;
use sealed_prefs_core::prefs::StoredValue;
use sealed_prefs_storage::SecurePreferences;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Entry point: the host application's startup, then one store operation.
fn main() -> Result<()> {
    color_eyre::install()?;
    let config = config::load()?;
    init_tracing(config.debug);

    // Once per process, before any store is opened.
    if let Err(err) = sealed_prefs_storage::init() {
        warn!("cipher backend unavailable, values will read as absent: {err}");
    }
    sealed_prefs_storage::set_debug(config.debug);

    let cli = cli::Cli::parse();
    match cli.command.unwrap_or(cli::Command::Sample) {
        cli::Command::Sample => run_sample(&storage::store_from_config(&config)?)?,
        cli::Command::Version => print_version(),
        cli::Command::Health => {
            run_store_health(&storage::store_from_config(&config)?)?;
            println!("Storage: ok");
        }
        cli::Command::Put { key, value, kind } => {
            let prefs = storage::store_from_config(&config)?;
            put_value(&prefs, &key, &value, kind)?;
        }
        cli::Command::Get { key, kind } => {
            let prefs = storage::store_from_config(&config)?;
            match read_value(&prefs, &key, kind)? {
                Some(value) => println!("{value}"),
                None => println!("<unavailable>"),
            }
        }
        cli::Command::Remove { key } => {
            let prefs = storage::store_from_config(&config)?;
            let mut editor = prefs.edit();
            editor.remove(&key);
            if !editor.commit() {
                color_eyre::eyre::bail!("failed to persist removal");
            }
        }
        cli::Command::Contains { key } => {
            println!("{}", storage::store_from_config(&config)?.contains(&key));
        }
        cli::Command::List => {
            for (storage_key, value) in storage::store_from_config(&config)?.get_all() {
                println!("{storage_key} = {}", render(&value));
            }
        }
        cli::Command::Config(ConfigCommand::Init) => init_config(&config)?,
    }

    Ok(())
}

fn init_tracing(debug: bool) {
    // Respect user-provided filters; otherwise info, or debug when the config asks for it.
    let default_level = if debug { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn print_version() {
    println!("sealed-prefs {}", env!("CARGO_PKG_VERSION"));
}

fn run_sample(prefs: &SecurePreferences) -> Result<()> {
    let mut editor = prefs.edit();
    editor.put_string("test", "Hello");
    editor.apply();
    info!(
        "test -> {}",
        prefs.get_string("test", "")?.unwrap_or_default()
    );
    Ok(())
}

fn run_store_health(prefs: &SecurePreferences) -> Result<()> {
    let probe_key = "health/probe";
    let mut editor = prefs.edit();
    editor.put_string(probe_key, "ok");
    if !editor.commit() {
        color_eyre::eyre::bail!("storage write failed");
    }

    let round_trip = prefs.get_string(probe_key, "")?;
    remove_or_warn(prefs, probe_key);

    if round_trip.as_deref() != Some("ok") {
        color_eyre::eyre::bail!("storage round-trip failed");
    }
    Ok(())
}

/// Best-effort removal; a failure is logged rather than returned.
fn remove_or_warn(prefs: &SecurePreferences, key: &str) -> bool {
    let mut editor = prefs.edit();
    editor.remove(key);
    let removed = editor.commit();
    if !removed {
        warn!(key, "failed to remove preference");
    }
    removed
}

fn put_value(prefs: &SecurePreferences, key: &str, value: &str, kind: ValueKind) -> Result<()> {
    let mut editor = prefs.edit();
    match kind {
        ValueKind::String => editor.put_string(key, value),
        ValueKind::Int => editor.put_int(key, value.parse()?),
        ValueKind::Long => editor.put_long(key, value.parse()?),
        ValueKind::Float => editor.put_float(key, value.parse()?),
        ValueKind::Boolean => editor.put_boolean(key, value.parse()?),
        ValueKind::StringSet => editor.put_string_set(key, split_members(value)),
    };
    if !editor.commit() {
        color_eyre::eyre::bail!("failed to persist `{key}`");
    }
    Ok(())
}

/// `None` means the value is present but could not be decrypted.
fn read_value(prefs: &SecurePreferences, key: &str, kind: ValueKind) -> Result<Option<String>> {
    let value = match kind {
        ValueKind::String => prefs.get_string(key, "")?,
        ValueKind::Int => prefs.get_int(key, 0)?.map(|v| v.to_string()),
        ValueKind::Long => prefs.get_long(key, 0)?.map(|v| v.to_string()),
        ValueKind::Float => prefs.get_float(key, 0.0)?.map(|v| v.to_string()),
        ValueKind::Boolean => prefs.get_boolean(key, false)?.map(|v| v.to_string()),
        ValueKind::StringSet => prefs
            .get_string_set(key, BTreeSet::new())?
            .map(|set| render(&StoredValue::TextSet(set))),
    };
    Ok(value)
}

fn split_members(value: &str) -> BTreeSet<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|member| !member.is_empty())
        .map(str::to_string)
        .collect()
}

fn render(value: &StoredValue) -> String {
    match value {
        StoredValue::Text(text) => text.clone(),
        StoredValue::TextSet(members) => {
            format!("{{{}}}", members.iter().cloned().collect::<Vec<_>>().join(", "))
        }
    }
}

fn init_config(config: &config::Config) -> Result<()> {
    let path = config::write_default_if_missing(config)?;
    println!("Config initialized at {}", path.display());
    Ok(())
}
