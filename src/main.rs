use log::{error, info, warn};
use safetec_water::config::Config;
use safetec_water::coordinator::{Coordinator, Event};
use safetec_water::models::device::Channel;
use std::path::{Path, PathBuf};

#[derive(Debug)]
struct LoadedEnvFile {
    path: PathBuf,
    explicit: bool,
}

#[derive(Debug, Default)]
struct CliArgs {
    env_file: Option<PathBuf>,
    once: bool,
}

fn run(once: bool) -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (device={}:{}, poll_interval={}s, pressure_interval={}s, request_timeout={}s, max_request_attempts={}, retry_backoff={}ms)",
        cfg.host,
        cfg.port,
        cfg.main_interval.as_secs(),
        cfg.pressure_interval.as_secs(),
        cfg.request_timeout.as_secs(),
        cfg.max_request_attempts.get(),
        cfg.retry_backoff.as_millis()
    );

    // 2) Bootstrap both channels
    let mut coordinator = Coordinator::new(&cfg);
    coordinator
        .start()
        .map_err(|e| format!("Device setup failed (is the Trio reachable?): {}", e))?;

    let device = coordinator.device_info();
    info!(
        "Connected to device {} (serial={}, firmware={}, configuration={})",
        device.identifier,
        device.serial_number.as_deref().unwrap_or("-"),
        device.firmware_version.as_deref().unwrap_or("-"),
        device.configuration_url
    );
    for channel in Channel::ALL {
        if let Some(latest) = coordinator.latest(channel) {
            info!("Initial {} snapshot: {}", channel, latest.snapshot.describe());
        }
    }

    if once {
        coordinator.stop();
        return Ok(());
    }

    // 3) Report every cycle until the process is terminated
    let events = coordinator.subscribe();
    for event in events.iter() {
        match event {
            Event::Published { channel, snapshot } => {
                info!("{} snapshot: {}", channel, snapshot.describe());
            }
            Event::Failed { channel, error } => {
                let age = coordinator
                    .latest(channel)
                    .map(|l| (chrono::Utc::now() - l.fetched_at).num_seconds())
                    .unwrap_or_default();
                warn!("{} refresh failed; serving data from {}s ago: {}", channel, age, error);
            }
        }
    }

    Ok(())
}

fn parse_cli_args<I>(args: I) -> Result<CliArgs, String>
where
    I: IntoIterator<Item = std::ffi::OsString>,
{
    let mut args = args.into_iter();
    let mut parsed = CliArgs::default();

    while let Some(arg) = args.next() {
        match arg.to_str() {
            Some("--env-file") => {
                if parsed.env_file.is_some() {
                    return Err("`--env-file` provided more than once".to_string());
                }
                let value = args
                    .next()
                    .ok_or_else(|| "`--env-file` requires a path argument".to_string())?;
                parsed.env_file = Some(PathBuf::from(value));
            }
            Some(s) if s.starts_with("--env-file=") => {
                if parsed.env_file.is_some() {
                    return Err("`--env-file` provided more than once".to_string());
                }
                let path_str = &s["--env-file=".len()..];
                if path_str.is_empty() {
                    return Err("`--env-file` requires a path argument".to_string());
                }
                parsed.env_file = Some(PathBuf::from(path_str));
            }
            Some("--once") => parsed.once = true,
            Some("--") => break,
            Some(other) => return Err(format!("unrecognised argument: {}", other)),
            None => return Err("argument contains invalid UTF-8".to_string()),
        }
    }

    Ok(parsed)
}

fn configure_env(env_file: Option<PathBuf>) -> Result<Option<LoadedEnvFile>, String> {
    if let Some(path) = env_file {
        if !path.is_file() {
            return Err(format!("env file not found: {}", path.display()));
        }
        load_env_file(&path)?;
        Ok(Some(LoadedEnvFile { path, explicit: true }))
    } else {
        let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
        let default_path = cwd.join(".env");
        if default_path.is_file() {
            load_env_file(&default_path)?;
            Ok(Some(LoadedEnvFile {
                path: default_path,
                explicit: false,
            }))
        } else {
            Ok(None)
        }
    }
}

fn load_env_file(path: &Path) -> Result<(), String> {
    use std::fs::File;
    use std::io::{BufRead, BufReader};

    let file = File::open(path).map_err(|e| format!("failed to open {}: {}", path.display(), e))?;
    let reader = BufReader::new(file);

    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| format!("failed to read {} at line {}: {}", path.display(), index + 1, e))?;
        match parse_env_assignment(&line) {
            Ok(Some((key, value))) => {
                // Values already in the process environment win.
                if std::env::var_os(&key).is_none() {
                    // Runs before any other thread is spawned.
                    unsafe {
                        std::env::set_var(key, value);
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                return Err(format!("{}:{}: {}", path.display(), index + 1, e));
            }
        }
    }

    Ok(())
}

fn parse_env_assignment(line: &str) -> Result<Option<(String, String)>, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }

    let without_export = trimmed
        .strip_prefix("export ")
        .map(|s| s.trim_start())
        .unwrap_or(trimmed);

    let (key, value_part) = without_export
        .split_once('=')
        .ok_or_else(|| "missing '=' in assignment".to_string())?;
    let key = key.trim();

    if key.is_empty() {
        return Err("environment variable name cannot be empty".to_string());
    }
    if key.chars().any(|c| c.is_whitespace()) {
        return Err(format!("environment variable name contains whitespace: {}", key));
    }

    let value = parse_env_value(value_part)?;
    Ok(Some((key.to_string(), value)))
}

fn parse_env_value(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(String::new());
    }

    if let Some(rest) = trimmed.strip_prefix('"') {
        parse_double_quoted(rest)
    } else if let Some(rest) = trimmed.strip_prefix('\'') {
        parse_single_quoted(rest)
    } else {
        let value = trimmed.split('#').next().unwrap_or_default().trim_end();
        Ok(value.to_string())
    }
}

fn parse_double_quoted(input: &str) -> Result<String, String> {
    let mut result = String::new();
    let mut chars = input.chars();
    let mut escape = false;

    while let Some(ch) = chars.next() {
        if escape {
            let value = match ch {
                'n' => '\n',
                'r' => '\r',
                't' => '\t',
                other => other,
            };
            result.push(value);
            escape = false;
            continue;
        }

        match ch {
            '\\' => escape = true,
            '"' => return closing_remainder(chars.as_str(), "double").map(|()| result),
            other => result.push(other),
        }
    }

    if escape {
        Err("unterminated escape sequence in double-quoted value".to_string())
    } else {
        Err("unterminated double-quoted value".to_string())
    }
}

fn parse_single_quoted(input: &str) -> Result<String, String> {
    match input.split_once('\'') {
        Some((value, rest)) => closing_remainder(rest, "single").map(|()| value.to_string()),
        None => Err("unterminated single-quoted value".to_string()),
    }
}

/// Only a comment may follow a closing quote.
fn closing_remainder(rest: &str, quote: &str) -> Result<(), String> {
    let rest = rest.trim();
    if rest.is_empty() || rest.starts_with('#') {
        Ok(())
    } else {
        Err(format!("unexpected characters after closing {} quote", quote))
    }
}

fn main() {
    let setup = parse_cli_args(std::env::args_os().skip(1))
        .and_then(|args| configure_env(args.env_file).map(|loaded| (args.once, loaded)));
    let (once, loaded_env) = match setup {
        Ok(v) => v,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, info.path.display());
    }

    info!(
        "safetec-water {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run(once) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
