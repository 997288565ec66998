//! `uplift`: check for, download and install application updates.

use std::io::Write;

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uplift::config;
use uplift::logging::{self, LoggingOptions, Verbosity};
use uplift::updater::{
    CheckOutcome, CheckResult, DownloadProgress, DownloadState, ReleaseInfo, UpdateSession,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Check { force: bool },
    Download,
    Install,
    Snooze,
    ClearSnooze,
    Status,
    Reset,
    Clean,
    Init,
    Help,
}

#[derive(Debug)]
struct CliArgs {
    command: Command,
    repo: Option<String>,
    logging: LoggingOptions,
}

fn main() {
    if let Err(err) = try_main() {
        eprintln!("uplift: {err}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<(), String> {
    let args = parse_args(std::env::args().skip(1).collect())?;
    if args.command == Command::Help {
        print!("{}", help_text());
        return Ok(());
    }
    if let Err(err) = logging::init(args.logging) {
        eprintln!("Logging disabled: {err}");
    }
    let mut config = config::load_or_default().map_err(|err| err.to_string())?;
    if let Some(repo) = args.repo {
        config.release.repo = repo;
    }
    if args.command == Command::Init {
        let path = config::config_path().map_err(|err| err.to_string())?;
        config::save_to_path(&config, &path).map_err(|err| err.to_string())?;
        println!("Wrote {}", path.display());
        return Ok(());
    }
    let session = UpdateSession::from_config(&config).map_err(|err| err.to_string())?;
    run(&session, args.command)
}

fn run(session: &UpdateSession, command: Command) -> Result<(), String> {
    match command {
        Command::Check { force } => {
            let outcome = if force {
                session.check_now_blocking()
            } else {
                session.check_for_updates_blocking()
            };
            report_outcome(&outcome)
        }
        Command::Download => {
            let outcome = session.check_for_updates_blocking();
            let Some(release) = outcome.release().cloned() else {
                return report_outcome(&outcome);
            };
            download(session, &release)
        }
        Command::Install => {
            if !session.can_install() {
                session.request_install_permission();
                return Err("Install permission is required; grant it and retry".into());
            }
            let artifact = session.downloader().destination();
            if !session.downloader().has_downloaded_artifact() {
                return Err(format!(
                    "Nothing downloaded at {}; run `uplift download` first",
                    artifact.display()
                ));
            }
            session
                .try_install(artifact)
                .map_err(|err| err.to_string())?;
            println!("Installer opened for {}", artifact.display());
            Ok(())
        }
        Command::Snooze => {
            session.snooze().map_err(|err| err.to_string())?;
            let until = session.state_store().snoozed_until();
            println!("Update prompts snoozed until {}", format_millis(until));
            Ok(())
        }
        Command::ClearSnooze => {
            session.clear_snooze().map_err(|err| err.to_string())?;
            println!("Snooze cleared");
            Ok(())
        }
        Command::Status => {
            print_status(session);
            Ok(())
        }
        Command::Reset => {
            session.reset().map_err(|err| err.to_string())?;
            println!("Update state cleared");
            Ok(())
        }
        Command::Clean => {
            let removed = session.clean().map_err(|err| err.to_string())?;
            if removed {
                println!("Removed {}", session.downloader().destination().display());
            } else {
                println!("No downloaded artifact to remove");
            }
            Ok(())
        }
        Command::Init | Command::Help => Ok(()),
    }
}

fn report_outcome(outcome: &CheckOutcome) -> Result<(), String> {
    match outcome {
        CheckOutcome::Snoozed => println!("Update prompts are snoozed"),
        CheckOutcome::CooldownActive => println!("Checked recently; use `check --force` to check now"),
        CheckOutcome::Cached(release) => print_release(release, "Update pending"),
        CheckOutcome::Checked(CheckResult::UpdateAvailable(release)) => {
            print_release(release, "Update available")
        }
        CheckOutcome::Checked(CheckResult::NoUpdateAvailable) => println!("Up to date"),
        CheckOutcome::Checked(CheckResult::Error { message, .. }) => return Err(message.clone()),
    }
    Ok(())
}

fn print_release(release: &ReleaseInfo, heading: &str) {
    println!("{heading}: {} ({})", release.version_name, release.tag_name);
    if release.artifact_size_bytes > 0 {
        println!("  size: {} bytes", release.artifact_size_bytes);
    }
    println!("  url:  {}", release.artifact_url);
    if !release.release_notes.is_empty() {
        println!();
        println!("{}", release.release_notes);
    }
}

fn download(session: &UpdateSession, release: &ReleaseInfo) -> Result<(), String> {
    let mut stderr = std::io::stderr();
    let terminal = session.download_blocking(release, |progress| {
        let _ = write!(stderr, "\r{}", progress_line(progress));
        let _ = stderr.flush();
    });
    eprintln!();
    match terminal {
        DownloadState::Completed(path) => {
            println!("Downloaded {} to {}", release.version_name, path.display());
            Ok(())
        }
        DownloadState::Failed { message, .. } => Err(message),
        DownloadState::Idle | DownloadState::Downloading(_) => {
            Err("Download ended without a result".into())
        }
    }
}

fn progress_line(progress: DownloadProgress) -> String {
    match progress.total_bytes {
        Some(total) if progress.is_determinate() => format!(
            "Downloading... {:>3}% ({}/{} bytes)",
            progress.progress_percent, progress.downloaded_bytes, total
        ),
        _ => format!("Downloading... {} bytes", progress.downloaded_bytes),
    }
}

fn print_status(session: &UpdateSession) {
    let status = session.status();
    println!("repository:    {}", status.repository);
    println!("local version: {}", status.local_version);
    println!("phase:         {}", status.phase);
    let now = session.state_store().now_millis();
    match status.snoozed_until {
        Some(until) if until > now => println!("snoozed until: {}", format_millis(Some(until))),
        _ => println!("snoozed until: -"),
    }
    println!("last check:    {}", format_millis(status.last_check_at));
    match &status.cached_release {
        Some(release) => println!("pending:       {} ({})", release.version_name, release.tag_name),
        None => println!("pending:       -"),
    }
    match &status.downloaded_artifact {
        Some(path) => println!("downloaded:    {}", path.display()),
        None => println!("downloaded:    -"),
    }
}

fn format_millis(millis: Option<i64>) -> String {
    millis
        .and_then(|ms| {
            OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000).ok()
        })
        .and_then(|at| at.format(&Rfc3339).ok())
        .unwrap_or_else(|| "-".to_string())
}

fn parse_args(args: Vec<String>) -> Result<CliArgs, String> {
    if args.is_empty() {
        return Err(format!("Missing command\n\n{}", help_text()));
    }
    if args.iter().any(|a| a == "-h" || a == "--help") {
        return Ok(CliArgs {
            command: Command::Help,
            repo: None,
            logging: LoggingOptions::default(),
        });
    }
    let mut command = None;
    let mut force = false;
    let mut repo = None;
    let mut logging = LoggingOptions::default();

    let mut i = 0;
    while i < args.len() {
        let arg = &args[i];
        match arg.as_str() {
            "--repo" => {
                repo = Some(next_value(&args, &mut i, "--repo")?);
            }
            "--force" => force = true,
            "-v" | "--verbose" => logging.verbosity = Verbosity::Verbose,
            "-q" | "--quiet" => logging.verbosity = Verbosity::Quiet,
            "--no-log-file" => logging.write_file = false,
            name if command.is_none() && !name.starts_with('-') => {
                command = Some(parse_command(name)?);
            }
            unknown => return Err(format!("Unknown argument '{unknown}'\n\n{}", help_text())),
        }
        i += 1;
    }

    let command = match command {
        Some(Command::Check { .. }) => Command::Check { force },
        Some(_) if force => return Err("--force only applies to `check`".into()),
        Some(other) => other,
        None => return Err(format!("Missing command\n\n{}", help_text())),
    };
    Ok(CliArgs {
        command,
        repo,
        logging,
    })
}

fn parse_command(name: &str) -> Result<Command, String> {
    Ok(match name {
        "check" => Command::Check { force: false },
        "download" => Command::Download,
        "install" => Command::Install,
        "snooze" => Command::Snooze,
        "clear-snooze" => Command::ClearSnooze,
        "status" => Command::Status,
        "reset" => Command::Reset,
        "clean" => Command::Clean,
        "init" => Command::Init,
        other => return Err(format!("Unknown command '{other}'\n\n{}", help_text())),
    })
}

fn next_value(args: &[String], i: &mut usize, name: &str) -> Result<String, String> {
    let next = args.get(*i + 1).ok_or_else(|| format!("Missing value for {name}"))?;
    *i += 1;
    Ok(next.clone())
}

fn help_text() -> String {
    "Usage: uplift <command> [options]\n\n\
Commands:\n\
  check [--force]        Check for a newer release (--force ignores snooze and cooldown)\n\
  download               Download the pending or newly found release\n\
  install                Open the downloaded artifact with the installer\n\
  snooze                 Hide update prompts for the snooze duration\n\
  clear-snooze           Show update prompts again\n\
  status                 Print update state\n\
  reset                  Forget snooze, check history and pending release\n\
  clean                  Delete the downloaded artifact\n\
  init                   Write config.toml with the current settings (applies --repo)\n\n\
Options:\n\
  --repo <OWNER/REPO>    Repository to check (default: [release] repo in config.toml)\n\
  -v, --verbose          Log debug output\n\
  -q, --quiet            Log warnings only\n\
  --no-log-file          Do not write a log file\n\
  -h, --help             Show help\n"
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_command_with_global_options() {
        let parsed = parse_args(args(&["--repo", "owner/app", "check", "--force", "-v"])).unwrap();
        assert_eq!(parsed.command, Command::Check { force: true });
        assert_eq!(parsed.repo.as_deref(), Some("owner/app"));
        assert_eq!(parsed.logging.verbosity, Verbosity::Verbose);
    }

    #[test]
    fn rejects_unknown_and_misplaced_arguments() {
        assert!(parse_args(args(&["frobnicate"])).is_err());
        assert!(parse_args(args(&["status", "extra"])).is_err());
        assert!(parse_args(args(&["download", "--force"])).is_err());
        assert!(parse_args(args(&["--repo"])).is_err());
        assert!(parse_args(args(&[])).is_err());
    }

    #[test]
    fn every_command_name_parses() {
        for (name, expected) in [
            ("download", Command::Download),
            ("install", Command::Install),
            ("snooze", Command::Snooze),
            ("clear-snooze", Command::ClearSnooze),
            ("status", Command::Status),
            ("reset", Command::Reset),
            ("clean", Command::Clean),
            ("init", Command::Init),
        ] {
            let parsed = parse_args(args(&[name, "--no-log-file"])).unwrap();
            assert_eq!(parsed.command, expected);
            assert!(!parsed.logging.write_file);
        }
    }

    #[test]
    fn help_flag_is_not_an_error() {
        for flag in ["-h", "--help"] {
            let parsed = parse_args(args(&["check", flag])).unwrap();
            assert_eq!(parsed.command, Command::Help);
        }
        assert!(help_text().contains("init"));
    }

    #[test]
    fn progress_line_handles_unknown_total() {
        assert_eq!(
            progress_line(DownloadProgress {
                progress_percent: -1,
                downloaded_bytes: 10,
                total_bytes: None
            }),
            "Downloading... 10 bytes"
        );
        assert_eq!(format_millis(Some(0)), "1970-01-01T00:00:00Z");
        assert_eq!(format_millis(None), "-");
    }
}
