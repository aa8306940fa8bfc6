use std::path::PathBuf;

use anyhow::Result;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum CliCommand {
    Run { config: Option<PathBuf> },
    InitDb { config: Option<PathBuf> },
    Status { config: Option<PathBuf> },
    Help,
    Version,
}

pub(crate) fn version_text() -> String {
    format!("trustplane {}", env!("CARGO_PKG_VERSION"))
}

pub(crate) fn usage_text() -> String {
    format!(
        "{version}
Zero Trust Policy Core for small-office IoT networks

Usage:
  trustplane [run] [--config <FILE>]
  trustplane init-db [--config <FILE>]
  trustplane status [--config <FILE>]
  trustplane --help
  trustplane --version

Options:
  -c, --config <FILE>  Configuration file (JSON); TRUSTPLANE_* environment
                       variables override file values
  -h, --help           Show this help text
  -V, --version        Show version",
        version = version_text()
    )
}

pub(crate) fn parse_cli_args<I, S>(args: I) -> Result<CliCommand>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut iter = args.into_iter();
    let _program_name = iter.next();

    let mut command: Option<String> = None;
    let mut config: Option<PathBuf> = None;

    while let Some(arg) = iter.next() {
        let arg = arg.as_ref();
        match arg {
            "-h" | "--help" => return Ok(CliCommand::Help),
            "-V" | "--version" => return Ok(CliCommand::Version),
            "run" | "init-db" | "status" => {
                if command.as_deref().is_some_and(|existing| existing != arg) {
                    return Err(anyhow::anyhow!(
                        "Multiple commands provided. Use only one command.\n\n{}",
                        usage_text()
                    ));
                }
                command = Some(arg.to_string());
            }
            "-c" | "--config" => {
                let value = iter.next().ok_or_else(|| {
                    anyhow::anyhow!("Missing value for --config.\n\n{}", usage_text())
                })?;
                config = Some(PathBuf::from(value.as_ref()));
            }
            _ if arg.starts_with("--config=") => {
                let value = arg.split_once('=').map(|(_, v)| v).unwrap_or_default();
                if value.is_empty() {
                    return Err(anyhow::anyhow!(
                        "Missing value for --config.\n\n{}",
                        usage_text()
                    ));
                }
                config = Some(PathBuf::from(value));
            }
            unknown => {
                return Err(anyhow::anyhow!(
                    "Unknown argument: '{}'.\n\n{}",
                    unknown,
                    usage_text()
                ));
            }
        }
    }

    Ok(match command.as_deref() {
        Some("init-db") => CliCommand::InitDb { config },
        Some("status") => CliCommand::Status { config },
        _ => CliCommand::Run { config },
    })
}
