//! CaseVault CLI - Command line interface for case vault operations.
//!
//! This tool initializes, unlocks, migrates, and inspects the encrypted
//! vault of a case directory.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

use casevault_common::{CasePath, Error as VaultError, ErrorKind};
use casevault_crypto::kdf::MIN_PBKDF2_ITERATIONS;
use casevault_crypto::KdfParams;
use casevault_vault::{MigrationOptions, Progress, VaultConfig, VaultManager, VaultStatus};

#[derive(Parser)]
#[command(name = "casevault")]
#[command(about = "CaseVault - Encryption at rest for case directories")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Operational configuration file (JSON).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum KdfChoice {
    Pbkdf2,
    Argon2id,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the vault and encrypt every file in the case.
    Init {
        case_dir: PathBuf,

        /// Key derivation function, frozen into the manifest.
        #[arg(long, value_enum, default_value = "pbkdf2")]
        kdf: KdfChoice,

        /// PBKDF2 iteration count.
        #[arg(long, default_value_t = MIN_PBKDF2_ITERATIONS)]
        iterations: u32,
    },

    /// Show the vault status.
    Status { case_dir: PathBuf },

    /// Check the password without changing anything.
    Unlock { case_dir: PathBuf },

    /// Decrypt every file and check its content hash.
    Verify { case_dir: PathBuf },

    /// Write a decrypted copy of the case to another directory.
    Export { case_dir: PathBuf, out: PathBuf },

    /// Re-encrypt the case under a new password.
    Rotate { case_dir: PathBuf },

    /// Finish an interrupted migration.
    Resume { case_dir: PathBuf },

    /// Undo an interrupted migration.
    Rollback { case_dir: PathBuf },

    /// Decrypt the case in place and remove the vault.
    Decrypt { case_dir: PathBuf },

    /// Encrypt files added since the vault was initialized.
    Seal { case_dir: PathBuf },

    /// Print the plaintext of a case file.
    Cat { case_dir: PathBuf, path: String },

    /// Run a tool on a decrypted temporary copy of a case file.
    ///
    /// `{}` in the arguments is replaced by the temporary path; without it
    /// the path is appended. The copy is deleted when the tool exits.
    Exec {
        case_dir: PathBuf,
        path: String,
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Interactive session with the idle timeout active.
    Shell { case_dir: PathBuf },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::from(exit_code(&err))
        }
    }
}

/// Map the underlying vault error to a stable exit status.
fn exit_code(err: &anyhow::Error) -> u8 {
    let kind = err
        .chain()
        .find_map(|e| e.downcast_ref::<VaultError>())
        .map(VaultError::kind);
    match kind {
        Some(ErrorKind::Authentication) => 2,
        Some(ErrorKind::Integrity) => 3,
        Some(ErrorKind::SessionExpired) => 4,
        Some(ErrorKind::MigrationInterrupted) => 5,
        _ => 1,
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Init {
            case_dir,
            kdf,
            iterations,
        } => cmd_init(&case_dir, config, kdf, iterations).await,
        Commands::Status { case_dir } => cmd_status(&case_dir, config).await,
        Commands::Unlock { case_dir } => cmd_unlock(&case_dir, config).await,
        Commands::Verify { case_dir } => cmd_verify(&case_dir, config).await,
        Commands::Export { case_dir, out } => cmd_export(&case_dir, config, &out).await,
        Commands::Rotate { case_dir } => cmd_rotate(&case_dir, config).await,
        Commands::Resume { case_dir } => cmd_resume(&case_dir, config).await,
        Commands::Rollback { case_dir } => cmd_rollback(&case_dir, config).await,
        Commands::Decrypt { case_dir } => cmd_decrypt(&case_dir, config).await,
        Commands::Seal { case_dir } => cmd_seal(&case_dir, config).await,
        Commands::Cat { case_dir, path } => cmd_cat(&case_dir, config, &path).await,
        Commands::Exec {
            case_dir,
            path,
            command,
        } => cmd_exec(&case_dir, config, &path, command).await,
        Commands::Shell { case_dir } => cmd_shell(&case_dir, config).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<VaultConfig> {
    let config = match path {
        Some(path) => VaultConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => VaultConfig::default(),
    };
    Ok(config.apply_env()?)
}

fn open(case_dir: &Path, config: VaultConfig) -> Result<VaultManager> {
    VaultManager::open(case_dir, config)
        .with_context(|| format!("Failed to open case {}", case_dir.display()))
}

/// Prompt for password securely.
fn prompt_password(prompt: &str) -> Result<Zeroizing<String>> {
    let password = rpassword::prompt_password(prompt).context("Failed to read password")?;
    Ok(Zeroizing::new(password))
}

fn prompt_new_password(prompt: &str) -> Result<Zeroizing<String>> {
    let password = prompt_password(prompt)?;
    let confirm = prompt_password("Confirm password: ")?;
    if *password != *confirm {
        anyhow::bail!("Passwords do not match");
    }
    Ok(password)
}

fn case_path(path: &str) -> Result<CasePath> {
    CasePath::parse(path).with_context(|| format!("Invalid case path: {}", path))
}

fn progress_options() -> MigrationOptions {
    MigrationOptions::new().with_progress(|p: &Progress| {
        info!(kind = %p.kind, path = %p.path, "{}/{}", p.completed, p.total);
    })
}

async fn unlock(vault: &VaultManager) -> Result<()> {
    let password = prompt_password("Password: ")?;
    vault.unlock(&password).await.context("Failed to unlock")?;
    Ok(())
}

async fn cmd_init(case_dir: &Path, config: VaultConfig, kdf: KdfChoice, iterations: u32) -> Result<()> {
    let vault = open(case_dir, config)?;
    let kdf = match kdf {
        KdfChoice::Pbkdf2 => KdfParams::pbkdf2(iterations),
        KdfChoice::Argon2id => KdfParams::interactive(),
    };

    let password = prompt_new_password("New password: ")?;
    let report = vault
        .init_with(&password, kdf, progress_options())
        .await
        .context("Failed to initialize vault")?;

    println!("Vault initialized.");
    println!("  Files encrypted: {}", report.files);
    println!("  Bytes: {}", report.bytes);
    print_skipped(&report.skipped);
    Ok(())
}

/// List files left unencrypted because their names cannot be recorded.
fn print_skipped(skipped: &[String]) {
    if skipped.is_empty() {
        return;
    }
    println!("  Left unencrypted (unsupported file names): {}", skipped.len());
    for name in skipped {
        println!("    {}", name);
    }
}

async fn cmd_status(case_dir: &Path, config: VaultConfig) -> Result<()> {
    let vault = open(case_dir, config)?;
    let status = vault.status().await?;
    println!("Status: {}", status);
    if status != VaultStatus::NoVault {
        let entries = vault.entries().await?;
        let bytes: u64 = entries.iter().map(|e| e.plaintext_size).sum();
        println!("  Encrypted files: {}", entries.len());
        println!("  Plaintext bytes: {}", bytes);
    }
    if status == VaultStatus::Migrating {
        println!("  Run `casevault resume` or `casevault rollback`.");
    }
    Ok(())
}

async fn cmd_unlock(case_dir: &Path, config: VaultConfig) -> Result<()> {
    let vault = open(case_dir, config)?;
    unlock(&vault).await?;
    vault.lock().await;
    println!("Password accepted.");
    Ok(())
}

async fn cmd_verify(case_dir: &Path, config: VaultConfig) -> Result<()> {
    let vault = open(case_dir, config)?;
    unlock(&vault).await?;
    let report = vault.verify().await.context("Verification failed")?;

    println!("Checked {} files.", report.checked);
    if report.is_clean() {
        println!("No integrity failures.");
        return Ok(());
    }
    for failure in &report.failures {
        println!("  FAILED {}: {}", failure.path, failure.reason);
    }
    Err(VaultError::Integrity(format!("{} files failed verification", report.failures.len())).into())
}

async fn cmd_export(case_dir: &Path, config: VaultConfig, out: &Path) -> Result<()> {
    let vault = open(case_dir, config)?;
    unlock(&vault).await?;
    let report = vault
        .export_decrypted(out)
        .await
        .context("Failed to export")?;

    println!("Exported to {}.", out.display());
    println!("  Decrypted: {}", report.decrypted);
    println!("  Copied: {}", report.copied);
    println!("  Bytes: {}", report.bytes);
    Ok(())
}

async fn cmd_rotate(case_dir: &Path, config: VaultConfig) -> Result<()> {
    let vault = open(case_dir, config)?;
    let old = prompt_password("Current password: ")?;
    let new = prompt_new_password("New password: ")?;
    let report = vault
        .rotate_password_with(&old, &new, progress_options())
        .await
        .context("Failed to rotate password")?;

    println!("Password changed. {} files re-encrypted.", report.files);
    Ok(())
}

async fn cmd_resume(case_dir: &Path, config: VaultConfig) -> Result<()> {
    let vault = open(case_dir, config)?;
    let password = prompt_password("Password (the old one for a rotation): ")?;
    let report = vault
        .resume_with(&password, progress_options())
        .await
        .context("Failed to resume")?;

    println!("Resumed {} migration. {} files done.", report.kind, report.files);
    Ok(())
}

async fn cmd_rollback(case_dir: &Path, config: VaultConfig) -> Result<()> {
    let vault = open(case_dir, config)?;
    let password = prompt_password("Password (the old one for a rotation): ")?;
    let report = vault
        .rollback_with(&password, progress_options())
        .await
        .context("Failed to roll back")?;

    println!("Rolled back {} migration. {} files reverted.", report.kind, report.files);
    Ok(())
}

async fn cmd_decrypt(case_dir: &Path, config: VaultConfig) -> Result<()> {
    let vault = open(case_dir, config)?;
    let password = prompt_password("Password: ")?;
    let report = vault
        .remove_encryption_with(&password, progress_options())
        .await
        .context("Failed to remove encryption")?;

    println!("Encryption removed. {} files decrypted.", report.files);
    Ok(())
}

async fn cmd_seal(case_dir: &Path, config: VaultConfig) -> Result<()> {
    let vault = open(case_dir, config)?;
    unlock(&vault).await?;
    let report = vault
        .encrypt_new_files_with(progress_options())
        .await
        .context("Failed to encrypt new files")?;

    println!("Encrypted {} new files.", report.files);
    print_skipped(&report.skipped);
    Ok(())
}

async fn cmd_cat(case_dir: &Path, config: VaultConfig, path: &str) -> Result<()> {
    let vault = open(case_dir, config)?;
    let path = case_path(path)?;
    if !vault.is_plaintext(&path).await? {
        unlock(&vault).await?;
    }
    let bytes = vault.read(&path).await.context("Failed to read file")?;

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(bytes.as_bytes())?;
    stdout.flush()?;
    Ok(())
}

async fn cmd_exec(case_dir: &Path, config: VaultConfig, path: &str, command: Vec<String>) -> Result<()> {
    let vault = open(case_dir, config)?;
    let path = case_path(path)?;
    if !vault.is_plaintext(&path).await? {
        unlock(&vault).await?;
    }

    let (program, args) = command
        .split_first()
        .context("No command given")?;
    let program = program.clone();
    let args = args.to_vec();

    let status = vault
        .access()
        .with_materialized_async(&path, |materialized| async move {
            let shown = materialized.to_string_lossy().into_owned();
            let mut args: Vec<String> = args
                .into_iter()
                .map(|arg| arg.replace("{}", &shown))
                .collect();
            if !args.iter().any(|arg| arg.contains(&shown)) {
                args.push(shown);
            }
            Ok(tokio::process::Command::new(&program)
                .args(&args)
                .status()
                .await?)
        })
        .await
        .context("Failed to run command")?;

    if !status.success() {
        anyhow::bail!("{} exited with {}", command[0], status);
    }
    Ok(())
}

async fn cmd_shell(case_dir: &Path, config: VaultConfig) -> Result<()> {
    let vault = open(case_dir, config)?;
    println!("CaseVault shell for {}. Type `help` for commands.", case_dir.display());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("casevault> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            continue;
        };

        let result = match command {
            "quit" | "exit" => break,
            "help" => {
                println!(
                    "unlock | lock | status | info | extend <minutes> | verify | cat <path> | quit"
                );
                Ok(())
            }
            "unlock" => unlock(&vault).await,
            "lock" => {
                vault.lock().await;
                Ok(())
            }
            "status" => vault
                .status()
                .await
                .map(|status| println!("{}", status))
                .map_err(Into::into),
            "info" => {
                let info = vault.session_info().await;
                println!("{}", serde_json::to_string_pretty(&info)?);
                Ok(())
            }
            "extend" => match parse_minutes(words.next()) {
                Ok(additional) => vault
                    .extend_session(additional)
                    .await
                    .map(|()| println!("Session extended by {} minutes.", additional.as_secs() / 60))
                    .map_err(Into::into),
                Err(e) => Err(e),
            },
            "verify" => match vault.verify().await {
                Ok(report) => {
                    println!("Checked {}, {} failures.", report.checked, report.failures.len());
                    for failure in &report.failures {
                        println!("  FAILED {}: {}", failure.path, failure.reason);
                    }
                    Ok(())
                }
                Err(e) => Err(e.into()),
            },
            "cat" => match words.next() {
                Some(path) => shell_cat(&vault, path).await,
                None => Err(anyhow::anyhow!("Usage: cat <path>")),
            },
            other => Err(anyhow::anyhow!("Unknown command: {}", other)),
        };

        if let Err(err) = result {
            eprintln!("Error: {:#}", err);
        }
    }

    vault.lock().await;
    Ok(())
}

fn parse_minutes(word: Option<&str>) -> Result<Duration> {
    let minutes = word
        .ok_or_else(|| anyhow::anyhow!("Usage: extend <minutes>"))?
        .parse::<u64>()
        .context("Minutes must be a whole number")?;
    if minutes == 0 {
        anyhow::bail!("Minutes must be positive");
    }
    Ok(Duration::from_secs(minutes.saturating_mul(60)))
}

async fn shell_cat(vault: &VaultManager, path: &str) -> Result<()> {
    let bytes = vault.read(&case_path(path)?).await?;
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(bytes.as_bytes())?;
    if !bytes.as_bytes().ends_with(b"\n") {
        stdout.write_all(b"\n")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_follow_error_kind() {
        let err = anyhow::Error::from(VaultError::Authentication).context("Failed to unlock");
        assert_eq!(exit_code(&err), 2);

        let err = anyhow::Error::from(VaultError::Integrity("tag".into()));
        assert_eq!(exit_code(&err), 3);

        let err = anyhow::Error::from(VaultError::SessionExpired);
        assert_eq!(exit_code(&err), 4);

        let err = anyhow::Error::from(VaultError::MigrationInterrupted("x".into()));
        assert_eq!(exit_code(&err), 5);

        assert_eq!(exit_code(&anyhow::anyhow!("plain failure")), 1);
    }

    #[test]
    fn test_extend_takes_positive_minutes() {
        assert_eq!(parse_minutes(Some("15")).unwrap(), Duration::from_secs(900));
        assert!(parse_minutes(None).is_err());
        assert!(parse_minutes(Some("0")).is_err());
        assert!(parse_minutes(Some("soon")).is_err());
    }

    #[test]
    fn test_cli_parses_exec_trailing_command() {
        let cli = Cli::try_parse_from([
            "casevault", "exec", "/cases/a", "media/clip.wav", "--", "ffprobe", "{}",
        ])
        .unwrap();
        match cli.command {
            Commands::Exec { path, command, .. } => {
                assert_eq!(path, "media/clip.wav");
                assert_eq!(command, vec!["ffprobe", "{}"]);
            }
            _ => panic!("expected exec"),
        }
    }
}
