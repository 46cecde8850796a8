//! Runs the external profile scraper and keeps its output.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;

use autodialer_config::ScrapeConfig;

pub const PROFILES_FILE: &str = "scraped_profiles.json";
pub const LOG_FILE: &str = "last_scrape.log";

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("scrape output error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Clone, Debug, Serialize)]
pub struct ScrapeReport {
    pub success: bool,
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub profiles: Option<PathBuf>,
    pub log: PathBuf,
}

pub struct ScrapeRunner {
    cfg: ScrapeConfig,
}

impl ScrapeRunner {
    pub fn new(cfg: ScrapeConfig) -> Self {
        Self { cfg }
    }

    fn profiles_path(&self) -> PathBuf {
        self.cfg.out_dir.join(PROFILES_FILE)
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.cfg.program);
        cmd.arg(&self.cfg.script);
        cmd.current_dir(&self.cfg.project_root);
        cmd.env("EMAIL", &self.cfg.email);
        cmd.env("PASSWORD", &self.cfg.password);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd
    }

    /// Run the scraper to completion. A non-zero exit is a report, not an error.
    pub async fn run(&self) -> Result<ScrapeReport, ScrapeError> {
        tokio::fs::create_dir_all(&self.cfg.out_dir).await?;

        tracing::info!(program = %self.cfg.program, script = %self.cfg.script.display(), "scrape starting");
        let output = self
            .build_command()
            .output()
            .await
            .map_err(|source| ScrapeError::Spawn {
                program: self.cfg.program.clone(),
                source,
            })?;

        let dropped = self.cfg.project_root.join(PROFILES_FILE);
        let profiles = self.profiles_path();
        if tokio::fs::try_exists(&dropped).await? {
            tokio::fs::rename(&dropped, &profiles).await?;
        }

        let exit_code = output.status.code();
        let log = self.cfg.out_dir.join(LOG_FILE);
        let status = exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string());
        let text = format!(
            "--- STDOUT ---\n{}\n\n--- STDERR ---\n{}\n--- STATUS ---\n{status}\n",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr),
        );
        tokio::fs::write(&log, text).await?;

        let success = output.status.success();
        if success {
            tracing::info!(log = %log.display(), "scrape finished");
        } else {
            tracing::warn!(?exit_code, log = %log.display(), "scrape failed");
        }

        let profiles = tokio::fs::try_exists(&profiles)
            .await?
            .then_some(profiles);
        Ok(ScrapeReport {
            success,
            exit_code,
            profiles,
            log,
        })
    }

    /// Contents of the last scraped profiles file, if any.
    pub async fn download(&self) -> Result<Option<Vec<u8>>, ScrapeError> {
        match tokio::fs::read(self.profiles_path()).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
