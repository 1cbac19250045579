use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::config;
use crate::environment::Environment;
use crate::parser::{self, ParseError};
use crate::proxmox::{ProxmoxClient, ProxmoxError, VirtualMachine};
use crate::queue::Job;
use crate::remote::RemoteError;
use crate::report::{self, AnalysisStatus, FileMetadata, Report, ReportError};

const ANALYSIS_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const SAMPLE_EXECUTION_TIMEOUT: Duration = Duration::from_secs(2 * 60);
const PING_INTERVAL: Duration = Duration::from_secs(1);

const DRIVER_PATH: &str = "/Users/administrator/amaterasu.client.exe";
const REMOTE_LOG_DIR: &str = "/Users/administrator";
const LOG_FILES: [&str; 4] = ["reg.txt", "fs.txt", "load.txt", "proc.txt"];

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Analysis reached timeout (5m0s)")]
    Timeout,
    #[error(transparent)]
    Proxmox(#[from] ProxmoxError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("failed to start virtual machine after {0} attempts")]
    StartTimedOut(u32),
    #[error("failed to stop virtual machine after {0} attempts")]
    StopTimedOut(u32),
    #[error("failed to get IP address")]
    NoUsableAddress,
    #[error("failed to dial SSH after {0} attempts")]
    DialFailed(u32),
    #[error("failed to start driver: {0}")]
    Driver(RemoteError),
    #[error("failed to kill client: {0}")]
    Kill(RemoteError),
    #[error("virtual machine stopped answering liveness pings: {0}")]
    GuestDied(ProxmoxError),
    #[error("analysis environment is not available")]
    NoEnvironment,
}

/// Driver version shipped inside each known template.
pub fn driver_version(template: u32) -> &'static str {
    match template {
        9011 => "1.0.3.2",
        _ => "",
    }
}

/// One analysis in flight: the report being built and the environment it
/// runs in. The report is owned here and only ever mutated by the worker
/// driving this analysis; everyone else reads the files it persists.
pub struct Analysis {
    pub report: Report,
    env: Environment,
    client: ProxmoxClient,
    node_name: String,
    sample_path: PathBuf,
}

impl Analysis {
    /// Builds the initial report for a job (metadata of the persisted
    /// sample, status Running) and persists both artifacts so the status
    /// stream has content from the first second.
    pub async fn new(
        job: &Job,
        client: ProxmoxClient,
        node_name: String,
    ) -> Result<Analysis, AnalysisError> {
        let file = FileMetadata::collect(&job.sample_path, &job.filename)?;

        let mut analysis = Analysis {
            report: Report::default(),
            env: Environment::new(job.template),
            client,
            node_name,
            sample_path: job.sample_path.clone(),
        };
        analysis.report.request.status = AnalysisStatus::Running;
        analysis.report.request.id = job.id.clone();
        analysis.report.request.template_id = job.template;
        analysis.report.request.driver_version = driver_version(job.template).to_string();
        analysis.report.request.start_time = report::current_timestamp();
        analysis.report.request.file = file;

        analysis.report.save_status()?;
        analysis.report.save_report()?;

        Ok(analysis)
    }

    /// Runs the whole pipeline under the analysis-wide deadline.
    pub async fn run(&mut self) -> Result<(), AnalysisError> {
        match tokio::time::timeout(ANALYSIS_TIMEOUT, self.run_pipeline()).await {
            Ok(result) => result,
            Err(_) => Err(AnalysisError::Timeout),
        }
    }

    async fn run_pipeline(&mut self) -> Result<(), AnalysisError> {
        self.report.append_log("Providing environment...");
        let client = self.client.clone();
        let node_name = self.node_name.clone();
        self.env.create(&client, &node_name).await?;
        self.report.append_log("Analysis environment created");

        self.send_sample().await?;
        self.report.append_log("Sample sent to environment");

        self.report.append_log("Analysis started");
        self.execute_sample().await?;
        self.report.append_log("Analysis finished");

        self.retrieve_logs().await?;
        self.report.append_log("Results retrieved");

        self.report.request.status = AnalysisStatus::Completed;
        self.report.request.end_time = report::current_timestamp();
        self.report.save_status()?;
        self.report.save_report()?;

        Ok(())
    }

    /// Uploads the sample to the guest home directory under the name the
    /// driver expects.
    async fn send_sample(&self) -> Result<(), AnalysisError> {
        let remote = format!("sample{}", self.report.request.file.extension);
        self.env.session()?.upload(&self.sample_path, &remote).await?;
        Ok(())
    }

    /// Runs the driver against the sample. Two tasks race under one scope:
    /// the runner executes the driver bounded by the sample timeout, and the
    /// supervisor pings the guest. Whichever resolves first wins; dropping
    /// the scope cancels the other.
    async fn execute_sample(&self) -> Result<(), AnalysisError> {
        let session = self.env.session()?;
        let vm = self.env.vm()?;

        let command = format!(
            "{} L M 1024 n sample{} a",
            DRIVER_PATH, self.report.request.file.extension
        );
        let mut driver = session.start(&command).await.map_err(AnalysisError::Driver)?;

        tokio::select! {
            result = async {
                match tokio::time::timeout(SAMPLE_EXECUTION_TIMEOUT, driver.wait()).await {
                    Ok(Ok(_exit_status)) => Ok(()),
                    Ok(Err(e)) => Err(AnalysisError::Driver(e)),
                    // The driver keeps running until told otherwise; a kill
                    // after the timeout is the normal end of a run.
                    Err(_) => driver.kill().await.map_err(AnalysisError::Kill),
                }
            } => result,
            death = supervise(vm) => Err(death),
        }
    }

    /// Fetches the four driver logs into `logs/<id>/`, then parses them into
    /// the report. All downloads happen before any parsing so the event
    /// arrays are complete or absent, never partial.
    async fn retrieve_logs(&mut self) -> Result<(), AnalysisError> {
        let local_dir = Path::new(config::LOG_PATH).join(&self.report.request.id);
        fs::create_dir_all(&local_dir)?;

        {
            let session = self.env.session()?;
            for name in LOG_FILES {
                let remote = format!("{REMOTE_LOG_DIR}/{name}");
                session.download(&remote, &local_dir.join(name)).await?;
            }
        }

        for name in LOG_FILES {
            let content = fs::read_to_string(local_dir.join(name))?;
            if content.is_empty() {
                self.report.append_log(&format!("{name} is empty"));
            }
            match name {
                "reg.txt" => self
                    .report
                    .process
                    .reg
                    .extend(parser::parse_registry_log(&content)?),
                "fs.txt" => self
                    .report
                    .process
                    .fs
                    .extend(parser::parse_file_system_log(&content)?),
                "load.txt" => self
                    .report
                    .process
                    .load
                    .extend(parser::parse_image_load_log(&content)?),
                "proc.txt" => self
                    .report
                    .process
                    .proc
                    .extend(parser::parse_process_log(&content)?),
                _ => unreachable!(),
            }
        }

        Ok(())
    }

    /// Tears down the environment. Exactly one teardown is attempted per
    /// analysis; the environment consumes its handles on the first call.
    pub async fn cleanup(&mut self) -> Result<(), AnalysisError> {
        self.env.destroy().await
    }
}

/// Pings the guest until it stops answering; the first failure means the VM
/// died under the sample.
async fn supervise(vm: &VirtualMachine) -> AnalysisError {
    loop {
        if let Err(e) = vm.ping().await {
            return AnalysisError::GuestDied(e);
        }
        tokio::time::sleep(PING_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_template_maps_to_driver_version() {
        assert_eq!(driver_version(9011), "1.0.3.2");
        assert_eq!(driver_version(105), "");
    }

    #[test]
    fn timeout_error_message_is_stable() {
        assert_eq!(
            AnalysisError::Timeout.to_string(),
            "Analysis reached timeout (5m0s)"
        );
    }
}
