use std::fs;
use std::path::Path;

use chrono::Local;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config;

/// Timestamp layout used for start/end times and file modification times.
pub const TIME_FORMAT: &str = "%d-%m-%Y %H:%M:%S %z";

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("analysis id is not set")]
    MissingId,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Final artifact of one analysis. The request half doubles as the live
/// status document and is persisted separately so it can be polled without
/// dragging the event arrays along.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Report {
    #[serde(rename = "requestMetadata")]
    pub request: RequestMetadata,
    #[serde(rename = "processMetadata")]
    pub process: ProcessMetadata,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnalysisStatus {
    #[default]
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub status: AnalysisStatus,
    pub id: String,
    #[serde(rename = "driverVersion")]
    pub driver_version: String,
    #[serde(rename = "templateID")]
    pub template_id: u32,
    #[serde(rename = "startTime")]
    pub start_time: String,
    #[serde(rename = "endTime")]
    pub end_time: String,
    #[serde(default)]
    pub log: Vec<String>,
    pub error: String,
    #[serde(rename = "fileMetadata")]
    pub file: FileMetadata,
}

/// Malware sample file information.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub filename: String,
    pub extension: String,
    pub mimetype: String,
    pub size: u64,
    #[serde(rename = "lastModified")]
    pub last_modified: String,
    #[serde(rename = "md5sum")]
    pub md5_sum: String,
    #[serde(rename = "sha1sum")]
    pub sha1_sum: String,
    #[serde(rename = "sha256sum")]
    pub sha256_sum: String,
}

/// Events recorded by the in-guest driver, one array per log file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessMetadata {
    #[serde(default)]
    pub reg: Vec<RegistryEvent>,
    #[serde(default)]
    pub fs: Vec<FileSystemEvent>,
    #[serde(default)]
    pub load: Vec<ImageLoadEvent>,
    #[serde(default)]
    pub proc: Vec<ProcessEvent>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryEvent {
    pub date: String,
    pub time: String,
    #[serde(rename = "info type")]
    pub info_type: String,
    #[serde(rename = "registry operation")]
    pub operation: String,
    pub name: String,
    #[serde(rename = "data type")]
    pub data_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileSystemEvent {
    pub date: String,
    pub time: String,
    #[serde(rename = "info type")]
    pub info_type: String,
    #[serde(rename = "mjFunc")]
    pub major_function: String,
    pub pid: String,
    pub tid: String,
    pub sid: String,
    #[serde(rename = "token type")]
    pub token_type: String,
    #[serde(default)]
    pub privileges: Vec<Privilege>,
    #[serde(rename = "elevation status")]
    pub elevation_status: String,
    #[serde(rename = "image name")]
    pub image_name: String,
    pub path: String,
    #[serde(rename = "fileName")]
    pub file_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageLoadEvent {
    pub date: String,
    pub time: String,
    #[serde(rename = "info type")]
    pub info_type: String,
    pub pid: String,
    #[serde(rename = "full image name")]
    pub full_image_name: String,
    #[serde(rename = "filename")]
    pub file_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessEvent {
    pub date: String,
    pub time: String,
    #[serde(rename = "info type")]
    pub info_type: String,
    pub ppid: String,
    pub pid: String,
    pub operation: String,
    #[serde(rename = "token type")]
    pub token_type: String,
    #[serde(default)]
    pub privileges: Vec<Privilege>,
    #[serde(rename = "elevation status")]
    pub elevation_status: String,
    #[serde(rename = "parent name")]
    pub parent_name: String,
    #[serde(rename = "child name")]
    pub child_name: String,
}

/// Windows privilege held by the token that triggered an event. Kept as an
/// ordered name/value list: the privilege set is open-ended and its order is
/// part of the record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Privilege {
    pub name: String,
    pub value: String,
}

impl Report {
    /// Loads a report from disk by analysis id.
    pub fn load(id: &str) -> Result<Report, ReportError> {
        let path = Path::new(config::REPORT_PATH).join(format!("{id}.json"));
        let file = fs::File::open(path)?;
        Ok(serde_json::from_reader(file)?)
    }

    /// Persists the request metadata as `status/<id>.json`.
    pub fn save_status(&self) -> Result<(), ReportError> {
        if self.request.id.is_empty() {
            return Err(ReportError::MissingId);
        }
        let path = Path::new(config::STATUS_PATH).join(format!("{}.json", self.request.id));
        write_json(&path, &self.request)
    }

    /// Persists the full report as `reports/<id>.json`.
    pub fn save_report(&self) -> Result<(), ReportError> {
        if self.request.id.is_empty() {
            return Err(ReportError::MissingId);
        }
        let path = Path::new(config::REPORT_PATH).join(format!("{}.json", self.request.id));
        write_json(&path, self)
    }

    /// Appends a timestamped line to the report log and flushes the status
    /// file so the websocket tailer picks it up right away.
    pub fn append_log(&mut self, message: &str) {
        self.request.log.push(format_log(message));
        if let Err(e) = self.save_status() {
            log::warn!("[REPORT] failed to flush status for {}: {}", self.request.id, e);
        }
    }
}

/// Status readers poll the file by mtime; a torn write would be served as-is.
/// Writing to a sibling temp file and renaming keeps every observed version
/// complete.
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ReportError> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec(value)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn current_timestamp() -> String {
    Local::now().format(TIME_FORMAT).to_string()
}

fn format_log(message: &str) -> String {
    let now = Local::now();
    let centis = now.timestamp_subsec_millis() / 10;
    format!("[{}.{:02}] {}", now.format("%H:%M:%S"), centis, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn sample_report() -> Report {
        Report {
            request: RequestMetadata {
                status: AnalysisStatus::Running,
                id: Uuid::new_v4().to_string(),
                driver_version: "1.0.3.2".to_string(),
                template_id: 9011,
                start_time: "20-08-2024 14:18:40 -0300".to_string(),
                end_time: "20-08-2024 14:32:07 -0300".to_string(),
                log: vec!["inf0".to_string(), "inf1".to_string()],
                error: "error!".to_string(),
                file: FileMetadata {
                    filename: "malware.exe".to_string(),
                    extension: ".exe".to_string(),
                    mimetype: "application/octet-stream".to_string(),
                    size: 1234567,
                    last_modified: "12-05-2017 01:47:32 -0300".to_string(),
                    md5_sum: "8e7ac89b4b050ec9e9f8e19cb54d3ede".to_string(),
                    sha1_sum: "589a39a1fecd04ff549cb6944625ffd3137328ef".to_string(),
                    sha256_sum: "157eb7e0e4b861b9b107fe43219d39b8d1f629e6fb3d089bfedb933de11ea190"
                        .to_string(),
                },
            },
            process: ProcessMetadata {
                reg: vec![RegistryEvent {
                    date: "01".to_string(),
                    time: "02".to_string(),
                    info_type: "x".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
        }
    }

    #[test]
    fn report_round_trips_through_disk() {
        fs::create_dir_all(config::REPORT_PATH).unwrap();
        let report = sample_report();
        report.save_report().unwrap();

        let loaded = Report::load(&report.request.id).unwrap();
        assert_eq!(report, loaded);

        let path = Path::new(config::REPORT_PATH).join(format!("{}.json", report.request.id));
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn json_member_names_are_stable() {
        let report = sample_report();
        let json = serde_json::to_string(&report).unwrap();
        for name in [
            "\"requestMetadata\"",
            "\"processMetadata\"",
            "\"driverVersion\"",
            "\"templateID\"",
            "\"startTime\"",
            "\"endTime\"",
            "\"fileMetadata\"",
            "\"md5sum\"",
            "\"sha1sum\"",
            "\"sha256sum\"",
            "\"info type\"",
            "\"registry operation\"",
            "\"data type\"",
        ] {
            assert!(json.contains(name), "missing member {name} in {json}");
        }
    }

    #[test]
    fn save_without_id_is_an_error() {
        let report = Report::default();
        assert!(matches!(report.save_status(), Err(ReportError::MissingId)));
        assert!(matches!(report.save_report(), Err(ReportError::MissingId)));
    }

    #[test]
    fn append_log_keeps_insertion_order_and_flushes_status() {
        fs::create_dir_all(config::STATUS_PATH).unwrap();
        let mut report = Report::default();
        report.request.id = Uuid::new_v4().to_string();

        report.append_log("first");
        report.append_log("second");

        assert_eq!(report.request.log.len(), 2);
        assert!(report.request.log[0].ends_with("first"));
        assert!(report.request.log[1].ends_with("second"));
        assert!(report.request.log[0].starts_with('['));

        let path = Path::new(config::STATUS_PATH).join(format!("{}.json", report.request.id));
        let status: RequestMetadata =
            serde_json::from_reader(fs::File::open(&path).unwrap()).unwrap();
        assert_eq!(status.log, report.request.log);
        fs::remove_file(path).unwrap();
    }
}
