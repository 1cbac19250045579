//! Parser for the four text logs produced by the in-guest driver.
//!
//! Each file is a stream of `<log>...</log>` records with no root element
//! and whatever separator the driver left behind at the end, so the raw
//! stream is not a well-formed document. The parser normalises Windows
//! paths, wraps the stream in the root element the file is known by, and
//! deserialises the result in source order.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;

use crate::report::{
    FileSystemEvent, ImageLoadEvent, Privilege, ProcessEvent, RegistryEvent,
};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed driver log: {0}")]
    Malformed(#[from] quick_xml::DeError),
}

pub fn parse_registry_log(content: &str) -> Result<Vec<RegistryEvent>, ParseError> {
    let raw: RawRegistryLog = parse_log("registry", content)?;
    Ok(raw.records.into_iter().map(RegistryEvent::from).collect())
}

pub fn parse_file_system_log(content: &str) -> Result<Vec<FileSystemEvent>, ParseError> {
    let raw: RawFileSystemLog = parse_log("file_system", content)?;
    Ok(raw.records.into_iter().map(FileSystemEvent::from).collect())
}

pub fn parse_image_load_log(content: &str) -> Result<Vec<ImageLoadEvent>, ParseError> {
    let raw: RawImageLoadLog = parse_log("load_image", content)?;
    Ok(raw.records.into_iter().map(ImageLoadEvent::from).collect())
}

pub fn parse_process_log(content: &str) -> Result<Vec<ProcessEvent>, ParseError> {
    let raw: RawProcessLog = parse_log("process", content)?;
    Ok(raw.records.into_iter().map(ProcessEvent::from).collect())
}

/// An empty file is a legal "nothing happened" log, not an error.
fn parse_log<T: DeserializeOwned + Default>(root: &str, content: &str) -> Result<T, ParseError> {
    if content.trim().is_empty() {
        return Ok(T::default());
    }
    let document = enclose(root, &content.replace('\\', "/"));
    Ok(quick_xml::de::from_str(&document)?)
}

/// Turns the record stream into one parseable document: drops the trailing
/// separator junk after the last closed tag and adds the root envelope
/// (only the missing half, if the driver already opened it).
fn enclose(root: &str, content: &str) -> String {
    let body = match content.rfind('>') {
        Some(i) => &content[..=i],
        None => content,
    };
    let open = format!("<{root}>");
    if body.trim_start().starts_with(&open) {
        format!("{body}</{root}>")
    } else {
        format!("{open}{body}</{root}>")
    }
}

// Raw record shapes as the driver writes them. Every field is optional;
// unknown tags are skipped.

#[derive(Debug, Default, Deserialize)]
struct RawRegistryLog {
    #[serde(default, rename = "log")]
    records: Vec<RawRegistryRecord>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRegistryRecord {
    #[serde(default)]
    date: String,
    #[serde(default)]
    time: String,
    #[serde(default)]
    info_type: String,
    #[serde(default)]
    registry_operation: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    data_type: String,
    #[serde(default)]
    data: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawFileSystemLog {
    #[serde(default, rename = "log")]
    records: Vec<RawFileSystemRecord>,
}

#[derive(Debug, Default, Deserialize)]
struct RawFileSystemRecord {
    #[serde(default)]
    date: String,
    #[serde(default)]
    time: String,
    #[serde(default)]
    info_type: String,
    #[serde(default)]
    mj_func: String,
    #[serde(default)]
    pid: String,
    #[serde(default)]
    tid: String,
    #[serde(default)]
    sid: String,
    #[serde(default)]
    token_type: String,
    #[serde(default)]
    privileges: RawPrivileges,
    #[serde(default)]
    elevation_status: String,
    #[serde(default)]
    image_name: String,
    #[serde(default)]
    path: String,
    #[serde(default)]
    file_name: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawImageLoadLog {
    #[serde(default, rename = "log")]
    records: Vec<RawImageLoadRecord>,
}

#[derive(Debug, Default, Deserialize)]
struct RawImageLoadRecord {
    #[serde(default)]
    date: String,
    #[serde(default)]
    time: String,
    #[serde(default)]
    info_type: String,
    #[serde(default)]
    pid: String,
    #[serde(default)]
    full_image_name: String,
    #[serde(default)]
    file_name: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawProcessLog {
    #[serde(default, rename = "log")]
    records: Vec<RawProcessRecord>,
}

#[derive(Debug, Default, Deserialize)]
struct RawProcessRecord {
    #[serde(default)]
    date: String,
    #[serde(default)]
    time: String,
    #[serde(default)]
    info_type: String,
    #[serde(default)]
    ppid: String,
    #[serde(default)]
    pid: String,
    #[serde(default)]
    operation: String,
    #[serde(default)]
    token_type: String,
    #[serde(default)]
    privileges: RawPrivileges,
    #[serde(default)]
    elevation_status: String,
    #[serde(default)]
    parent_name: String,
    #[serde(default)]
    child_name: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawPrivileges {
    #[serde(default, rename = "privilege")]
    entries: Vec<RawPrivilege>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPrivilege {
    #[serde(default)]
    name: String,
    #[serde(default)]
    value: String,
}

impl From<RawPrivileges> for Vec<Privilege> {
    fn from(raw: RawPrivileges) -> Self {
        raw.entries
            .into_iter()
            .map(|p| Privilege {
                name: p.name,
                value: p.value,
            })
            .collect()
    }
}

impl From<RawRegistryRecord> for RegistryEvent {
    fn from(raw: RawRegistryRecord) -> Self {
        RegistryEvent {
            date: raw.date,
            time: raw.time,
            info_type: raw.info_type,
            operation: raw.registry_operation,
            name: raw.name,
            data_type: raw.data_type,
            data: raw.data,
        }
    }
}

impl From<RawFileSystemRecord> for FileSystemEvent {
    fn from(raw: RawFileSystemRecord) -> Self {
        FileSystemEvent {
            date: raw.date,
            time: raw.time,
            info_type: raw.info_type,
            major_function: raw.mj_func,
            pid: raw.pid,
            tid: raw.tid,
            sid: raw.sid,
            token_type: raw.token_type,
            privileges: raw.privileges.into(),
            elevation_status: raw.elevation_status,
            image_name: raw.image_name,
            path: raw.path,
            file_name: raw.file_name,
        }
    }
}

impl From<RawImageLoadRecord> for ImageLoadEvent {
    fn from(raw: RawImageLoadRecord) -> Self {
        ImageLoadEvent {
            date: raw.date,
            time: raw.time,
            info_type: raw.info_type,
            pid: raw.pid,
            full_image_name: raw.full_image_name,
            file_name: raw.file_name,
        }
    }
}

impl From<RawProcessRecord> for ProcessEvent {
    fn from(raw: RawProcessRecord) -> Self {
        ProcessEvent {
            date: raw.date,
            time: raw.time,
            info_type: raw.info_type,
            ppid: raw.ppid,
            pid: raw.pid,
            operation: raw.operation,
            token_type: raw.token_type,
            privileges: raw.privileges.into(),
            elevation_status: raw.elevation_status,
            parent_name: raw.parent_name,
            child_name: raw.child_name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_single_registry_record() {
        let input = "<log><date>01</date><time>02</time><info_type>x</info_type></log>";
        let events = parse_registry_log(input).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].date, "01");
        assert_eq!(events[0].time, "02");
        assert_eq!(events[0].info_type, "x");
        assert_eq!(events[0].operation, "");
        assert_eq!(events[0].name, "");
        assert_eq!(events[0].data_type, "");
        assert_eq!(events[0].data, "");
    }

    #[test]
    fn empty_input_yields_no_events() {
        assert!(parse_registry_log("").unwrap().is_empty());
        assert!(parse_file_system_log("  \n").unwrap().is_empty());
        assert!(parse_image_load_log("").unwrap().is_empty());
        assert!(parse_process_log("").unwrap().is_empty());
    }

    #[test]
    fn parsing_is_idempotent() {
        let input = "<log><date>01</date><name>HKLM/Software</name></log>\
                     <log><date>02</date><name>HKCU/Run</name></log>";
        let first = parse_registry_log(input).unwrap();
        let second = parse_registry_log(input).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].date, "01");
        assert_eq!(first[1].date, "02");
    }

    #[test]
    fn windows_paths_are_normalised() {
        let input = r"<log><name>HKLM\Software\Run</name><data>C:\evil.exe</data></log>";
        let events = parse_registry_log(input).unwrap();
        assert_eq!(events[0].name, "HKLM/Software/Run");
        assert_eq!(events[0].data, "C:/evil.exe");
    }

    #[test]
    fn trailing_separators_are_dropped() {
        let input = "<log><date>01</date></log>,\n";
        let events = parse_registry_log(input).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].date, "01");
    }

    #[test]
    fn an_already_rooted_stream_is_not_wrapped_twice() {
        let input = "<registry><log><date>01</date></log>";
        let events = parse_registry_log(input).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].date, "01");
    }

    #[test]
    fn unknown_tags_are_ignored() {
        let input = "<log><date>01</date><bogus>zzz</bogus></log>";
        let events = parse_registry_log(input).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].date, "01");
    }

    #[test]
    fn garbage_input_is_a_parse_error() {
        let input = "<log><date>01</date>";
        assert!(parse_registry_log(input).is_err());
    }

    #[test]
    fn file_system_privileges_preserve_order() {
        let input = "<log><pid>4242</pid><privileges>\
                     <privilege><name>SeDebugPrivilege</name><value>Enabled</value></privilege>\
                     <privilege><name>SeShutdownPrivilege</name><value>Disabled</value></privilege>\
                     </privileges><image_name>C:\\mal.exe</image_name></log>";
        let events = parse_file_system_log(input).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].pid, "4242");
        assert_eq!(events[0].image_name, "C:/mal.exe");
        assert_eq!(events[0].privileges.len(), 2);
        assert_eq!(events[0].privileges[0].name, "SeDebugPrivilege");
        assert_eq!(events[0].privileges[0].value, "Enabled");
        assert_eq!(events[0].privileges[1].name, "SeShutdownPrivilege");
    }

    #[test]
    fn process_records_parse() {
        let input = "<log><date>01</date><ppid>4</ppid><pid>8</pid>\
                     <operation>create</operation><parent_name>a.exe</parent_name>\
                     <child_name>b.exe</child_name></log>";
        let events = parse_process_log(input).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].ppid, "4");
        assert_eq!(events[0].pid, "8");
        assert_eq!(events[0].operation, "create");
        assert_eq!(events[0].parent_name, "a.exe");
        assert_eq!(events[0].child_name, "b.exe");
        assert!(events[0].privileges.is_empty());
    }

    #[test]
    fn image_load_records_parse() {
        let input = r"<log><pid>8</pid><full_image_name>C:\Windows\System32\ntdll.dll</full_image_name><file_name>ntdll.dll</file_name></log>";
        let events = parse_image_load_log(input).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].full_image_name, "C:/Windows/System32/ntdll.dll");
        assert_eq!(events[0].file_name, "ntdll.dll");
    }
}
