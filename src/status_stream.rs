use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use actix::prelude::*;
use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::Deserialize;

use crate::config;

// Time allowed to read the next pong message from the client.
const PONG_WAIT: Duration = Duration::from_secs(60);

// Send pings to client with this period. Must be less than PONG_WAIT.
const PING_PERIOD: Duration = Duration::from_secs(60 * 9 / 10);

// Poll the status file for changes with this period.
const FILE_PERIOD: Duration = Duration::from_secs(1);

// ── WebSocket Session Actor ──

/// Tails `status/<id>.json` and pushes the whole file to the client every
/// time its mtime advances.
pub struct StatusSession {
    path: PathBuf,
    last_mod: SystemTime,
    last_error: Option<String>,
    heartbeat: Instant,
}

impl StatusSession {
    fn new(path: PathBuf, last_mod: SystemTime) -> Self {
        StatusSession {
            path,
            last_mod,
            last_error: None,
            heartbeat: Instant::now(),
        }
    }

    fn push_if_modified(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        match read_if_modified(&self.path, self.last_mod) {
            Ok(Some((bytes, modified))) => {
                self.last_mod = modified;
                self.last_error = None;
                ctx.text(String::from_utf8_lossy(&bytes).into_owned());
            }
            Ok(None) => {
                self.last_error = None;
            }
            // Push a read error once per distinct error; the file usually
            // just does not exist yet.
            Err(e) => {
                let message = e.to_string();
                if self.last_error.as_deref() != Some(&message) {
                    ctx.text(message.clone());
                    self.last_error = Some(message);
                }
            }
        }
    }
}

impl Actor for StatusSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        ctx.run_interval(PING_PERIOD, |act, ctx| {
            if Instant::now().duration_since(act.heartbeat) > PONG_WAIT {
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
        ctx.run_interval(FILE_PERIOD, |act, ctx| act.push_if_modified(ctx));
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for StatusSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(data)) => {
                self.heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Err(_) => ctx.stop(),
            _ => (),
        }
    }
}

/// Reads the file when its mtime has advanced past `last_mod`.
fn read_if_modified(
    path: &Path,
    last_mod: SystemTime,
) -> io::Result<Option<(Vec<u8>, SystemTime)>> {
    let modified = fs::metadata(path)?.modified()?;
    if modified <= last_mod {
        return Ok(None);
    }
    let bytes = fs::read(path)?;
    Ok(Some((bytes, modified)))
}

// ── HTTP Upgrade Endpoint ──

#[derive(Deserialize)]
pub struct StatusQuery {
    /// Initial mtime as hex nanoseconds since the epoch; lets a
    /// reconnecting client skip content it already has.
    #[serde(rename = "lastMod")]
    last_mod: Option<String>,
}

pub async fn ws_status_route(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<String>,
    query: web::Query<StatusQuery>,
) -> Result<HttpResponse, Error> {
    let id = path.into_inner();
    let status_path = Path::new(config::STATUS_PATH).join(format!("{id}.json"));

    let last_mod = query
        .last_mod
        .as_deref()
        .and_then(|s| u64::from_str_radix(s, 16).ok())
        .map(|n| UNIX_EPOCH + Duration::from_nanos(n))
        .unwrap_or(UNIX_EPOCH);

    ws::start(StatusSession::new(status_path, last_mod), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn unchanged_file_is_not_reread() {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(b"{\"status\":\"Running\"}").unwrap();
        tmp.flush().unwrap();

        let first = read_if_modified(tmp.path(), UNIX_EPOCH).unwrap();
        let (bytes, modified) = first.expect("fresh file should be read");
        assert_eq!(bytes, b"{\"status\":\"Running\"}");

        let second = read_if_modified(tmp.path(), modified).unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn missing_file_is_an_error() {
        let missing = Path::new("status").join("does-not-exist.json");
        assert!(read_if_modified(&missing, UNIX_EPOCH).is_err());
    }
}
