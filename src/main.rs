use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use actix_cors::Cors;
use actix_multipart::Multipart;
use actix_web::{get, middleware, post, web, App, HttpResponse, HttpServer, Responder};
use clap::Parser;
use dotenv::dotenv;
use futures::TryStreamExt;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

mod analysis;
mod config;
mod environment;
mod parser;
mod proxmox;
mod queue;
mod remote;
mod report;
mod sample;
mod status_stream;

use config::{Config, ProxmoxConfig};
use queue::{AnalysisQueue, Job};
use report::{Report, ReportError};

const KNOWN_TEMPLATES: &[&str] = &["9011"];

#[get("/v1/healthcheck")]
async fn healthcheck(cfg: web::Data<Config>) -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "available",
        "system_info": {
            "environment": cfg.env,
            "version": config::VERSION,
        }
    }))
}

#[post("/v1/analysis")]
async fn start_analysis(
    queue: web::Data<AnalysisQueue>,
    mut payload: Multipart,
) -> Result<HttpResponse, actix_web::Error> {
    let mut template_value = String::new();
    let mut original_filename = String::new();
    let mut temp_path: Option<PathBuf> = None;

    // Iterate over multipart stream. The file is spooled into a temp name
    // inside the sample dir and only promoted once validation passes.
    while let Ok(Some(mut field)) = TryStreamExt::try_next(&mut payload).await {
        let content_disposition = field.content_disposition();
        let field_name = content_disposition
            .as_ref()
            .and_then(|cd| cd.get_name())
            .unwrap_or("")
            .to_string();
        let filename = content_disposition
            .as_ref()
            .and_then(|cd| cd.get_filename())
            .map(|name| name.to_string());

        if field_name == "file" {
            if let Some(name) = filename {
                // Strip directory traversal characters; the name is recorded
                // in the report and used to derive the extension.
                original_filename = name.replace("..", "").replace(['/', '\\'], "");
            }

            let _ = fs::create_dir_all(config::SAMPLE_PATH);
            let path = Path::new(config::SAMPLE_PATH).join(format!(".upload-{}", Uuid::new_v4()));
            let mut file = tokio::fs::File::create(&path)
                .await
                .map_err(actix_web::error::ErrorInternalServerError)?;
            while let Ok(Some(chunk)) = TryStreamExt::try_next(&mut field).await {
                file.write_all(&chunk)
                    .await
                    .map_err(actix_web::error::ErrorInternalServerError)?;
            }
            file.flush()
                .await
                .map_err(actix_web::error::ErrorInternalServerError)?;
            temp_path = Some(path);
        } else if field_name == "template" {
            let mut value_bytes = Vec::new();
            while let Ok(Some(chunk)) = TryStreamExt::try_next(&mut field).await {
                value_bytes.extend_from_slice(&chunk);
            }
            if let Ok(value) = String::from_utf8(value_bytes) {
                template_value = value.trim().to_string();
            }
        }
    }

    let validation_error = if template_value.is_empty() {
        Some("must be provided")
    } else if !KNOWN_TEMPLATES.contains(&template_value.as_str()) {
        Some("must be 9011")
    } else {
        None
    };
    if let Some(message) = validation_error {
        if let Some(path) = temp_path {
            let _ = fs::remove_file(path);
        }
        return Ok(HttpResponse::UnprocessableEntity()
            .json(serde_json::json!({ "error": { "template": message } })));
    }

    let Some(temp_path) = temp_path else {
        return Ok(HttpResponse::BadRequest()
            .json(serde_json::json!({ "error": "file must be provided" })));
    };

    let template: u32 = template_value
        .parse()
        .map_err(actix_web::error::ErrorInternalServerError)?;
    let id = Uuid::new_v4().to_string();
    let extension = sample::extension_of(&original_filename);
    let sample_path = Path::new(config::SAMPLE_PATH).join(format!("{id}{extension}"));
    fs::rename(&temp_path, &sample_path).map_err(actix_web::error::ErrorInternalServerError)?;

    log::info!("[INTAKE] accepted analysis {id} (template {template}, {original_filename})");

    let job = Job {
        id: id.clone(),
        template,
        filename: original_filename,
        extension,
        sample_path,
    };
    if let Err(e) = queue.enqueue(job).await {
        return Ok(
            HttpResponse::InternalServerError().json(serde_json::json!({ "error": e.to_string() }))
        );
    }

    Ok(HttpResponse::Created().json(serde_json::json!({ "id": id })))
}

#[get("/v1/report/{id}")]
async fn get_report(path: web::Path<String>) -> impl Responder {
    let id = path.into_inner();
    match Report::load(&id) {
        Ok(report) => HttpResponse::Ok().json(serde_json::json!({ "analysis": report })),
        Err(ReportError::Io(e)) if e.kind() == ErrorKind::NotFound => HttpResponse::NotFound()
            .json(serde_json::json!({ "error": "the requested resource could not be found" })),
        Err(e) => {
            HttpResponse::InternalServerError().json(serde_json::json!({ "error": e.to_string() }))
        }
    }
}

fn create_essential_dirs() -> std::io::Result<()> {
    for dir in [
        config::SAMPLE_PATH,
        config::REPORT_PATH,
        config::STATUS_PATH,
        config::LOG_PATH,
    ] {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    env_logger::init();

    let cfg = Config::parse();
    create_essential_dirs()?;

    let proxmox_cfg = ProxmoxConfig::from_env();
    let client =
        proxmox::ProxmoxClient::new(&proxmox_cfg.url, &proxmox_cfg.token_id, &proxmox_cfg.token_secret)
            .expect("failed to build proxmox client");

    let queue = web::Data::new(AnalysisQueue::start(client, proxmox_cfg.node.clone(), &cfg));
    let cfg_data = web::Data::new(cfg.clone());

    log::info!(
        "[MAIN] starting amaterasu-api on 0.0.0.0:{} ({})",
        cfg.port,
        cfg.env
    );

    HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .app_data(queue.clone())
            .app_data(cfg_data.clone())
            .service(healthcheck)
            .service(start_analysis)
            .service(get_report)
            .route("/v1/status/{id}", web::get().to(status_stream::ws_status_route))
    })
    .bind(("0.0.0.0", cfg.port))?
    .run()
    .await
}
