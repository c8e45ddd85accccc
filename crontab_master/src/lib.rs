//! ABOUTME: Master HTTP admin surface for mutating the job catalog
//! ABOUTME: POST /job/save, /job/delete, /job/kill and GET /job/job-list

mod job_manager;

pub use job_manager::JobManager;

use actix_web::{
    dev::{ServiceRequest, ServiceResponse},
    middleware::Logger,
    web, App, HttpResponse, HttpServer,
};
use crontab_core::Result as CrontabResult;
use crontab_protocol::{Job, Response};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct SaveForm {
    job: String,
}

#[derive(Debug, Deserialize)]
struct NameForm {
    name: String,
}

async fn handle_job_save(state: web::Data<JobManager>, form: web::Form<SaveForm>) -> HttpResponse {
    let job: Job = match serde_json::from_str(&form.job) {
        Ok(job) => job,
        Err(e) => return HttpResponse::Ok().json(Response::error(-1, e.to_string())),
    };

    match state.save_job(job).await {
        Ok(previous) => {
            let data = previous.map(|j| serde_json::to_value(j).unwrap_or(serde_json::Value::Null));
            HttpResponse::Ok().json(Response::ok(data.unwrap_or(serde_json::Value::Null)))
        }
        Err(e) => HttpResponse::Ok().json(Response::error(-1, e.to_string())),
    }
}

async fn handle_job_delete(state: web::Data<JobManager>, form: web::Form<NameForm>) -> HttpResponse {
    match state.delete_job(&form.name).await {
        Ok(previous) => {
            let data = previous.map(|j| serde_json::to_value(j).unwrap_or(serde_json::Value::Null));
            HttpResponse::Ok().json(Response::ok(data.unwrap_or(serde_json::Value::Null)))
        }
        Err(e) => HttpResponse::Ok().json(Response::error(-1, e.to_string())),
    }
}

async fn handle_job_list(state: web::Data<JobManager>) -> HttpResponse {
    match state.list_jobs().await {
        Ok(jobs) => HttpResponse::Ok().json(Response::ok(
            serde_json::to_value(jobs).unwrap_or(serde_json::Value::Null),
        )),
        Err(e) => HttpResponse::Ok().json(Response::error(-1, e.to_string())),
    }
}

async fn handle_job_kill(state: web::Data<JobManager>, form: web::Form<NameForm>) -> HttpResponse {
    match state.kill_job(&form.name).await {
        Ok(()) => HttpResponse::Ok().json(Response::ok(serde_json::Value::Null)),
        Err(e) => HttpResponse::Ok().json(Response::error(-1, e.to_string())),
    }
}

/// Build the admin service factory, ready to be mounted by an `HttpServer`.
pub fn create_service(
    state: JobManager,
) -> App<
    impl actix_web::dev::ServiceFactory<
        ServiceRequest,
        Config = (),
        Response = ServiceResponse<impl actix_web::body::MessageBody>,
        Error = actix_web::Error,
        InitError = (),
    >,
> {
    App::new()
        .app_data(web::Data::new(state))
        .wrap(Logger::default())
        .service(
            web::scope("/job")
                .route("/save", web::post().to(handle_job_save))
                .route("/delete", web::post().to(handle_job_delete))
                .route("/job-list", web::get().to(handle_job_list))
                .route("/kill", web::post().to(handle_job_kill)),
        )
}

/// Start the admin HTTP server, blocking until it shuts down.
pub async fn start_server(bind_addr: &str, state: JobManager) -> CrontabResult<()> {
    tracing::info!("starting admin server on {}", bind_addr);

    HttpServer::new(move || create_service(state.clone()))
        .bind(bind_addr)
        .map_err(|e| crontab_core::Error::Config(format!("failed to bind admin server: {e}")))?
        .run()
        .await
        .map_err(|e| crontab_core::Error::Config(format!("admin server error: {e}")))?;

    Ok(())
}

// Handler behavior against a live catalog needs a running etcd endpoint;
// the form/response envelope shapes are covered by crontab_protocol's tests,
// and the routing itself is exercised the same way as crontab_obs's service.
