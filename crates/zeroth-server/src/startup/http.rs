//! HTTP server setup for the internal RPC endpoint.
//!
//! Every verb is served at `POST /internal/v1/rpc/{verb}` and dispatched to
//! the handler registry of the node's messaging service. Unknown or
//! unregistered verbs answer 404, handler failures answer 500 with the error
//! text; the sending side turns both into remote errors.

use std::sync::Arc;

use actix_web::{
    App, HttpResponse, HttpServer, Scope, dev::Server, http::header::ContentType,
    middleware::Logger, web,
};
use tracing::debug;
use zeroth_api::{MessagingService, RPC_PATH_PREFIX, Verb};

/// Routes of the internal RPC endpoint
pub fn rpc_scope() -> Scope {
    web::scope(RPC_PATH_PREFIX).route("/{verb}", web::post().to(dispatch_rpc))
}

async fn dispatch_rpc(
    messaging: web::Data<dyn MessagingService>,
    verb: web::Path<String>,
    body: web::Bytes,
) -> HttpResponse {
    let Ok(parsed) = verb.parse::<Verb>() else {
        return HttpResponse::NotFound().body(format!("unknown verb {}", verb.as_str()));
    };

    let handlers = messaging.handlers();
    if !handlers.is_registered(parsed) {
        return HttpResponse::NotFound().body(format!("no handler registered for verb {}", parsed));
    }

    match handlers.dispatch(parsed, body.to_vec()).await {
        Ok(reply) => HttpResponse::Ok()
            .content_type(ContentType::json())
            .body(reply),
        Err(e) => {
            debug!("{} handler failed: {:#}", parsed, e);
            HttpResponse::InternalServerError().body(e.to_string())
        }
    }
}

/// Creates and binds the RPC server.
pub fn rpc_server(
    messaging: Arc<dyn MessagingService>,
    address: String,
    port: u16,
) -> Result<Server, std::io::Error> {
    Ok(HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .app_data(web::Data::from(messaging.clone()))
            .service(rpc_scope())
    })
    .bind((address, port))?
    .run())
}
