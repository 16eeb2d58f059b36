use std::sync::Arc;

use poem::http::{HeaderValue, StatusCode};
use poem::web::{Data, Path};
use poem::{Endpoint, EndpointExt, IntoResponse, Request, Response, Route, handler};
use tracing::warn;

use crate::acme::engine::{Engine, Reply, ReplyBody};
use crate::acme::transport::{self, VerifiedRequest};
use crate::problem::Problem;
use crate::store::ObjectKind;

const REPLAY_NONCE: &str = "replay-nonce";
const CONTENT_TYPE_PKIX_CERT: &str = "application/pkix-cert";

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        let mut builder = Response::builder().status(self.status);
        if let Some(location) = self.location {
            builder = builder.header("Location", location);
        }
        if let Some(link) = self.link {
            builder = builder.header("Link", link);
        }
        match self.body {
            ReplyBody::Json(value) => builder
                .content_type("application/json")
                .body(value.to_string()),
            ReplyBody::Der(bytes) => builder.content_type(CONTENT_TYPE_PKIX_CERT).body(bytes),
            ReplyBody::Empty => builder.body(()),
        }
    }
}

/// Attaches a fresh single-use nonce; every response carries one.
async fn stamp_nonce(engine: &Engine, mut response: Response) -> Response {
    let nonce = engine.nonces().issue().await;
    match HeaderValue::from_str(&nonce) {
        Ok(value) => {
            response.headers_mut().insert(REPLAY_NONCE, value);
        }
        Err(err) => warn!("replay nonce is not header-safe: {err}"),
    }
    response
}

async fn respond(engine: &Engine, result: Result<Reply, Problem>) -> Response {
    let response = match result {
        Ok(reply) => reply.into_response(),
        Err(problem) => problem.into_response(),
    };
    stamp_nonce(engine, response).await
}

/// Runs the authenticated-transport checks for a POST body against the
/// request's effective URL.
async fn verified(
    engine: &Engine,
    req: &Request,
    body: &[u8],
) -> Result<VerifiedRequest, Problem> {
    let effective_url = engine.urls().request(req.original_uri().path());
    transport::verify_request(
        body,
        &effective_url,
        engine.version(),
        engine.nonces(),
        engine.store(),
        engine.urls(),
    )
    .await
}

#[handler]
async fn directory(Data(engine): Data<&Arc<Engine>>) -> Response {
    respond(engine, Ok(Reply::json(StatusCode::OK, engine.directory()))).await
}

#[handler]
async fn new_nonce_get(Data(engine): Data<&Arc<Engine>>) -> Response {
    let response = Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header("Cache-Control", "no-store")
        .body(());
    stamp_nonce(engine, response).await
}

#[handler]
async fn new_nonce_head(Data(engine): Data<&Arc<Engine>>) -> Response {
    let response = Response::builder()
        .status(StatusCode::OK)
        .header("Cache-Control", "no-store")
        .body(());
    stamp_nonce(engine, response).await
}

#[handler]
async fn new_registration(
    req: &Request,
    body: Vec<u8>,
    Data(engine): Data<&Arc<Engine>>,
) -> Response {
    let result = match verified(engine, req, &body).await {
        Ok(request) => engine.new_registration(&request).await,
        Err(problem) => Err(problem),
    };
    respond(engine, result).await
}

#[handler]
async fn update_registration(
    req: &Request,
    Path(id): Path<String>,
    body: Vec<u8>,
    Data(engine): Data<&Arc<Engine>>,
) -> Response {
    let result = match verified(engine, req, &body).await {
        Ok(request) => engine.update_registration(&request, &id).await,
        Err(problem) => Err(problem),
    };
    respond(engine, result).await
}

#[handler]
async fn new_order(req: &Request, body: Vec<u8>, Data(engine): Data<&Arc<Engine>>) -> Response {
    let result = match verified(engine, req, &body).await {
        Ok(request) => engine.new_order(&request).await,
        Err(problem) => Err(problem),
    };
    respond(engine, result).await
}

#[handler]
async fn new_authorization(
    req: &Request,
    body: Vec<u8>,
    Data(engine): Data<&Arc<Engine>>,
) -> Response {
    let result = match verified(engine, req, &body).await {
        Ok(request) => engine.new_authorization(&request).await,
        Err(problem) => Err(problem),
    };
    respond(engine, result).await
}

#[handler]
async fn order(
    req: &Request,
    Path(id): Path<String>,
    body: Vec<u8>,
    Data(engine): Data<&Arc<Engine>>,
) -> Response {
    let result = match verified(engine, req, &body).await {
        Ok(_) => engine.order(&id).await,
        Err(problem) => Err(problem),
    };
    respond(engine, result).await
}

#[handler]
async fn finalize(
    req: &Request,
    Path(id): Path<String>,
    body: Vec<u8>,
    Data(engine): Data<&Arc<Engine>>,
) -> Response {
    let result = match verified(engine, req, &body).await {
        Ok(request) => engine.finalize(&request, &id).await,
        Err(problem) => Err(problem),
    };
    respond(engine, result).await
}

#[handler]
async fn authorization(
    req: &Request,
    Path(id): Path<String>,
    body: Vec<u8>,
    Data(engine): Data<&Arc<Engine>>,
) -> Response {
    let result = match verified(engine, req, &body).await {
        Ok(request) => engine.authorization(&request, &id).await,
        Err(problem) => Err(problem),
    };
    respond(engine, result).await
}

#[handler]
async fn update_challenge(
    req: &Request,
    Path((id, index)): Path<(String, String)>,
    body: Vec<u8>,
    Data(engine): Data<&Arc<Engine>>,
) -> Response {
    let result = match verified(engine, req, &body).await {
        Ok(request) => engine.update_challenge(&request, &id, &index).await,
        Err(problem) => Err(problem),
    };
    respond(engine, result).await
}

#[handler]
async fn certificate(
    req: &Request,
    Path(id): Path<String>,
    body: Vec<u8>,
    Data(engine): Data<&Arc<Engine>>,
) -> Response {
    let result = match verified(engine, req, &body).await {
        Ok(request) => engine.certificate(&request, &id).await,
        Err(problem) => Err(problem),
    };
    respond(engine, result).await
}

#[handler]
async fn fetch_registration(Path(id): Path<String>, Data(engine): Data<&Arc<Engine>>) -> Response {
    respond(engine, engine.fetch(ObjectKind::Registration, &id).await).await
}

#[handler]
async fn fetch_order(Path(id): Path<String>, Data(engine): Data<&Arc<Engine>>) -> Response {
    respond(engine, engine.fetch(ObjectKind::Order, &id).await).await
}

#[handler]
async fn fetch_authorization(
    Path(id): Path<String>,
    Data(engine): Data<&Arc<Engine>>,
) -> Response {
    respond(engine, engine.fetch(ObjectKind::Authorization, &id).await).await
}

#[handler]
async fn fetch_certificate(Path(id): Path<String>, Data(engine): Data<&Arc<Engine>>) -> Response {
    respond(engine, engine.fetch(ObjectKind::Certificate, &id).await).await
}

#[handler]
async fn fetch_challenge(
    Path((id, index)): Path<(String, String)>,
    Data(engine): Data<&Arc<Engine>>,
) -> Response {
    respond(engine, engine.fetch_challenge(&id, &index).await).await
}

/// The full ACME route table, rooted under the configured base path.
pub fn routes(engine: Arc<Engine>) -> impl Endpoint<Output = Response> {
    let api = Route::new()
        .at("/directory", poem::get(directory))
        .at("/new-nonce", poem::get(new_nonce_get).head(new_nonce_head))
        .at("/new-acct", poem::post(new_registration))
        .at("/new-reg", poem::post(new_registration))
        .at("/new-app", poem::post(new_order))
        .at("/new-order", poem::post(new_order))
        .at("/new-authz", poem::post(new_authorization))
        .at(
            "/reg/:id",
            poem::get(fetch_registration).post(update_registration),
        )
        .at("/app/:id", poem::get(fetch_order).post(order))
        .at("/app/:id/finalize", poem::post(finalize))
        .at(
            "/authz/:id",
            poem::get(fetch_authorization).post(authorization),
        )
        .at(
            "/authz/:id/:index",
            poem::get(fetch_challenge).post(update_challenge),
        )
        .at("/cert/:id", poem::get(fetch_certificate).post(certificate));

    let prefix = engine.urls().path_prefix().to_string();
    let root = if prefix.is_empty() {
        api
    } else {
        Route::new().nest(&prefix, api)
    };
    root.data(engine)
}
