use std::net::SocketAddr;

use axum::{
    Json, Router,
    extract::{ConnectInfo, FromRequestParts, Path, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
    routing,
};
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use rearch::Container;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::{
    api,
    config::request_settings_capsule,
    url_repo::{OwnerKey, ShortId},
    url_service::{
        self, BaseAddress, DeleteUrlError, GetUrlError, PostUrlError, url_rest_service_capsule,
    },
};

/// Builds the HTTP surface. Serve it with
/// [`Router::into_make_service_with_connect_info`] so owner keys can be
/// derived from peer addresses.
pub fn router(container: Container) -> Router {
    Router::new()
        .route("/shorten", routing::post(shorten_url))
        .route("/my-urls", routing::get(list_my_urls))
        .route("/stats/{short_id}", routing::get(get_url_stats))
        .route("/urls/{short_id}", routing::delete(delete_url))
        .route("/{short_id}", routing::get(redirect_to_url))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(container)
}

fn error_response(status: StatusCode, message: impl Into<String>, err_uuid: Uuid) -> Response {
    (status, Json(api::Error::new(message, err_uuid))).into_response()
}

fn internal_error(err_uuid: Uuid) -> Response {
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "Internal server error",
        err_uuid,
    )
}

/// Derives the caller's [`OwnerKey`] from the first `X-Forwarded-For` entry
/// when that is trusted, otherwise from the TCP peer's IP (port excluded).
impl FromRequestParts<Container> for OwnerKey {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        container: &Container,
    ) -> Result<Self, Self::Rejection> {
        if let Some(client) = container
            .read(request_settings_capsule)
            .trust_forwarded_for
            .then(|| forwarded_client(&parts.headers))
            .flatten()
        {
            return Ok(Self::new(client));
        }

        match ConnectInfo::<SocketAddr>::from_request_parts(parts, container).await {
            Ok(ConnectInfo(addr)) => Ok(Self::new(addr.ip().to_canonical().to_string())),
            Err(rejection) => {
                let err_uuid = Uuid::new_v4();
                error!(?err_uuid, %rejection, "Peer address unavailable");
                Err(internal_error(err_uuid))
            }
        }
    }
}

fn forwarded_client(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")?
        .to_str()
        .ok()?
        .split(',')
        .map(str::trim)
        .find(|entry| !entry.is_empty())
        .map(str::to_owned)
}

/// Uses the configured public base URL if there is one, otherwise
/// `http://` plus the request's `Host`.
impl FromRequestParts<Container> for BaseAddress {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        container: &Container,
    ) -> Result<Self, Self::Rejection> {
        if let Some(public_base_url) = container.read(request_settings_capsule).public_base_url {
            return Ok(Self::new(public_base_url.as_str()));
        }

        parts
            .headers
            .get(header::HOST)
            .and_then(|host| host.to_str().ok())
            .or_else(|| parts.uri.authority().map(|authority| authority.as_str()))
            .map(|host| Self::new(format!("http://{host}")))
            .ok_or_else(|| {
                let err_uuid = Uuid::new_v4();
                info!(?err_uuid, "Request without a Host header");
                error_response(StatusCode::BAD_REQUEST, "Host header is required", err_uuid)
            })
    }
}

#[instrument(skip(container, payload))]
async fn shorten_url(
    State(container): State<Container>,
    owner: OwnerKey,
    base: BaseAddress,
    payload: Result<Json<api::ShortenUrlPayload>, JsonRejection>,
) -> Response {
    let url = match payload {
        Ok(Json(api::ShortenUrlPayload { url })) => url,
        Err(rejection) => {
            let err_uuid = Uuid::new_v4();
            info!(?err_uuid, %rejection, "User submitted a malformed body");
            return error_response(StatusCode::BAD_REQUEST, rejection.body_text(), err_uuid);
        }
    };

    container
        .read(url_rest_service_capsule)
        .shorten_url(url, &base, &owner)
        .await
        .map(Json)
        .map_err(|error: PostUrlError| {
            let err_uuid = Uuid::new_v4();
            match error {
                PostUrlError::MissingUrl | PostUrlError::SelfReference => {
                    info!(?err_uuid, ?error, "User submitted a bad request");
                    error_response(StatusCode::BAD_REQUEST, error.to_string(), err_uuid)
                }
                PostUrlError::Internal(_) => {
                    error!(?err_uuid, ?error, "Encountered an error during a request");
                    internal_error(err_uuid)
                }
            }
        })
        .into_response()
}

#[instrument(skip(container))]
async fn list_my_urls(
    State(container): State<Container>,
    owner: OwnerKey,
    base: BaseAddress,
) -> Response {
    container
        .read(url_rest_service_capsule)
        .list_owner_urls(&base, &owner)
        .await
        .map(Json)
        .map_err(|error| {
            let err_uuid = Uuid::new_v4();
            error!(?err_uuid, ?error, "Encountered an error during a request");
            internal_error(err_uuid)
        })
        .into_response()
}

#[instrument(skip(container))]
async fn get_url_stats(
    State(container): State<Container>,
    Path(short_id): Path<ShortId>,
) -> Response {
    container
        .read(url_rest_service_capsule)
        .get_url_stats(&short_id)
        .await
        .map(Json)
        .map_err(get_url_error_response)
        .into_response()
}

#[instrument(skip(container))]
async fn redirect_to_url(
    State(container): State<Container>,
    Path(short_id): Path<ShortId>,
) -> Response {
    let url_service::Redirect { url } = match container
        .read(url_rest_service_capsule)
        .visit_url(&short_id)
        .await
    {
        Ok(redirect) => redirect,
        Err(error) => return get_url_error_response(error),
    };

    match HeaderValue::try_from(location_for(&url)) {
        Ok(location) => (StatusCode::FOUND, [(header::LOCATION, location)]).into_response(),
        Err(error) => {
            let err_uuid = Uuid::new_v4();
            error!(?err_uuid, ?error, "Stored URL is not a valid Location header");
            internal_error(err_uuid)
        }
    }
}

/// Characters escaped in a `Location` header. Everything outside printable
/// ASCII is escaped too. Existing `%` escapes are left alone.
const LOCATION_ENCODE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'{')
    .add(b'}');

fn location_for(url: &str) -> String {
    utf8_percent_encode(url, LOCATION_ENCODE).to_string()
}

fn get_url_error_response(error: GetUrlError) -> Response {
    let err_uuid = Uuid::new_v4();
    match error {
        GetUrlError::NotFound => {
            info!(?err_uuid, "Requested URL does not exist");
            error_response(StatusCode::NOT_FOUND, error.to_string(), err_uuid)
        }
        GetUrlError::Internal(_) => {
            error!(?err_uuid, ?error, "Encountered an error during a request");
            internal_error(err_uuid)
        }
    }
}

#[instrument(skip(container))]
async fn delete_url(
    State(container): State<Container>,
    owner: OwnerKey,
    Path(short_id): Path<ShortId>,
) -> Response {
    container
        .read(url_rest_service_capsule)
        .delete_url(&short_id, &owner)
        .await
        .map(|()| {
            Json(api::Message {
                message: "URL deleted successfully".to_owned(),
            })
        })
        .map_err(|error: DeleteUrlError| {
            let err_uuid = Uuid::new_v4();
            match error {
                DeleteUrlError::NotFound => {
                    info!(?err_uuid, "Requested URL does not exist");
                    error_response(StatusCode::NOT_FOUND, error.to_string(), err_uuid)
                }
                DeleteUrlError::NotOwner => {
                    info!(?err_uuid, ?owner, "Caller does not own the URL");
                    error_response(StatusCode::FORBIDDEN, error.to_string(), err_uuid)
                }
                DeleteUrlError::Internal(_) => {
                    error!(?err_uuid, ?error, "Encountered an error during a request");
                    internal_error(err_uuid)
                }
            }
        })
        .into_response()
}
