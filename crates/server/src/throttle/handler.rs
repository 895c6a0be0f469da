//! Handlers deciding what happens to accepted and rejected requests.

use std::sync::Arc;

use axum::{body::Body, response::IntoResponse};
use http::{Response, StatusCode, request::Parts};

use ::throttle::ClientKey;

/// Body of the default rejection response.
pub const BUSY_MESSAGE: &str = "Server is busy at the moment, try again.";

/// What to do with an accepted request.
pub enum Proceed {
    /// Pass the request on to the next service.
    Continue,
    /// Answer the request without passing it on.
    Respond(Response<Body>),
}

/// Invoked for every request the throttle accepts.
///
/// Implemented for closures `Fn(&ClientKey, &Parts) -> Proceed`.
pub trait AcceptHandler: Send + Sync + 'static {
    /// Decide how an accepted request from `client` proceeds.
    fn on_accept(&self, client: &ClientKey, request: &Parts) -> Proceed;
}

/// Invoked for every request the throttle rejects. The returned response is sent to the
/// client and the request goes no further.
///
/// Implemented for closures `Fn(&ClientKey, &Parts) -> Response<Body>`.
pub trait RejectHandler: Send + Sync + 'static {
    /// Build the response for a rejected request from `client`.
    fn on_reject(&self, client: &ClientKey, request: &Parts) -> Response<Body>;
}

impl<F> AcceptHandler for F
where
    F: Fn(&ClientKey, &Parts) -> Proceed + Send + Sync + 'static,
{
    fn on_accept(&self, client: &ClientKey, request: &Parts) -> Proceed {
        self(client, request)
    }
}

impl<F> RejectHandler for F
where
    F: Fn(&ClientKey, &Parts) -> Response<Body> + Send + Sync + 'static,
{
    fn on_reject(&self, client: &ClientKey, request: &Parts) -> Response<Body> {
        self(client, request)
    }
}

/// Default accept handler: the request continues unmodified.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl AcceptHandler for PassThrough {
    fn on_accept(&self, _: &ClientKey, _: &Parts) -> Proceed {
        Proceed::Continue
    }
}

/// Default reject handler: `503 Service Unavailable` with a plain-text [`BUSY_MESSAGE`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceBusy;

impl RejectHandler for ServiceBusy {
    fn on_reject(&self, _: &ClientKey, _: &Parts) -> Response<Body> {
        (StatusCode::SERVICE_UNAVAILABLE, BUSY_MESSAGE).into_response()
    }
}

/// The pair of handlers a throttle layer dispatches to.
#[derive(Clone)]
pub(crate) struct Handlers {
    pub(crate) on_accept: Arc<dyn AcceptHandler>,
    pub(crate) on_reject: Arc<dyn RejectHandler>,
}

impl Default for Handlers {
    fn default() -> Self {
        Self {
            on_accept: Arc::new(PassThrough),
            on_reject: Arc::new(ServiceBusy),
        }
    }
}
