//! Throttling middleware for HTTP requests.

mod client_key;
mod handler;

use std::{
    fmt::Display,
    future::Future,
    pin::Pin,
    sync::{Arc, PoisonError, RwLock},
    task::{Context, Poll},
};

use ::throttle::{CounterStore, Decision, Storage, Throttle, ThrottleError};
use axum::body::Body;
use config::ThrottleConfigUpdate;
use http::{Request, Response};
use tower::Layer;

pub use handler::{AcceptHandler, BUSY_MESSAGE, PassThrough, Proceed, RejectHandler, ServiceBusy};

use handler::Handlers;

/// Partial reconfiguration of a [`ThrottleLayer`]. Anything left unset keeps its value.
#[derive(Default)]
pub struct ThrottleUpdate {
    limits: ThrottleConfigUpdate,
    on_accept: Option<Arc<dyn AcceptHandler>>,
    on_reject: Option<Arc<dyn RejectHandler>>,
}

impl ThrottleUpdate {
    /// Change limits, window length, store error policy or counting mode.
    pub fn limits(mut self, limits: ThrottleConfigUpdate) -> Self {
        self.limits = limits;
        self
    }

    /// Replace the accept handler.
    pub fn on_accept(mut self, handler: impl AcceptHandler) -> Self {
        self.on_accept = Some(Arc::new(handler));
        self
    }

    /// Replace the reject handler.
    pub fn on_reject(mut self, handler: impl RejectHandler) -> Self {
        self.on_reject = Some(Arc::new(handler));
        self
    }
}

impl From<ThrottleConfigUpdate> for ThrottleUpdate {
    fn from(limits: ThrottleConfigUpdate) -> Self {
        Self::default().limits(limits)
    }
}

/// Tower layer deciding for each request whether it may reach the wrapped service.
///
/// Clones share the throttle and the handlers, so [`ThrottleLayer::configure`] on any clone
/// affects every router the layer was applied to.
pub struct ThrottleLayer<S = Storage> {
    throttle: Arc<Throttle<S>>,
    handlers: Arc<RwLock<Handlers>>,
    trust_forwarded_headers: bool,
}

impl<S> Clone for ThrottleLayer<S> {
    fn clone(&self) -> Self {
        Self {
            throttle: self.throttle.clone(),
            handlers: self.handlers.clone(),
            trust_forwarded_headers: self.trust_forwarded_headers,
        }
    }
}

impl<S> ThrottleLayer<S>
where
    S: CounterStore + 'static,
{
    /// Throttle with the default handlers: accepted requests pass through and rejected ones
    /// get a `503` with [`BUSY_MESSAGE`].
    pub fn new(throttle: Arc<Throttle<S>>) -> Self {
        Self {
            throttle,
            handlers: Arc::new(RwLock::new(Handlers::default())),
            trust_forwarded_headers: false,
        }
    }

    /// Use `handler` for accepted requests.
    pub fn on_accept(self, handler: impl AcceptHandler) -> Self {
        self.handlers.write().unwrap_or_else(PoisonError::into_inner).on_accept = Arc::new(handler);
        self
    }

    /// Use `handler` for rejected requests.
    pub fn on_reject(self, handler: impl RejectHandler) -> Self {
        self.handlers.write().unwrap_or_else(PoisonError::into_inner).on_reject = Arc::new(handler);
        self
    }

    /// Key clients by `X-Forwarded-For` or `X-Real-IP` when present. Only enable behind a
    /// proxy that sets these headers, as clients can forge them otherwise.
    pub fn trust_forwarded_headers(mut self, trust: bool) -> Self {
        self.trust_forwarded_headers = trust;
        self
    }

    /// The throttle making the decisions.
    pub fn throttle(&self) -> &Arc<Throttle<S>> {
        &self.throttle
    }

    /// Apply a partial update. Requests already in flight finish with the settings they
    /// started with. An invalid limit update is rejected before any handler is replaced.
    pub fn configure(&self, update: ThrottleUpdate) -> Result<(), ThrottleError> {
        let ThrottleUpdate {
            limits,
            on_accept,
            on_reject,
        } = update;

        self.throttle.configure(limits)?;

        if on_accept.is_none() && on_reject.is_none() {
            return Ok(());
        }

        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(handler) = on_accept {
            handlers.on_accept = handler;
        }

        if let Some(handler) = on_reject {
            handlers.on_reject = handler;
        }

        Ok(())
    }
}

impl<Service, S> Layer<Service> for ThrottleLayer<S>
where
    Service: Send + Clone,
{
    type Service = ThrottleService<Service, S>;

    fn layer(&self, next: Service) -> Self::Service {
        ThrottleService {
            next,
            throttle: self.throttle.clone(),
            handlers: self.handlers.clone(),
            trust_forwarded_headers: self.trust_forwarded_headers,
        }
    }
}

/// Service produced by [`ThrottleLayer`].
pub struct ThrottleService<Service, S = Storage> {
    next: Service,
    throttle: Arc<Throttle<S>>,
    handlers: Arc<RwLock<Handlers>>,
    trust_forwarded_headers: bool,
}

impl<Service: Clone, S> Clone for ThrottleService<Service, S> {
    fn clone(&self) -> Self {
        Self {
            next: self.next.clone(),
            throttle: self.throttle.clone(),
            handlers: self.handlers.clone(),
            trust_forwarded_headers: self.trust_forwarded_headers,
        }
    }
}

impl<Service, S, ReqBody> tower::Service<Request<ReqBody>> for ThrottleService<Service, S>
where
    Service: tower::Service<Request<ReqBody>, Response = Response<Body>> + Send + Clone + 'static,
    Service::Future: Send,
    Service::Error: Display + 'static,
    S: CounterStore + 'static,
    ReqBody: http_body::Body + Send + 'static,
{
    type Response = http::Response<Body>;
    type Error = Service::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Body>, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.next.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let mut next = self.next.clone();
        let throttle = self.throttle.clone();
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner).clone();
        let trust_forwarded_headers = self.trust_forwarded_headers;

        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let client = client_key::extract(&parts, trust_forwarded_headers);

            match throttle.decide(&client).await {
                Decision::Accept => match handlers.on_accept.on_accept(&client, &parts) {
                    Proceed::Continue => next.call(Request::from_parts(parts, body)).await,
                    Proceed::Respond(response) => Ok(response),
                },
                Decision::Reject => {
                    log::debug!("Request from {client} to {} throttled", parts.uri.path());

                    Ok(handlers.on_reject.on_reject(&client, &parts))
                }
            }
        })
    }
}
