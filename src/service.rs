//! Application collaborator boundary.
//!
//! The engine frames requests and hands them across this seam; everything
//! above it (routing, middleware, business logic) lives in another layer.
//! Services run on the connection's owning thread, so their futures need
//! not be `Send`.

use async_trait::async_trait;

use crate::http::{Request, Response};

/// Response handed back across the boundary.
#[derive(Debug, Clone)]
pub struct ServiceResponse {
    /// The response to transmit.
    pub response: Response,
    /// Whether the connection may serve another exchange afterwards. The
    /// effective decision also honours the request's own keep-alive tokens.
    pub reuse: bool,
}

impl ServiceResponse {
    /// Wrap a response, leaving connection reuse permitted.
    #[must_use]
    pub fn new(response: Response) -> Self {
        Self {
            response,
            reuse: true,
        }
    }

    /// Refuse connection reuse after this response.
    #[must_use]
    pub fn close(mut self) -> Self {
        self.reuse = false;
        self
    }
}

impl From<Response> for ServiceResponse {
    fn from(response: Response) -> Self { Self::new(response) }
}

/// An asynchronous request handler.
///
/// One instance is built per connection by the server's factory; `call` is
/// invoked once per framed request. Errors are answered with a minimal 500
/// and end the connection after the response drains.
#[async_trait(?Send)]
pub trait Service: 'static {
    /// Error type returned by the handler.
    type Error: std::error::Error + 'static;

    /// Handle one framed request.
    ///
    /// # Errors
    /// Handler-specific. The engine answers any error with a minimal 500
    /// and refuses connection reuse.
    async fn call(&self, request: Request) -> Result<ServiceResponse, Self::Error>;
}

/// Adapter turning an async closure into a [`Service`].
pub struct ServiceFn<F> {
    f: F,
}

/// Wrap `f` as a [`Service`].
///
/// Useful for demos and tests where a full service type is noise.
pub fn service_fn<F, Fut>(f: F) -> ServiceFn<F>
where
    F: Fn(Request) -> Fut + 'static,
    Fut: Future<Output = ServiceResponse> + 'static,
{
    ServiceFn { f }
}

#[async_trait(?Send)]
impl<F, Fut> Service for ServiceFn<F>
where
    F: Fn(Request) -> Fut + 'static,
    Fut: Future<Output = ServiceResponse> + 'static,
{
    type Error = std::convert::Infallible;

    async fn call(&self, request: Request) -> Result<ServiceResponse, Self::Error> {
        Ok((self.f)(request).await)
    }
}
