//! Request handlers and the handler chain.
//!
//! A [`RequestHandler`] looks at a request and either produces a final
//! [`Response`], or declines with `Ok(None)` so the next handler in the
//! [`HandlerChain`] gets a turn. Before its final response a handler may send any
//! number of provisional (1xx) responses through the [`ProvisionalSink`]; a handler
//! that does so and then declines breaks the contract.
//!
//! # Example
//!
//! ```
//! use http::StatusCode;
//! use sockkit_http::handler::{HandlerChain, make_handler};
//! use sockkit_http::protocol::{HandlerError, Response};
//!
//! let chain = HandlerChain::new();
//! chain.push(make_handler(|request| {
//!     if request.target() != "/hello" {
//!         return Ok::<_, HandlerError>(None);
//!     }
//!     Ok(Some(Response::with_status(StatusCode::OK).with_body("hello")))
//! }));
//! assert_eq!(chain.len(), 1);
//! ```

use std::error::Error;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use http::StatusCode;
use tracing::{debug, warn};

use crate::protocol::{HandlerError, Request, Response, SendError};

/// Where provisional responses go; they are written and flushed immediately.
#[async_trait]
pub trait ProvisionalSink: Send {
    /// Sends a 1xx response; any other status is [`SendError::NotProvisional`].
    async fn send(&mut self, response: Response) -> Result<(), SendError>;

    /// How many provisional responses were sent for the current request.
    fn sent(&self) -> usize;
}

#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(
        &self,
        request: &mut Request,
        provisional: &mut dyn ProvisionalSink,
    ) -> Result<Option<Response>, HandlerError>;

    /// Called when the last tracked connection using this handler has ended.
    fn close(&self) {}
}

/// A [`RequestHandler`] backed by a plain closure.
pub struct HandlerFn<F> {
    f: F,
}

impl<F> fmt::Debug for HandlerFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HandlerFn")
    }
}

#[async_trait]
impl<F, Err> RequestHandler for HandlerFn<F>
where
    F: Fn(&mut Request) -> Result<Option<Response>, Err> + Send + Sync,
    Err: Into<Box<dyn Error + Send + Sync>>,
{
    async fn handle(
        &self,
        request: &mut Request,
        _provisional: &mut dyn ProvisionalSink,
    ) -> Result<Option<Response>, HandlerError> {
        (self.f)(request).map_err(HandlerError::failed)
    }
}

pub fn make_handler<F, Err>(f: F) -> HandlerFn<F>
where
    F: Fn(&mut Request) -> Result<Option<Response>, Err> + Send + Sync,
    Err: Into<Box<dyn Error + Send + Sync>>,
{
    HandlerFn { f }
}

/// Ordered list of handlers; the first final response wins.
///
/// The list can be replaced or extended while requests are in flight; a request
/// keeps using the list it started with.
pub struct HandlerChain {
    handlers: ArcSwap<Vec<Arc<dyn RequestHandler>>>,
}

impl HandlerChain {
    pub fn new() -> Self {
        Self { handlers: ArcSwap::from_pointee(Vec::new()) }
    }

    pub fn replace(&self, handlers: Vec<Arc<dyn RequestHandler>>) {
        self.handlers.store(Arc::new(handlers));
    }

    pub fn push<H: RequestHandler + 'static>(&self, handler: H) {
        let handler: Arc<dyn RequestHandler> = Arc::new(handler);
        self.handlers.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(Arc::clone(&handler));
            next
        });
    }

    pub fn handlers(&self) -> Arc<Vec<Arc<dyn RequestHandler>>> {
        self.handlers.load_full()
    }

    pub fn len(&self) -> usize {
        self.handlers.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs the handlers in order until one produces a final response.
    ///
    /// When every handler declines the answer is `500 Internal Server Error`.
    pub async fn dispatch(
        &self,
        request: &mut Request,
        provisional: &mut dyn ProvisionalSink,
    ) -> Result<Response, HandlerError> {
        let handlers = self.handlers();
        for (index, handler) in handlers.iter().enumerate() {
            let before = provisional.sent();
            match handler.handle(request, provisional).await? {
                Some(response) => {
                    debug!(handler = index, status = response.status().as_u16(), "request handled");
                    return Ok(response);
                }
                None if provisional.sent() > before => return Err(HandlerError::ProvisionalWithoutFinal),
                None => {}
            }
        }

        warn!(uri = request.target(), handlers = handlers.len(), "no handler produced a response");
        Ok(Response::error(StatusCode::INTERNAL_SERVER_ERROR))
    }

    /// Calls [`RequestHandler::close`] on every handler.
    pub fn close(&self) {
        for handler in self.handlers().iter() {
            handler.close();
        }
    }
}

impl Default for HandlerChain {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HandlerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerChain").field("handlers", &self.len()).finish()
    }
}

pub(crate) fn check_provisional(response: &Response) -> Result<(), SendError> {
    if response.is_provisional() {
        Ok(())
    } else {
        Err(SendError::NotProvisional { status: response.status().as_u16() })
    }
}
