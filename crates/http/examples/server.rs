//! Demo server.
//!
//! ```sh
//! SOCKKIT_LISTEN=127.0.0.1:9000 cargo run -p sockkit-http --example server
//! curl -v http://127.0.0.1:9000/hello
//! curl -v --data-binary @Cargo.toml -H 'Expect: 100-continue' http://127.0.0.1:9000/echo
//! ```

use async_trait::async_trait;
use http::{Method, StatusCode};
use sockkit_http::handler::{ProvisionalSink, RequestHandler, make_handler};
use sockkit_http::protocol::{HandlerError, Request, Response};
use sockkit_http::server::{HttpServer, ServerConfig};
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

/// Answers `/hints` with an early hint before the page itself.
struct EarlyHints;

#[async_trait]
impl RequestHandler for EarlyHints {
    async fn handle(&self, request: &mut Request, provisional: &mut dyn ProvisionalSink) -> Result<Option<Response>, HandlerError> {
        if request.target() != "/hints" {
            return Ok(None);
        }
        let hint = StatusCode::from_u16(103).map_err(HandlerError::failed)?;
        provisional.send(Response::with_status(hint).with_header("Link", "</style.css>; rel=preload; as=style")).await?;
        Ok(Some(Response::with_status(StatusCode::OK).with_header("Content-Type", "text/html").with_body("<h1>hinted</h1>\r\n")))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = ServerConfig::from_env()?;
    let server = HttpServer::builder()
        .config(config)
        .handler(EarlyHints)
        .handler(make_handler(|request: &mut Request| {
            let response = match (request.method(), request.target()) {
                (&Method::GET, "/hello") => Response::with_status(StatusCode::OK).with_body("Hello World!\r\n"),
                (&Method::POST, "/echo") => {
                    let body = request.body_mut().bytes()?;
                    info!(len = body.len(), "receiving request body");
                    Response::with_status(StatusCode::OK).with_body(body)
                }
                _ => Response::error(StatusCode::NOT_FOUND),
            };
            Ok::<_, HandlerError>(Some(response))
        }))
        .build()?;

    let address = server.start()?;
    info!(%address, "start listening");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(cause = %e, "can't wait for ctrl-c");
    }
    server.stop();
    Ok(())
}
