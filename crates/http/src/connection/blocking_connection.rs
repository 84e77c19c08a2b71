use std::io::{BufRead, Write};

use async_trait::async_trait;
use futures::executor::block_on;
use http::{Method, StatusCode, Version};
use tracing::{debug, error, info};

use crate::blocking::{MessageReader, MessageWriter};
use crate::handler::{HandlerChain, ProvisionalSink, check_provisional};
use crate::protocol::{HandlerError, HttpError, ParseError, Response, SendError};

/// The request loop of a connection served by a thread of its own.
///
/// Request bodies stay on the wire until a handler reads them; whatever is left
/// unread is skipped before the next request.
#[derive(Debug)]
pub struct BlockingConnection<R, W> {
    reader: MessageReader<R>,
    writer: MessageWriter<W>,
}

impl<R, W> BlockingConnection<R, W>
where
    R: BufRead + Send + 'static,
    W: Write + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader: MessageReader::new(reader), writer: MessageWriter::new(writer) }
    }

    pub fn unstreaming(mut self, enabled: bool) -> Self {
        self.writer = self.writer.unstreaming(enabled);
        self
    }

    pub fn process(mut self, chain: &HandlerChain) -> Result<(), HttpError> {
        loop {
            let mut request = match self.reader.read_request() {
                Ok(Some(request)) => request,
                Ok(None) => {
                    info!("cant read more request, break this connection down");
                    return Ok(());
                }
                Err(e) => return self.reject(e),
            };

            if request.expects_continue() && request.framing().is_some_and(|framing| !framing.is_empty()) {
                let mut continue_response = Response::with_status(StatusCode::CONTINUE);
                self.writer.write(&mut continue_response)?;
                info!("receive expect request header, sent continue response");
            }

            let head_only = request.method() == Method::HEAD;
            let keep_alive = request.wants_keep_alive();
            let version = request.version();

            let outcome = {
                let mut sink = ProvisionalWriter { writer: &mut self.writer, sent: 0 };
                block_on(chain.dispatch(&mut request, &mut sink))
            };

            request.body_mut().dispose();
            if let Err(e) = self.reader.skip_body() {
                return self.reject(e);
            }

            let mut response = match outcome {
                Ok(response) => response,
                Err(HandlerError::ProvisionalWithoutFinal) => {
                    error!(uri = request.target(), "provisional response sent without a final one, closing connection");
                    return Err(HandlerError::ProvisionalWithoutFinal.into());
                }
                Err(e) => {
                    error!(uri = request.target(), cause = %e, "handle response error");
                    Response::error(StatusCode::INTERNAL_SERVER_ERROR)
                }
            };

            let close = !keep_alive || response.headers().has_token("connection", "close");
            if !close && version == Version::HTTP_10 {
                response.headers_mut().set("Connection", "keep-alive");
            }

            let framing = if head_only { self.writer.write_head_only(&mut response)? } else { self.writer.write(&mut response)? };
            if close || framing.is_until_close() {
                debug!(?framing, "closing connection after response");
                return Ok(());
            }
        }
    }

    fn reject(&mut self, e: ParseError) -> Result<(), HttpError> {
        if e.is_protocol_error() {
            error!(cause = %e, "can't receive next request");
            let mut response = Response::error(StatusCode::BAD_REQUEST).with_header("Connection", "close");
            if let Err(send_error) = self.writer.write(&mut response) {
                debug!(cause = %send_error, "could not send 400 response");
            }
        }
        Err(e.into())
    }
}

struct ProvisionalWriter<'a, W> {
    writer: &'a mut MessageWriter<W>,
    sent: usize,
}

#[async_trait]
impl<'a, W: Write + Send> ProvisionalSink for ProvisionalWriter<'a, W> {
    async fn send(&mut self, mut response: Response) -> Result<(), SendError> {
        check_provisional(&response)?;
        self.writer.write(&mut response)?;
        self.sent += 1;
        debug!(status = response.status().as_u16(), "sent provisional response");
        Ok(())
    }

    fn sent(&self) -> usize {
        self.sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{RequestHandler, make_handler};
    use crate::protocol::{BodyError, Request};
    use std::convert::Infallible;
    use std::io::Cursor;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn exchange(chain: &HandlerChain, input: &str) -> String {
        let mut output = Vec::new();
        let _ = BlockingConnection::new(Cursor::new(input.as_bytes().to_vec()), &mut output).process(chain);
        String::from_utf8(output).unwrap()
    }

    #[test]
    fn unread_request_body_is_skipped() {
        let chain = HandlerChain::new();
        chain.push(make_handler(|request: &mut Request| {
            let body = if request.target() == "/echo" { request.body_mut().text()? } else { String::from("skipped") };
            Ok::<_, BodyError>(Some(Response::with_status(StatusCode::OK).with_body(body)))
        }));

        let output = exchange(
            &chain,
            "POST /ignore HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\nPOST /echo HTTP/1.1\r\nContent-Length: 4\r\n\r\nbody",
        );
        assert_eq!(
            output,
            "HTTP/1.1 200 OK\r\nContent-Length: 7\r\n\r\nskippedHTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nbody"
        );
    }

    #[test]
    fn continue_is_sent_before_dispatch() {
        let seen = Arc::new(AtomicUsize::new(0));
        let chain = HandlerChain::new();
        let counter = Arc::clone(&seen);
        chain.push(make_handler(move |request: &mut Request| {
            counter.fetch_add(1, Ordering::SeqCst);
            let body = request.body_mut().bytes()?;
            Ok::<_, BodyError>(Some(Response::with_status(StatusCode::CREATED).with_body(body)))
        }));

        let output = exchange(&chain, "PUT /f HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok");
        assert_eq!(output, "HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 201 Created\r\nContent-Length: 2\r\n\r\nok");
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn errors_map_to_status_codes() {
        let chain = HandlerChain::new();
        chain.push(make_handler(|_: &mut Request| Err::<Option<Response>, _>("boom")));
        let output = exchange(&chain, "GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
        assert!(output.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));

        let output = exchange(&chain, "POST / HTTP/1.1\r\nContent-Length: nope\r\n\r\n");
        assert!(output.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    struct Violation;

    #[async_trait]
    impl RequestHandler for Violation {
        async fn handle(&self, _: &mut Request, provisional: &mut dyn ProvisionalSink) -> Result<Option<Response>, HandlerError> {
            provisional.send(Response::with_status(StatusCode::PROCESSING)).await?;
            Ok(None)
        }
    }

    #[test]
    fn provisional_without_final_closes() {
        let chain = HandlerChain::new();
        chain.push(Violation);
        chain.push(make_handler(|_: &mut Request| Ok::<_, Infallible>(Some(Response::with_status(StatusCode::OK)))));

        let mut output = Vec::new();
        let result = BlockingConnection::new(Cursor::new(b"GET / HTTP/1.1\r\n\r\nGET / HTTP/1.1\r\n\r\n".to_vec()), &mut output)
            .process(&chain);
        assert!(matches!(result, Err(HttpError::HandlerError { source: HandlerError::ProvisionalWithoutFinal })));
        assert_eq!(String::from_utf8(output).unwrap(), "HTTP/1.1 102 Processing\r\n\r\n");
    }
}
