use std::io::Read;

use bytes::Bytes;
use futures::SinkExt;
use http::{Method, StatusCode, Version};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info};

use async_trait::async_trait;

use crate::blocking::UNSTREAM_LIMIT;
use crate::codec::header::set_framing_headers;
use crate::codec::{MessageEncoder, MessageHead, RequestDecoder, framing, read_body, read_head};
use crate::handler::{HandlerChain, ProvisionalSink, check_provisional};
use crate::protocol::{
    BodyFraming, HandlerError, Headers, HttpError, Message, ParseError, PayloadItem, Response, SendError, StatusLine,
    expects_continue,
};

const DEFAULT_READ_BUFFER: usize = 8 * 1024;

const STREAM_CHUNK: usize = 8 * 1024;

type ResponseItem = Message<MessageHead<StatusLine>>;

type BodyStream = Box<dyn Read + Send>;

/// A response body as it is handed to the encoder.
enum Outgoing {
    Bytes(Bytes),
    /// Bytes already read from the stream, then the rest of it.
    Stream(Bytes, BodyStream),
}

/// Serves requests read from `R` with responses written to `W`, one at a time.
///
/// Each request is read completely, including its body, before the handler chain
/// sees it. A streaming response body is read on the blocking thread pool, one
/// chunk at a time, as it is written.
pub struct HttpConnection<R, W> {
    framed_read: FramedRead<R, RequestDecoder>,
    framed_write: FramedWrite<W, MessageEncoder>,
    unstreaming: bool,
}

impl<R, W> std::fmt::Debug for HttpConnection<R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpConnection").field("unstreaming", &self.unstreaming).finish_non_exhaustive()
    }
}

impl<R, W> HttpConnection<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self::with_capacity(reader, writer, DEFAULT_READ_BUFFER)
    }

    pub fn with_capacity(reader: R, writer: W, read_buffer: usize) -> Self {
        Self {
            framed_read: FramedRead::with_capacity(reader, RequestDecoder::new(), read_buffer),
            framed_write: FramedWrite::new(writer, MessageEncoder::new()),
            unstreaming: true,
        }
    }

    /// Whether a streaming response body of up to [`UNSTREAM_LIMIT`] bytes gets a
    /// `Content-Length` instead of closing the connection after it.
    pub fn unstreaming(mut self, enabled: bool) -> Self {
        self.unstreaming = enabled;
        self
    }

    /// Runs the request loop until the peer goes away or the connection must close.
    pub async fn process(mut self, chain: &HandlerChain) -> Result<(), HttpError> {
        loop {
            let head = match read_head(&mut self.framed_read).await {
                Ok(Some(head)) => head,
                Ok(None) => {
                    info!("cant read more request, break this connection down");
                    return Ok(());
                }
                Err(e) => return self.reject(e).await,
            };

            if !head.framing.is_empty() && expects_continue(&head.headers) {
                self.send_continue().await?;
            }

            let mut request = match read_body(&mut self.framed_read, head).await {
                Ok(request) => request,
                Err(e) => return self.reject(e).await,
            };

            let head_only = request.method() == Method::HEAD;
            let keep_alive = request.wants_keep_alive();
            let version = request.version();

            let outcome = {
                let mut sink = ProvisionalWriter { framed_write: &mut self.framed_write, sent: 0 };
                chain.dispatch(&mut request, &mut sink).await
            };
            request.body_mut().dispose();

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

            let framing = self.send_response(response, head_only).await?;
            if close || framing.is_until_close() {
                debug!(?framing, "closing connection after response");
                return Ok(());
            }
        }
    }

    async fn send_continue(&mut self) -> Result<(), SendError> {
        let head = MessageHead {
            line: StatusLine::new(StatusCode::CONTINUE),
            headers: Headers::new(),
            framing: BodyFraming::NoBody,
        };
        self.framed_write.send(ResponseItem::Header(head)).await?;
        info!("receive expect request header, sent continue response");
        Ok(())
    }

    /// Answers a malformed request with `400 Bad Request` when the peer is still
    /// listening, then gives up on the connection.
    async fn reject(&mut self, e: ParseError) -> Result<(), HttpError> {
        if e.is_protocol_error() {
            error!(cause = %e, "can't receive next request");
            let response = Response::error(StatusCode::BAD_REQUEST).with_header("Connection", "close");
            if let Err(send_error) = self.send_response(response, false).await {
                debug!(cause = %send_error, "could not send 400 response");
            }
        }
        Err(e.into())
    }

    async fn send_response(&mut self, response: Response, head_only: bool) -> Result<BodyFraming, SendError> {
        let (line, mut headers, mut body) = response.into_parts();

        let (framing, outgoing) = match framing::outgoing(&line, &mut headers, body.len())? {
            Some(BodyFraming::NoBody) => {
                body.dispose();
                (BodyFraming::NoBody, Outgoing::Bytes(Bytes::new()))
            }
            Some(framing) if !body.is_streaming() => (framing, Outgoing::Bytes(body.bytes()?)),
            Some(framing) => (framing, Outgoing::Stream(Bytes::new(), body.stream()?)),
            None if self.unstreaming => {
                let (stream, prefix) = read_blocking(body.stream()?, UNSTREAM_LIMIT + 1, true).await?;
                if prefix.len() <= UNSTREAM_LIMIT {
                    debug!(len = prefix.len(), "unstreamed body");
                    (BodyFraming::Length(prefix.len() as u64), Outgoing::Bytes(prefix))
                } else {
                    headers.set("Connection", "close");
                    (BodyFraming::UntilClose, Outgoing::Stream(prefix, stream))
                }
            }
            None => {
                headers.set("Connection", "close");
                (BodyFraming::UntilClose, Outgoing::Stream(Bytes::new(), body.stream()?))
            }
        };

        set_framing_headers(&mut headers, framing);
        if head_only {
            let head = MessageHead { line, headers, framing: BodyFraming::NoBody };
            self.framed_write.send(ResponseItem::Header(head)).await?;
            return Ok(framing);
        }

        let status = line.status().as_u16();
        self.framed_write.feed(ResponseItem::Header(MessageHead { line, headers, framing })).await?;
        let len = match outgoing {
            Outgoing::Bytes(payload) => {
                let len = payload.len();
                if !payload.is_empty() {
                    self.framed_write.feed(ResponseItem::Payload(PayloadItem::Chunk(payload))).await?;
                }
                len
            }
            Outgoing::Stream(mut chunk, mut stream) => {
                // chunks are flushed as they come, a stream may pause between them
                let mut len = 0;
                loop {
                    if !chunk.is_empty() {
                        len += chunk.len();
                        self.framed_write.send(ResponseItem::Payload(PayloadItem::Chunk(chunk))).await?;
                    }
                    let (rest, next) = read_blocking(stream, STREAM_CHUNK, false).await?;
                    if next.is_empty() {
                        break;
                    }
                    (stream, chunk) = (rest, next);
                }
                len
            }
        };
        self.framed_write.feed(ResponseItem::Payload(PayloadItem::Eof)).await?;
        SinkExt::<ResponseItem>::flush(&mut self.framed_write).await?;

        debug!(status, ?framing, len, "sent response");
        Ok(framing)
    }
}

/// Reads up to `limit` bytes on the blocking pool, since the stream may block.
///
/// With `fill` the read stops short only at the end of the stream, otherwise it
/// returns what one successful read produced. Empty means the stream ended.
async fn read_blocking(mut stream: BodyStream, limit: usize, fill: bool) -> Result<(BodyStream, Bytes), SendError> {
    let (stream, buf) = tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; limit];
        let mut filled = 0;
        while filled < limit {
            match stream.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => {
                    filled += n;
                    if !fill {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        buf.truncate(filled);
        Ok((stream, buf))
    })
    .await
    .map_err(SendError::io)?
    .map_err(SendError::io)?;
    Ok((stream, Bytes::from(buf)))
}

/// Writes provisional responses straight to the connection.
struct ProvisionalWriter<'a, W> {
    framed_write: &'a mut FramedWrite<W, MessageEncoder>,
    sent: usize,
}

#[async_trait]
impl<'a, W> ProvisionalSink for ProvisionalWriter<'a, W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, response: Response) -> Result<(), SendError> {
        check_provisional(&response)?;
        let (line, headers, _) = response.into_parts();
        let status = line.status().as_u16();

        self.framed_write.send(ResponseItem::Header(MessageHead { line, headers, framing: BodyFraming::NoBody })).await?;
        self.sent += 1;
        debug!(status, "sent provisional response");
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
    use crate::protocol::{Body, Request};
    use std::convert::Infallible;
    use std::io::Cursor;
    use std::sync::mpsc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    async fn exchange(chain: HandlerChain, input: &str) -> String {
        let (client, server) = duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let (mut client_read, mut client_write) = tokio::io::split(client);

        client_write.write_all(input.as_bytes()).await.unwrap();
        client_write.shutdown().await.unwrap();

        let _ = HttpConnection::new(server_read, server_write).process(&chain).await;

        let mut output = String::new();
        client_read.read_to_string(&mut output).await.unwrap();
        output
    }

    fn echo() -> impl RequestHandler {
        make_handler(|request: &mut Request| {
            let body = request.body_mut().bytes()?;
            Ok::<_, crate::protocol::BodyError>(Some(Response::with_status(StatusCode::OK).with_body(body)))
        })
    }

    #[tokio::test]
    async fn keep_alive_serves_pipelined_requests() {
        let chain = HandlerChain::new();
        chain.push(echo());

        let output = exchange(
            chain,
            "POST /a HTTP/1.1\r\nContent-Length: 3\r\n\r\nabcPOST /b HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nde\r\n0\r\n\r\n",
        )
        .await;
        assert_eq!(
            output,
            "HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nabcHTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nde"
        );
    }

    #[tokio::test]
    async fn continue_before_final_response() {
        let chain = HandlerChain::new();
        chain.push(echo());

        let output = exchange(chain, "PUT / HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 2\r\nConnection: close\r\n\r\nhi").await;
        assert_eq!(output, "HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi");
    }

    #[tokio::test]
    async fn declined_and_failed_requests_get_500() {
        let chain = HandlerChain::new();
        chain.push(make_handler(|request: &mut Request| match request.target() {
            "/fail" => Err("boom"),
            _ => Ok(None),
        }));

        let output = exchange(chain, "GET /fail HTTP/1.1\r\n\r\nGET /none HTTP/1.1\r\n\r\n").await;
        assert_eq!(output.matches("HTTP/1.1 500 Internal Server Error\r\n").count(), 2);
    }

    #[tokio::test]
    async fn malformed_request_gets_400_and_close() {
        let output = exchange(HandlerChain::new(), "GET / HTTP/1.1\r\nbad header\r\n\r\nGET / HTTP/1.1\r\n\r\n").await;
        assert!(output.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(output.contains("Connection: close\r\n"));
        assert_eq!(output.matches("HTTP/1.1").count(), 1);
    }

    #[tokio::test]
    async fn http_10_closes_unless_keep_alive() {
        let chain = HandlerChain::new();
        chain.push(make_handler(|_: &mut Request| Ok::<_, Infallible>(Some(Response::with_status(StatusCode::OK)))));

        let output = exchange(chain, "GET / HTTP/1.0\r\n\r\nGET / HTTP/1.0\r\n\r\n").await;
        assert_eq!(output, "HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");

        let chain = HandlerChain::new();
        chain.push(make_handler(|_: &mut Request| Ok::<_, Infallible>(Some(Response::with_status(StatusCode::OK)))));
        let output = exchange(chain, "GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\nGET / HTTP/1.0\r\n\r\n").await;
        assert_eq!(output.matches("200 OK").count(), 2);
        assert!(output.starts_with("HTTP/1.1 200 OK\r\nConnection: keep-alive\r\n"));
    }

    #[tokio::test]
    async fn streaming_bodies_are_unstreamed_or_close_delimited() {
        let chain = HandlerChain::new();
        chain.push(make_handler(|request: &mut Request| {
            let size = if request.target() == "/small" { 10 } else { UNSTREAM_LIMIT + 1 };
            let body = Body::from_reader(Cursor::new(vec![b'z'; size]));
            Ok::<_, Infallible>(Some(Response::with_status(StatusCode::OK).with_body(body)))
        }));

        let output = exchange(chain, "GET /small HTTP/1.1\r\n\r\nGET /large HTTP/1.1\r\n\r\nGET /never HTTP/1.1\r\n\r\n").await;
        let (small, large) = output.split_at(output.rfind("HTTP/1.1").unwrap());
        assert_eq!(small, format!("HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n{}", "z".repeat(10)));
        assert_eq!(large, format!("HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n{}", "z".repeat(UNSTREAM_LIMIT + 1)));
    }

    /// A body that hands out whatever arrives on `rx`, ending when the sender goes away.
    struct Feed {
        rx: mpsc::Receiver<Vec<u8>>,
        current: Cursor<Vec<u8>>,
    }

    impl Read for Feed {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            loop {
                let n = Read::read(&mut self.current, buf)?;
                if n > 0 || buf.is_empty() {
                    return Ok(n);
                }
                match self.rx.recv() {
                    Ok(next) => self.current = Cursor::new(next),
                    Err(_) => return Ok(0),
                }
            }
        }
    }

    #[tokio::test]
    async fn large_stream_is_written_before_it_ends() {
        let (tx, rx) = mpsc::channel();
        let feed = parking_lot::Mutex::new(Some(Feed { rx, current: Cursor::new(Vec::new()) }));
        let chain = HandlerChain::new();
        chain.push(make_handler(move |_: &mut Request| {
            let body = feed.lock().take().map_or_else(Body::empty, Body::from_reader);
            Ok::<_, Infallible>(Some(Response::with_status(StatusCode::OK).with_body(body)))
        }));

        let (client, server) = duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let served = tokio::spawn(async move { HttpConnection::new(server_read, server_write).process(&chain).await });

        client_write.write_all(b"GET /feed HTTP/1.1\r\n\r\n").await.unwrap();
        tx.send(vec![b'z'; UNSTREAM_LIMIT + 100]).unwrap();

        // the stream is still open here
        let head = "HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n";
        let mut received = vec![0u8; head.len() + UNSTREAM_LIMIT + 100];
        client_read.read_exact(&mut received).await.unwrap();
        assert!(received.starts_with(head.as_bytes()));
        assert!(received[head.len()..].iter().all(|b| *b == b'z'));

        tx.send(b"tail".to_vec()).unwrap();
        drop(tx);
        let mut rest = Vec::new();
        client_read.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"tail");
        served.await.unwrap().unwrap();
    }

    struct Hints;

    #[async_trait]
    impl RequestHandler for Hints {
        async fn handle(&self, _: &mut Request, provisional: &mut dyn ProvisionalSink) -> Result<Option<Response>, HandlerError> {
            provisional.send(Response::with_status(StatusCode::from_u16(103).unwrap()).with_header("Link", "</a.css>")).await?;
            Ok(Some(Response::with_status(StatusCode::NO_CONTENT)))
        }
    }

    #[tokio::test]
    async fn provisional_responses_precede_final() {
        let chain = HandlerChain::new();
        chain.push(Hints);

        let output = exchange(chain, "HEAD / HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        let (hints, last) = output.split_once("\r\n\r\n").unwrap();
        assert!(hints.starts_with("HTTP/1.1 103 "));
        assert!(hints.ends_with("\r\nLink: </a.css>"));
        assert_eq!(last, "HTTP/1.1 204 No Content\r\n\r\n");
    }
}
