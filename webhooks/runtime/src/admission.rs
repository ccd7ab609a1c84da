use crate::{
    core::{AdmissionRequest, AdmissionResponse, AdmissionReview},
    events::{self, AuditEvent, EventSink},
    metrics::Outcome,
    server::{Route, Server},
};
use bytes::Bytes;
use futures::future;
use http_body_util::{BodyExt, Full};
use hyper::{
    body::{Body, Frame, SizeHint},
    http, Request, Response,
};
use std::{
    any::Any,
    convert::Infallible,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
};
use thiserror::Error;
use tracing::{debug, error, trace, warn};

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

/// A response body that reports an audit event if the connection is dropped
/// before the body is fully written.
pub struct ReplyBody {
    inner: Full<Bytes>,
    done: bool,
    unsent: Option<(Arc<dyn EventSink>, AuditEvent)>,
}

// === impl Server ===

impl<B> tower::Service<Request<B>> for Server
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Response = Response<ReplyBody>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<ReplyBody>, Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        trace!(method = %req.method(), uri = %req.uri(), "Admission request");
        let server = self.clone();
        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let bytes = body
                .collect()
                .await
                .map_err(|e| Error::Request(e.into()))?
                .to_bytes();

            if bytes.is_empty() {
                warn!("Empty request body");
                server.metrics.record(Outcome::Rejected);
                return Ok(text_response(http::StatusCode::BAD_REQUEST, "empty body"));
            }

            if !is_json(&parts.headers) {
                warn!(content_type = ?parts.headers.get(http::header::CONTENT_TYPE), "Unexpected content type");
                server.metrics.record(Outcome::Rejected);
                return Ok(text_response(
                    http::StatusCode::UNSUPPORTED_MEDIA_TYPE,
                    "invalid Content-Type, expect application/json",
                ));
            }

            let review = match serde_json::from_slice::<AdmissionReview>(&bytes) {
                Ok(review) => review,
                Err(error) => {
                    warn!(%error, "Failed to parse request body");
                    server.metrics.record(Outcome::Rejected);
                    let rsp = AdmissionResponse::invalid(error).into_review();
                    return json_response(&rsp).map_err(Into::into);
                }
            };
            trace!(?review);

            let req: AdmissionRequest = match review.try_into() {
                Ok(req) => req,
                Err(error) => {
                    warn!(%error, "Invalid admission review");
                    server.metrics.record(Outcome::Rejected);
                    let rsp = AdmissionResponse::invalid("admission review is missing a request")
                        .into_review();
                    return json_response(&rsp).map_err(Into::into);
                }
            };

            let rsp = server.admit(parts.uri.path(), &req);
            debug!(?rsp);
            match json_response(&rsp.into_review()) {
                Ok(mut rsp) => {
                    let note = "the connection closed before the response was written";
                    if let Some(ev) = AuditEvent::write_failed(&req, &note) {
                        rsp.body_mut().unsent = Some((server.events.clone(), ev));
                    }
                    Ok(rsp)
                }
                Err(error) => {
                    error!(%error, "Failed to encode admission response");
                    if let Some(ev) = AuditEvent::encoding_failed(&req, &error) {
                        server.events.emit(ev);
                    }
                    Err(error.into())
                }
            }
        })
    }
}

impl Server {
    /// Runs the handler for `path`. Handler errors and panics become denials.
    fn admit(&self, path: &str, req: &AdmissionRequest) -> AdmissionResponse {
        let Route { path, handler } = self.route(path);
        debug!(
            "{} requested to {} a {}",
            req.user_info.username.as_deref().unwrap_or_default(),
            events::operation(req),
            events::subject(req),
        );

        let mut rsp = match panic::catch_unwind(AssertUnwindSafe(|| handler.admit(req))) {
            Ok(Ok(rsp)) => rsp,
            Ok(Err(error)) => {
                warn!(%path, uid = %req.uid, "Handler failed: {error:#}");
                AdmissionResponse::from(req).deny(format!("{error:#}"))
            }
            Err(panic) => {
                let reason = panic_message(&*panic);
                error!(%path, uid = %req.uid, %reason, "Handler panicked");
                AdmissionResponse::from(req).deny(format!("handler for {path} panicked: {reason}"))
            }
        };
        rsp.uid = req.uid.clone();

        if !rsp.allowed {
            self.metrics.record(Outcome::Denied);
            let ev = if rsp.result.message.is_empty() {
                AuditEvent::denied(req, &path)
            } else {
                AuditEvent::failed(req, &rsp.result.message)
            };
            if let Some(ev) = ev {
                self.events.emit(ev);
            }
        } else if rsp.patch.is_some() {
            self.metrics.record(Outcome::Patched);
            if let Some(ev) = AuditEvent::mutated(req, &path) {
                self.events.emit(ev);
            }
        } else {
            self.metrics.record(Outcome::Allowed);
        }

        rsp
    }
}

// === impl ReplyBody ===

impl ReplyBody {
    fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            inner: Full::new(bytes.into()),
            done: false,
            unsent: None,
        }
    }
}

impl Body for ReplyBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
        let frame = ready!(Pin::new(&mut self.inner).poll_frame(cx));
        if frame.is_none() {
            self.done = true;
        }
        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.done
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for ReplyBody {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Some((events, ev)) = self.unsent.take() {
            warn!(object = ?ev.object.name, "Admission response was not written");
            events.emit(ev);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        return msg;
    }
    if let Some(msg) = panic.downcast_ref::<String>() {
        return msg;
    }
    "unknown panic"
}

/// Accepts `application/json` with or without parameters.
fn is_json(headers: &http::HeaderMap) -> bool {
    headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|mime| mime.trim().eq_ignore_ascii_case("application/json"))
        .unwrap_or(false)
}

fn text_response(status: http::StatusCode, msg: &'static str) -> Response<ReplyBody> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(ReplyBody::new(msg))
        .expect("error response must be valid")
}

fn json_response(rsp: &AdmissionReview) -> Result<Response<ReplyBody>, serde_json::Error> {
    let bytes = serde_json::to_vec(rsp)?;
    Ok(Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(ReplyBody::new(bytes))
        .expect("admission review response must be valid"))
}
