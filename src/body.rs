//! Definitions for the request and response bodies.
use std::error::Error as StdError;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use futures_util::stream::{BoxStream, Stream, StreamExt};
use http_body::{Body as HttpBody, Frame, SizeHint};
use http_body_util::BodyStream;

use crate::fs::FsStream;
use crate::locks::StreamGuard;

/// Body returned by the webdav handler. Implements both `Stream` and
/// `http_body::Body`.
pub struct Body {
    inner: BodyKind,
}

enum BodyKind {
    Empty,
    Bytes(Option<Bytes>),
    Stream(BoxStream<'static, io::Result<Bytes>>),
}

impl Body {
    /// An empty body.
    pub fn empty() -> Body {
        Body { inner: BodyKind::Empty }
    }

    // Response body fed from a filesystem read stream. The stream lock
    // guard rides along and is released when the body is dropped, i.e.
    // when the response completes or the connection goes away.
    pub(crate) fn guarded(strm: FsStream<Bytes>, guard: StreamGuard) -> Body {
        let mut guard = Some(guard);
        let strm = strm.map(move |item| {
            if item.is_err() {
                drop(guard.take());
            }
            item.map_err(|e| io::Error::other(e.to_string()))
        });
        Body {
            inner: BodyKind::Stream(strm.boxed()),
        }
    }
}

impl Stream for Body {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        match self.inner {
            BodyKind::Empty => Poll::Ready(None),
            BodyKind::Bytes(ref mut b) => Poll::Ready(b.take().map(Ok)),
            BodyKind::Stream(ref mut strm) => strm.as_mut().poll_next(cx),
        }
    }
}

impl HttpBody for Body {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.poll_next(cx)
            .map(|opt| opt.map(|res| res.map(Frame::data)))
    }

    fn is_end_stream(&self) -> bool {
        match self.inner {
            BodyKind::Empty => true,
            BodyKind::Bytes(ref b) => b.is_none(),
            BodyKind::Stream(_) => false,
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self.inner {
            BodyKind::Empty => SizeHint::with_exact(0),
            BodyKind::Bytes(Some(ref b)) => SizeHint::with_exact(b.len() as u64),
            BodyKind::Bytes(None) => SizeHint::with_exact(0),
            BodyKind::Stream(_) => SizeHint::default(),
        }
    }
}

impl From<String> for Body {
    fn from(t: String) -> Body {
        Body {
            inner: BodyKind::Bytes(Some(Bytes::from(t))),
        }
    }
}

impl From<&str> for Body {
    fn from(t: &str) -> Body {
        Body::from(t.to_string())
    }
}

impl From<Bytes> for Body {
    fn from(t: Bytes) -> Body {
        Body {
            inner: BodyKind::Bytes(Some(t)),
        }
    }
}

/// The request body, reduced to a pinned stream of byte chunks.
pub(crate) type InStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

// Adapt any http_body request body into an InStream; trailer frames
// are discarded.
pub(crate) fn incoming<B>(body: B) -> InStream
where
    B: HttpBody + Send + 'static,
    B::Data: Buf + Send,
    B::Error: StdError + Send + Sync + 'static,
{
    Box::pin(BodyStream::new(body).filter_map(|res| async move {
        match res {
            Ok(frame) => match frame.into_data() {
                Ok(mut data) => Some(Ok(data.copy_to_bytes(data.remaining()))),
                Err(_) => None,
            },
            Err(e) => Some(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                e.to_string(),
            ))),
        }
    }))
}
