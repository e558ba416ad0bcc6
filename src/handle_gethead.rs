use headers::HeaderMapExt;
use http::{HeaderValue, Request, Response, StatusCode};
use log::debug;

use crate::body::Body;
use crate::davhandler::DavInner;
use crate::davheaders::{self, ByteRangeSpec};
use crate::davpath::DavPath;
use crate::fs::ByteRange;
use crate::util::systemtime_to_httpdate;
use crate::{DavError, DavResult};

// Turn a parsed Range into concrete (start, length), or None when the
// range cannot be satisfied against the current file size.
fn resolve_range(spec: ByteRangeSpec, len: u64) -> Option<ByteRange> {
    let (start, count) = match spec {
        ByteRangeSpec::FromTo(s, e) => (s, e.saturating_sub(s) + 1),
        ByteRangeSpec::AllFrom(s) => (s, len.saturating_sub(s)),
        ByteRangeSpec::Last(n) => (len.saturating_sub(n), n.min(len)),
    };
    if start >= len || count == 0 {
        return None;
    }
    let count = count.min(len - start);
    Some(ByteRange {
        start,
        end: start + count - 1,
    })
}

impl DavInner {
    pub(crate) async fn handle_get(
        &self,
        req: &Request<()>,
        path: &DavPath,
    ) -> DavResult<Response<Body>> {
        let head = req.method() == http::Method::HEAD;
        let meta = self.fs.metadata(path).await?;

        if meta.is_collection() {
            return self.handle_dirlist(path, head).await;
        }

        // an exclusive lock on the resource blocks plain reads.
        if self.locks.is_exclusively_locked(path) {
            return Err(DavError::Status(StatusCode::LOCKED));
        }

        // a write in progress means "try again in a second".
        let guard = self.locks.try_read_stream(path).ok_or(DavError::Busy)?;

        let len = meta.len();
        let mut res = Response::new(Body::empty());
        let h = res.headers_mut();
        h.typed_insert(headers::AcceptRanges::bytes());
        if let Ok(v) = HeaderValue::from_str(&format!("\"{}\"", meta.etag())) {
            h.insert(http::header::ETAG, v);
        }
        if let Ok(v) = HeaderValue::from_str(&systemtime_to_httpdate(meta.modified())) {
            h.insert(http::header::LAST_MODIFIED, v);
        }
        if let Ok(v) = HeaderValue::from_str(path.mime_type_str()) {
            h.insert(http::header::CONTENT_TYPE, v);
        }

        let range = match req.headers().typed_try_get::<davheaders::Range>() {
            Ok(None) => None,
            Ok(Some(r)) => match resolve_range(r.0, len) {
                Some(range) => Some(range),
                None => return Ok(unsatisfiable(res, len)),
            },
            Err(_) => return Ok(unsatisfiable(res, len)),
        };

        let count = match range {
            Some(r) => {
                let value = format!("bytes {}-{}/{}", r.start, r.end, len);
                res.headers_mut()
                    .insert(http::header::CONTENT_RANGE, HeaderValue::from_str(&value).unwrap());
                *res.status_mut() = StatusCode::PARTIAL_CONTENT;
                r.end - r.start + 1
            }
            None => {
                *res.status_mut() = StatusCode::OK;
                len
            }
        };
        res.headers_mut().typed_insert(headers::ContentLength(count));

        if head {
            return Ok(res);
        }

        debug!("streaming {} bytes of {}", count, path);
        let strm = self.fs.read_stream(path, range).await?;
        *res.body_mut() = Body::guarded(strm, guard);
        Ok(res)
    }

    // GET on a collection returns a minimal index of the members.
    pub(crate) async fn handle_dirlist(
        &self,
        path: &DavPath,
        head: bool,
    ) -> DavResult<Response<Body>> {
        let mut members = self.fs.members(path).await?;
        // collections first, then by name.
        members.sort_by(|a, b| {
            (!a.meta.is_collection(), &a.name).cmp(&(!b.meta.is_collection(), &b.name))
        });

        let mut res = Response::new(Body::empty());
        *res.status_mut() = StatusCode::OK;
        res.headers_mut().insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        if head {
            return Ok(res);
        }

        let title = htmlescape::encode_minimal(&path.as_url_string_with_prefix());
        let mut w = String::new();
        w.push_str("<html><head>");
        w.push_str(&format!("<title>Index of {}</title>", title));
        w.push_str("</head><body>");
        w.push_str(&format!("<h1>Index of {}</h1>", title));
        w.push_str("<ul>");
        for member in &members {
            let href = path.child(&member.name);
            let name = htmlescape::encode_minimal(&String::from_utf8_lossy(&member.name));
            let slash = if member.meta.is_collection() { "/" } else { "" };
            w.push_str(&format!(
                "<li><a href=\"{}\">{}{}</a></li>",
                href.as_url_string_with_prefix(),
                name,
                slash,
            ));
        }
        w.push_str("</ul></body></html>");

        res.headers_mut()
            .typed_insert(headers::ContentLength(w.len() as u64));
        *res.body_mut() = Body::from(w);
        Ok(res)
    }
}

fn unsatisfiable(mut res: Response<Body>, len: u64) -> Response<Body> {
    *res.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
    let value = format!("bytes */{}", len);
    res.headers_mut()
        .insert(http::header::CONTENT_RANGE, HeaderValue::from_str(&value).unwrap());
    res.headers_mut().typed_insert(headers::ContentLength(0));
    res
}
