use futures_util::StreamExt;
use headers::HeaderMapExt;
use http::{HeaderValue, Request, Response, StatusCode};
use log::{debug, error};

use crate::body::{Body, InStream};
use crate::conditional::{eval_if_header, submitted_tokens};
use crate::davhandler::DavInner;
use crate::davheaders;
use crate::davpath::DavPath;
use crate::fs::{NodeKind, WriteRange};
use crate::{DavError, DavResult};

impl DavInner {
    pub(crate) async fn handle_put(
        &self,
        req: &Request<()>,
        path: &DavPath,
        mut body: InStream,
    ) -> DavResult<Response<Body>> {
        let existed = match self.fs.node_type(path).await? {
            Some(NodeKind::Collection) => {
                return Err(DavError::Status(StatusCode::METHOD_NOT_ALLOWED))
            }
            Some(NodeKind::File) => true,
            None => false,
        };

        eval_if_header(req, &*self.fs, &self.locks, path).await?;

        // a lock on the path, or a deep lock on an ancestor, must be
        // matched by a submitted token.
        let tokens = submitted_tokens(req);
        if self.locks.check(path, false, &tokens).is_err() {
            return Err(DavError::Status(StatusCode::LOCKED));
        }

        // apache mod_dav style partial PUT.
        let range = match req.headers().typed_try_get::<davheaders::ContentRange>() {
            Ok(None) => None,
            Ok(Some(cr)) => Some(WriteRange {
                start: cr.start,
                end:   cr.end,
                total: cr.total,
            }),
            Err(_) => return Err(DavError::Status(StatusCode::BAD_REQUEST)),
        };

        let _guard = self.locks.try_write_stream(path).ok_or(DavError::Busy)?;
        let mut file = self.fs.open_write(path, range).await?;

        // inactivity window, reset on every chunk.
        loop {
            let next = match self.upload_timeout {
                Some(window) => match tokio::time::timeout(window, body.next()).await {
                    Ok(item) => item,
                    Err(_) => {
                        error!("PUT {}: upload stalled", path);
                        return Err(DavError::Status(StatusCode::REQUEST_TIMEOUT));
                    }
                },
                None => body.next().await,
            };
            match next {
                None => break,
                Some(chunk) => file.write_bytes(chunk?).await?,
            }
        }
        let meta = file.commit().await?;

        debug!("PUT {}: {} bytes, etag {}", path, meta.len(), meta.etag());

        let mut res = Response::new(Body::empty());
        *res.status_mut() = if existed {
            StatusCode::NO_CONTENT
        } else {
            StatusCode::CREATED
        };
        let h = res.headers_mut();
        h.typed_insert(headers::ContentLength(0));
        if let Ok(v) = HeaderValue::from_str(&format!("\"{}\"", meta.etag())) {
            h.insert(http::header::ETAG, v);
        }
        Ok(res)
    }
}
