use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};
use log::debug;

use crate::body::Body;
use crate::conditional::{eval_if_header, submitted_tokens};
use crate::davhandler::DavInner;
use crate::davheaders;
use crate::davpath::DavPath;
use crate::util::DavMethod;
use crate::{DavError, DavResult};

impl DavInner {
    // Extract and normalize the Destination path. A destination on a
    // foreign authority is refused; we only move things around inside
    // our own namespace.
    fn destination(&self, req: &Request<()>) -> DavResult<DavPath> {
        let dest = req
            .headers()
            .typed_get::<davheaders::Destination>()
            .ok_or(DavError::Status(StatusCode::BAD_REQUEST))?;

        let path = if dest.0.starts_with('/') {
            dest.0
        } else {
            let url = url::Url::parse(&dest.0)
                .map_err(|_| DavError::Status(StatusCode::BAD_REQUEST))?;
            let host = req
                .headers()
                .get(http::header::HOST)
                .and_then(|h| h.to_str().ok())
                .map(|h| h.split(':').next().unwrap_or(h).to_string());
            if let (Some(host), Some(dest_host)) = (host, url.host_str()) {
                if host != dest_host {
                    debug!("destination host {} is not ours", dest_host);
                    return Err(DavError::Status(StatusCode::BAD_REQUEST));
                }
            }
            url.path().to_string()
        };
        Ok(DavPath::from_str_and_prefix(&path, &self.prefix)?)
    }

    pub(crate) async fn handle_copymove(
        &self,
        req: &Request<()>,
        path: &DavPath,
        method: DavMethod,
    ) -> DavResult<Response<Body>> {
        let overwrite = req
            .headers()
            .typed_get::<davheaders::Overwrite>()
            .map_or(true, |o| o.0);
        let dest = self.destination(req)?;

        // source must exist.
        self.fs.metadata(path).await?;

        let exists = self.fs.node_type(&dest).await?.is_some();
        if exists && !overwrite {
            return Err(DavError::Status(StatusCode::PRECONDITION_FAILED));
        }
        if path == &dest {
            return Err(DavError::Status(StatusCode::FORBIDDEN));
        }

        // destination parent must exist.
        if !dest.is_root() && self.fs.node_type(&dest.parent()).await?.is_none() {
            return Err(DavError::Status(StatusCode::CONFLICT));
        }

        eval_if_header(req, &*self.fs, &self.locks, path).await?;

        let tokens = submitted_tokens(req);
        if method == DavMethod::Move {
            // the whole source subtree must be covered, like DELETE.
            if let Err(lock) = self.locks.check(path, true, &tokens) {
                debug!("MOVE {}: blocked by source lock {}", path, lock.token);
                return Err(DavError::Status(StatusCode::LOCKED));
            }
        }
        // and the destination (plus the collection gaining the member)
        // must be writable, like PUT.
        if let Err(lock) = self
            .locks
            .check(&dest, exists, &tokens)
            .and_then(|_| self.locks.check(&dest.parent(), false, &tokens))
        {
            debug!("{:?} {}: blocked by destination lock {}", method, dest, lock.token);
            return Err(DavError::Status(StatusCode::LOCKED));
        }

        if exists {
            self.locks.purge_subtree(&dest);
        }

        if method == DavMethod::Copy {
            self.fs.copy(path, &dest).await?;
        } else {
            self.fs.rename(path, &dest).await?;
            // locks rooted at the source follow the resource; anything
            // deeper in the old subtree is gone with it.
            self.locks.migrate(path, &dest);
            self.locks.purge_subtree(path);
        }

        let mut res = Response::new(Body::empty());
        *res.status_mut() = if exists {
            StatusCode::NO_CONTENT
        } else {
            StatusCode::CREATED
        };
        Ok(res)
    }
}
