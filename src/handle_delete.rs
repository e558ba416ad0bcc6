use http::{Request, Response, StatusCode};
use log::debug;

use crate::body::Body;
use crate::conditional::{eval_if_header, submitted_tokens};
use crate::davhandler::DavInner;
use crate::davpath::DavPath;
use crate::{DavError, DavResult};

impl DavInner {
    pub(crate) async fn handle_delete(
        &self,
        req: &Request<()>,
        path: &DavPath,
    ) -> DavResult<Response<Body>> {
        if path.is_root() {
            return Err(DavError::Status(StatusCode::FORBIDDEN));
        }
        if self.fs.node_type(path).await?.is_none() {
            return Err(DavError::Status(StatusCode::NOT_FOUND));
        }

        eval_if_header(req, &*self.fs, &self.locks, path).await?;

        // every lock on the target and below must be matched by a
        // submitted token, or the whole delete is refused.
        let tokens = submitted_tokens(req);
        if let Err(lock) = self.locks.check(path, true, &tokens) {
            debug!("DELETE {}: blocked by lock {}", path, lock.token);
            return Err(DavError::Status(StatusCode::LOCKED));
        }

        self.fs.remove(path).await?;
        self.locks.purge_subtree(path);

        let mut res = Response::new(Body::empty());
        *res.status_mut() = StatusCode::NO_CONTENT;
        Ok(res)
    }
}
