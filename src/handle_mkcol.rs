use http::{Request, Response, StatusCode};

use crate::body::Body;
use crate::conditional::{eval_if_header, submitted_tokens};
use crate::davhandler::DavInner;
use crate::davpath::DavPath;
use crate::fs::{FsError, NodeKind};
use crate::{DavError, DavResult};

impl DavInner {
    pub(crate) async fn handle_mkcol(
        &self,
        req: &Request<()>,
        path: &DavPath,
    ) -> DavResult<Response<Body>> {
        eval_if_header(req, &*self.fs, &self.locks, path).await?;

        let tokens = submitted_tokens(req);
        if self.locks.check(path, false, &tokens).is_err() {
            return Err(DavError::Status(StatusCode::LOCKED));
        }

        // RFC 4918 9.3.1: missing intermediate collections are a 409,
        // not something MKCOL creates on the fly.
        if !path.is_root() {
            match self.fs.node_type(&path.parent()).await? {
                Some(NodeKind::Collection) => {}
                _ => return Err(DavError::Status(StatusCode::CONFLICT)),
            }
        }

        match self.fs.create(path, NodeKind::Collection).await {
            Err(FsError::Exists) => Err(DavError::Status(StatusCode::METHOD_NOT_ALLOWED)),
            Err(e) => Err(e.into()),
            Ok(()) => {
                let mut res = Response::new(Body::empty());
                *res.status_mut() = StatusCode::CREATED;
                Ok(res)
            }
        }
    }
}
