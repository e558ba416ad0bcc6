use http::{HeaderValue, Request, Response, StatusCode};

use crate::body::Body;
use crate::davhandler::DavInner;
use crate::davpath::DavPath;
use crate::util::ALL_METHODS;
use crate::DavResult;

impl DavInner {
    pub(crate) async fn handle_options(
        &self,
        _req: &Request<()>,
        _path: &DavPath,
    ) -> DavResult<Response<Body>> {
        let mut res = Response::new(Body::empty());
        *res.status_mut() = StatusCode::OK;

        let allow = ALL_METHODS
            .iter()
            .filter(|m| self.allow.map_or(true, |a| a.contains(**m)))
            .map(|m| m.as_str())
            .collect::<Vec<_>>()
            .join(", ");

        let h = res.headers_mut();
        h.insert("dav", HeaderValue::from_static("1, 2"));
        h.insert("allow", HeaderValue::from_str(&allow).unwrap_or(HeaderValue::from_static("OPTIONS")));
        h.insert("ms-author-via", HeaderValue::from_static("DAV"));
        h.insert("accept-ranges", HeaderValue::from_static("bytes"));
        h.insert("content-length", HeaderValue::from_static("0"));
        Ok(res)
    }
}
