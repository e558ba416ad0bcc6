use std::io::Cursor;
use std::time::Duration;

use headers::HeaderMapExt;
use http::{HeaderValue, Request, Response, StatusCode};
use log::{debug, trace};
use xmltree::Element;

use crate::body::Body;
use crate::conditional::submitted_tokens;
use crate::davhandler::DavInner;
use crate::davheaders::{self, DavTimeout, Depth};
use crate::davpath::DavPath;
use crate::davxml::{dav_child, emitter, is_dav_elem, ElementExt, NS_DAV_URI};
use crate::fs::NodeKind;
use crate::locks::{DavLock, LockManager};
use crate::util::MemBuffer;
use crate::{DavError, DavResult};

impl DavInner {
    fn lock_timeout(&self, req: &Request<()>) -> Duration {
        match req.headers().typed_get::<davheaders::Timeout>() {
            Some(davheaders::Timeout(ref v)) if !v.is_empty() => match v[0] {
                DavTimeout::Seconds(n) => Duration::from_secs(n as u64),
                DavTimeout::Infinite => self.default_lock_timeout,
            },
            _ => self.default_lock_timeout,
        }
    }

    pub(crate) async fn handle_lock(
        &self,
        req: &Request<()>,
        path: &DavPath,
        xmldata: &[u8],
    ) -> DavResult<Response<Body>> {
        let timeout = self.lock_timeout(req);

        // no body means refresh.
        if xmldata.is_empty() {
            let tokens = submitted_tokens(req);
            if tokens.len() != 1 {
                return Err(DavError::Status(StatusCode::BAD_REQUEST));
            }
            let lock = self
                .locks
                .refresh(path, &tokens[0], timeout)
                .map_err(|_| DavError::Status(StatusCode::PRECONDITION_FAILED))?;
            trace!("LOCK {}: refreshed {}", path, lock.token);
            return lock_response(&lock, None);
        }

        let deep = match req.headers().typed_get::<Depth>() {
            Some(Depth::Infinity) | None => true,
            Some(Depth::Zero) => false,
            Some(Depth::One) => return Err(DavError::Status(StatusCode::BAD_REQUEST)),
        };

        // decode the lockinfo body.
        let tree = Element::parse2(Cursor::new(xmldata))?;
        if !is_dav_elem(&tree, "lockinfo") {
            return Err(DavError::Status(StatusCode::CONFLICT));
        }
        let shared = match dav_child(&tree, "lockscope") {
            Some(scope) if dav_child(scope, "exclusive").is_some() => false,
            Some(scope) if dav_child(scope, "shared").is_some() => true,
            _ => return Err(DavError::Status(StatusCode::CONFLICT)),
        };
        match dav_child(&tree, "locktype") {
            Some(t) if dav_child(t, "write").is_some() => {}
            _ => return Err(DavError::Status(StatusCode::CONFLICT)),
        }
        let owner = dav_child(&tree, "owner").map(|o| {
            let mut o = o.clone();
            o.prefix = Some("d".to_string());
            o
        });

        let lock = self
            .locks
            .create(path, owner, shared, deep, timeout)
            .map_err(|conflict| {
                debug!("LOCK {}: conflicts with {}", path, conflict.token);
                DavError::Status(StatusCode::LOCKED)
            })?;

        // RFC 4918 7.3: locking an unmapped URL creates an empty
        // resource.
        if self.fs.node_type(path).await?.is_none() {
            if let Err(e) = self.fs.create(path, NodeKind::File).await {
                self.locks.unlock(path, &lock.token).ok();
                return Err(e.into());
            }
        }

        trace!("LOCK {}: created {}", path, lock.token);
        lock_response(&lock, Some(&lock.token))
    }

    pub(crate) async fn handle_unlock(
        &self,
        req: &Request<()>,
        path: &DavPath,
    ) -> DavResult<Response<Body>> {
        let header = req
            .headers()
            .typed_get::<davheaders::LockToken>()
            .ok_or(DavError::Status(StatusCode::BAD_REQUEST))?;
        let token = header.0.trim_matches(|c| c == '<' || c == '>');

        if self.fs.node_type(path).await?.is_none() {
            return Err(DavError::Status(StatusCode::NOT_FOUND));
        }

        match self.locks.unlock(path, token) {
            Ok(()) => {
                let mut res = Response::new(Body::empty());
                *res.status_mut() = StatusCode::NO_CONTENT;
                Ok(res)
            }
            Err(()) => Err(DavError::Status(StatusCode::CONFLICT)),
        }
    }
}

// 200 response with a d:prop/d:lockdiscovery body, plus the Lock-Token
// header for freshly created locks.
fn lock_response(lock: &DavLock, token_header: Option<&str>) -> DavResult<Response<Body>> {
    let mut res = Response::new(Body::empty());
    *res.status_mut() = StatusCode::OK;
    res.headers_mut().insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/xml; charset=utf-8"),
    );
    if let Some(token) = token_header {
        if let Ok(v) = HeaderValue::from_str(&format!("<{}>", token)) {
            res.headers_mut().insert("lock-token", v);
        }
    }

    let mut prop = Element::new2("d:prop").ns("d", NS_DAV_URI);
    let mut ldis = Element::new2("d:lockdiscovery");
    ldis.push_elem(active_lock_elem(lock));
    prop.push_elem(ldis);

    let mut buf = MemBuffer::new();
    let mut xw = emitter(&mut buf)?;
    prop.write_ev(&mut xw)?;
    drop(xw);
    let body = buf.take();
    res.headers_mut()
        .typed_insert(headers::ContentLength(body.len() as u64));
    *res.body_mut() = Body::from(body);
    Ok(res)
}

// d:activelock element for lockdiscovery.
pub(crate) fn active_lock_elem(lock: &DavLock) -> Element {
    let mut actlock = Element::new2("d:activelock");

    let mut scope = Element::new2("d:lockscope");
    scope.push_elem(match lock.shared {
        false => Element::new2("d:exclusive"),
        true => Element::new2("d:shared"),
    });
    actlock.push_elem(scope);

    let mut locktype = Element::new2("d:locktype");
    locktype.push_elem(Element::new2("d:write"));
    actlock.push_elem(locktype);

    actlock.push_elem(
        Element::new2("d:depth").text(if lock.deep { "infinity" } else { "0" }),
    );
    actlock.push_elem(
        Element::new2("d:timeout").text(format!("Second-{}", lock.timeout.as_secs())),
    );

    let mut token = Element::new2("d:locktoken");
    token.push_elem(Element::new2("d:href").text(lock.token.clone()));
    actlock.push_elem(token);

    let mut root = Element::new2("d:lockroot");
    root.push_elem(Element::new2("d:href").text(lock.path.as_url_string_with_prefix()));
    actlock.push_elem(root);

    if let Some(ref owner) = lock.owner {
        actlock.push_elem(owner.clone());
    }
    actlock
}

// d:lockdiscovery contents for PROPFIND.
pub(crate) fn lockdiscovery_elem(locks: &LockManager, path: &DavPath) -> Element {
    let mut elem = Element::new2("d:lockdiscovery");
    for lock in locks.discover(path) {
        elem.push_elem(active_lock_elem(&lock));
    }
    elem
}

// d:supportedlock: we advertise exclusive and shared write locks.
pub(crate) fn supportedlock_elem() -> Element {
    let mut elem = Element::new2("d:supportedlock");
    for scope in ["d:exclusive", "d:shared"] {
        let mut entry = Element::new2("d:lockentry");
        let mut lockscope = Element::new2("d:lockscope");
        lockscope.push_elem(Element::new2(scope));
        entry.push_elem(lockscope);
        let mut locktype = Element::new2("d:locktype");
        locktype.push_elem(Element::new2("d:write"));
        entry.push_elem(locktype);
        elem.push_elem(entry);
    }
    elem
}
