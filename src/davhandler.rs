//! The main entry point of the library: DavHandler.
use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use bytes::Buf;
use futures_util::StreamExt;
use headers::authorization::Basic;
use headers::{
    AccessControlAllowCredentials, AccessControlAllowHeaders, AccessControlAllowMethods,
    AccessControlAllowOrigin, Authorization, Header, HeaderMapExt,
};
use http::header::{HeaderName, HeaderValue};
use http::{Method, Request, Response, StatusCode};
use log::debug;

use crate::body::{incoming, Body, InStream};
use crate::davpath::DavPath;
use crate::errors::DavError;
use crate::fs::DavFileSystem;
use crate::locks::LockManager;
use crate::util::{dav_method, DavMethod, DavMethodSet};
use crate::DavResult;

const DEFAULT_MAX_REQUEST_BYTES: usize = 65536;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(3600);

/// The webdav handler.
///
/// Cheap to clone; build one with [`DavHandler::builder`] and call
/// [`handle`](DavHandler::handle) for every request the host framework
/// routes below the mount prefix.
#[derive(Clone)]
pub struct DavHandler {
    config: Arc<DavConfig>,
}

/// CORS settings applied by the handler chain.
#[derive(Debug, Clone, Default)]
pub struct CorsConfig {
    /// Allowed `Origin` values; `*` allows any.
    pub origins:     Vec<String>,
    /// Methods advertised on preflight. Empty means all supported.
    pub methods:     Vec<String>,
    /// Headers advertised on preflight. Empty echoes the request.
    pub headers:     Vec<String>,
    /// Whether `Access-Control-Allow-Credentials: true` is sent.
    pub credentials: bool,
}

/// Configuration of the handler, builder style.
pub struct DavConfig {
    pub(crate) prefix:               Option<String>,
    pub(crate) fs:                   Option<Box<dyn DavFileSystem>>,
    pub(crate) locks:                LockManager,
    pub(crate) allow:                Option<DavMethodSet>,
    pub(crate) request_timeout:      Option<Duration>,
    pub(crate) upload_timeout:       Option<Duration>,
    pub(crate) max_request_bytes:    usize,
    pub(crate) default_lock_timeout: Duration,
    pub(crate) auth_realm:           String,
    pub(crate) auth_users:           HashMap<String, String>,
    pub(crate) cors:                 Option<CorsConfig>,
    pub(crate) custom_headers:       Vec<(HeaderName, HeaderValue)>,
}

impl Default for DavConfig {
    fn default() -> Self {
        DavConfig {
            prefix:               None,
            fs:                   None,
            locks:                LockManager::new(),
            allow:                None,
            request_timeout:      Some(DEFAULT_REQUEST_TIMEOUT),
            upload_timeout:       Some(DEFAULT_UPLOAD_TIMEOUT),
            max_request_bytes:    DEFAULT_MAX_REQUEST_BYTES,
            default_lock_timeout: DEFAULT_LOCK_TIMEOUT,
            auth_realm:           "webdav".to_string(),
            auth_users:           HashMap::new(),
            cors:                 None,
            custom_headers:       Vec::new(),
        }
    }
}

impl DavConfig {
    /// New configuration builder.
    pub fn new() -> DavConfig {
        DavConfig::default()
    }

    /// Finish the builder.
    pub fn build_handler(self) -> DavHandler {
        DavHandler {
            config: Arc::new(self),
        }
    }

    /// Prefix to be stripped off the request path before it is handed
    /// to the filesystem and the lock manager.
    pub fn strip_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Set the filesystem backend.
    pub fn filesystem(mut self, fs: Box<dyn DavFileSystem>) -> Self {
        self.fs = Some(fs);
        self
    }

    /// Which methods to allow (default: all).
    pub fn allow_methods(mut self, allow: DavMethodSet) -> Self {
        self.allow = Some(allow);
        self
    }

    /// Deadline for non-upload requests. `None` disables it.
    pub fn request_timeout(mut self, d: Option<Duration>) -> Self {
        self.request_timeout = d;
        self
    }

    /// Inactivity window for PUT bodies, reset on every chunk.
    /// `None` disables it.
    pub fn upload_timeout(mut self, d: Option<Duration>) -> Self {
        self.upload_timeout = d;
        self
    }

    /// Upper bound on buffered XML request bodies.
    pub fn max_request_bytes(mut self, max: usize) -> Self {
        self.max_request_bytes = max;
        self
    }

    /// Lease time for locks taken without a Timeout header.
    pub fn default_lock_timeout(mut self, d: Duration) -> Self {
        self.default_lock_timeout = d;
        self
    }

    /// Realm reported in `WWW-Authenticate` challenges.
    pub fn auth_realm(mut self, realm: impl Into<String>) -> Self {
        self.auth_realm = realm.into();
        self
    }

    /// Add a username/password pair. Adding any enables basic auth.
    pub fn auth_user(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth_users.insert(user.into(), password.into());
        self
    }

    /// Enable CORS handling with the given settings.
    pub fn cors(mut self, cors: CorsConfig) -> Self {
        self.cors = Some(cors);
        self
    }

    /// Header added to every response.
    pub fn custom_response_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.custom_headers.push((name, value));
        self
    }
}

// Per-request view of the configuration.
pub(crate) struct DavInner {
    pub(crate) prefix:               String,
    pub(crate) fs:                   Box<dyn DavFileSystem>,
    pub(crate) locks:                LockManager,
    pub(crate) allow:                Option<DavMethodSet>,
    pub(crate) upload_timeout:       Option<Duration>,
    pub(crate) max_request_bytes:    usize,
    pub(crate) default_lock_timeout: Duration,
}

impl From<&DavConfig> for DavInner {
    fn from(cfg: &DavConfig) -> Self {
        DavInner {
            prefix:               cfg.prefix.clone().unwrap_or_default(),
            fs:                   cfg.fs.clone().expect("filesystem configured"),
            locks:                cfg.locks.clone(),
            allow:                cfg.allow,
            upload_timeout:       cfg.upload_timeout,
            max_request_bytes:    cfg.max_request_bytes,
            default_lock_timeout: cfg.default_lock_timeout,
        }
    }
}

impl DavHandler {
    /// A handler with an empty configuration.
    pub fn new() -> DavHandler {
        DavHandler {
            config: Arc::new(DavConfig::default()),
        }
    }

    /// Return a configuration builder.
    pub fn builder() -> DavConfig {
        DavConfig::new()
    }

    /// Stop the background lock-expiry sweep. Call this when taking
    /// the handler out of service; dropping the last clone also stops
    /// the sweep.
    pub fn close(&self) {
        self.config.locks.close();
    }

    /// Handle a webdav request.
    pub async fn handle<ReqBody>(&self, req: Request<ReqBody>) -> Response<Body>
    where
        ReqBody: http_body::Body + Send + 'static,
        ReqBody::Data: Buf + Send,
        ReqBody::Error: StdError + Send + Sync + 'static,
    {
        self.config.locks.ensure_sweeper();

        let (parts, body) = req.into_parts();
        let req = Request::from_parts(parts, ());
        let body = incoming(body);

        let origin = req.headers().get(http::header::ORIGIN).cloned();
        let mut resp = self.handle_checked(req, body).await;

        if let (Some(cors), Some(origin)) = (self.config.cors.as_ref(), origin.as_ref()) {
            apply_cors(cors, origin, &mut resp);
        }
        for (name, value) in &self.config.custom_headers {
            resp.headers_mut().insert(name.clone(), value.clone());
        }
        resp
    }

    // auth, preflight, timeout, then the method engine.
    async fn handle_checked(&self, req: Request<()>, body: InStream) -> Response<Body> {
        let cfg = &*self.config;

        if !cfg.auth_users.is_empty() {
            let authorized = req
                .headers()
                .typed_get::<Authorization<Basic>>()
                .map(|auth| cfg.auth_users.get(auth.username()).map(|p| p.as_str()) == Some(auth.password()))
                .unwrap_or(false);
            if !authorized {
                debug!("basic auth failure for {}", req.uri());
                return challenge_response(&cfg.auth_realm);
            }
        }

        if let Some(ref cors) = cfg.cors {
            let preflight = req.method() == Method::OPTIONS
                && req
                    .headers()
                    .contains_key(http::header::ACCESS_CONTROL_REQUEST_METHOD);
            if preflight {
                return preflight_response(cors, &req);
            }
        }

        if cfg.fs.is_none() {
            return status_response(StatusCode::NOT_FOUND);
        }
        let inner = DavInner::from(cfg);

        // uploads run under their own progressive deadline instead.
        let deadline = match dav_method(req.method()) {
            Ok(DavMethod::Put) => None,
            _ => cfg.request_timeout,
        };
        let fut = inner.handle_request(req, body);
        match deadline {
            Some(d) => match tokio::time::timeout(d, fut).await {
                Ok(resp) => resp,
                Err(_) => {
                    debug!("request deadline of {:?} expired", d);
                    status_response(StatusCode::REQUEST_TIMEOUT)
                }
            },
            None => fut.await,
        }
    }
}

impl Default for DavHandler {
    fn default() -> Self {
        DavHandler::new()
    }
}

fn status_response(status: StatusCode) -> Response<Body> {
    let mut resp = Response::new(Body::empty());
    *resp.status_mut() = status;
    resp.headers_mut().typed_insert(headers::ContentLength(0));
    resp
}

fn challenge_response(realm: &str) -> Response<Body> {
    let mut resp = status_response(StatusCode::UNAUTHORIZED);
    let value = HeaderValue::from_str(&format!("Basic realm=\"{}\"", realm))
        .unwrap_or_else(|_| HeaderValue::from_static("Basic"));
    resp.headers_mut().insert(http::header::WWW_AUTHENTICATE, value);
    resp
}

// Typed Access-Control-Allow-Origin for this request, if the origin is
// allowed: the wildcard from the configuration, or the request origin
// echoed back.
fn allow_origin(cors: &CorsConfig, origin: &HeaderValue) -> Option<AccessControlAllowOrigin> {
    if cors.origins.iter().any(|a| a == "*") {
        return Some(AccessControlAllowOrigin::ANY);
    }
    let o = origin.to_str().ok()?;
    if cors.origins.iter().any(|a| a == o) {
        return AccessControlAllowOrigin::decode(&mut std::iter::once(origin)).ok();
    }
    None
}

fn apply_cors(cors: &CorsConfig, origin: &HeaderValue, resp: &mut Response<Body>) {
    let allowed = match allow_origin(cors, origin) {
        Some(a) => a,
        None => return,
    };
    resp.headers_mut().typed_insert(allowed);
    if cors.credentials {
        resp.headers_mut().typed_insert(AccessControlAllowCredentials);
    }
}

fn preflight_response(cors: &CorsConfig, req: &Request<()>) -> Response<Body> {
    let mut resp = status_response(StatusCode::OK);
    let allowed = match req
        .headers()
        .get(http::header::ORIGIN)
        .and_then(|origin| allow_origin(cors, origin))
    {
        Some(a) => a,
        None => return resp,
    };

    let methods = if cors.methods.is_empty() {
        crate::util::ALL_METHODS
            .iter()
            .filter_map(|m| Method::from_bytes(m.as_str().as_bytes()).ok())
            .collect::<AccessControlAllowMethods>()
    } else {
        cors.methods
            .iter()
            .filter_map(|m| Method::from_bytes(m.as_bytes()).ok())
            .collect::<AccessControlAllowMethods>()
    };
    let headers = if cors.headers.is_empty() {
        // echo whatever the client asked for.
        req.headers()
            .get(http::header::ACCESS_CONTROL_REQUEST_HEADERS)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .split(',')
            .filter_map(|name| name.trim().parse::<HeaderName>().ok())
            .collect::<AccessControlAllowHeaders>()
    } else {
        cors.headers
            .iter()
            .filter_map(|name| name.parse::<HeaderName>().ok())
            .collect::<AccessControlAllowHeaders>()
    };

    let h = resp.headers_mut();
    h.typed_insert(allowed);
    h.typed_insert(methods);
    h.typed_insert(headers);
    if cors.credentials {
        h.typed_insert(AccessControlAllowCredentials);
    }
    resp
}

impl DavInner {
    // Buffer a request body, bounded.
    pub(crate) async fn read_request(
        &self,
        mut body: InStream,
        max_size: usize,
    ) -> DavResult<Vec<u8>> {
        let mut data = Vec::new();
        while let Some(res) = body.next().await {
            let chunk = res?;
            if data.len() + chunk.len() > max_size {
                return Err(StatusCode::PAYLOAD_TOO_LARGE.into());
            }
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }

    pub(crate) async fn handle_request(self, req: Request<()>, body: InStream) -> Response<Body> {
        match self.dispatch(&req, body).await {
            Ok(resp) => {
                debug!("== END REQUEST result OK");
                resp
            }
            Err(err) => {
                debug!("== END REQUEST result {:?}", err);
                let mut resp = status_response(err.statuscode());
                if let DavError::Busy = err {
                    resp.headers_mut()
                        .insert(http::header::RETRY_AFTER, HeaderValue::from_static("1"));
                }
                resp
            }
        }
    }

    // the dispatcher.
    async fn dispatch(&self, req: &Request<()>, body: InStream) -> DavResult<Response<Body>> {
        let method = match dav_method(req.method()) {
            Ok(m) => m,
            Err(e) => {
                debug!("refusing method {} request {}", req.method(), req.uri());
                return Err(e);
            }
        };

        if let Some(ref allow) = self.allow {
            if !allow.contains(method) {
                debug!("method {} not allowed on request {}", req.method(), req.uri());
                return Err(DavError::Status(StatusCode::METHOD_NOT_ALLOWED));
            }
        }

        let path = DavPath::from_uri(req.uri(), &self.prefix)?;
        debug!("== START REQUEST {:?} {}", method, path);

        // PUT is the only method that streams its body; everything else
        // gets a bounded, pre-read buffer.
        let (body_strm, body_data) = match method {
            DavMethod::Put => (Some(body), Vec::new()),
            _ => (None, self.read_request(body, self.max_request_bytes).await?),
        };

        // Not all methods accept a body.
        match method {
            DavMethod::Put | DavMethod::PropFind | DavMethod::PropPatch | DavMethod::Lock => {}
            _ => {
                if !body_data.is_empty() {
                    return Err(StatusCode::UNSUPPORTED_MEDIA_TYPE.into());
                }
            }
        }

        match method {
            DavMethod::Options => self.handle_options(req, &path).await,
            DavMethod::PropFind => self.handle_propfind(req, &path, &body_data).await,
            DavMethod::PropPatch => self.handle_proppatch(req, &path, &body_data).await,
            DavMethod::MkCol => self.handle_mkcol(req, &path).await,
            DavMethod::Delete => self.handle_delete(req, &path).await,
            DavMethod::Lock => self.handle_lock(req, &path, &body_data).await,
            DavMethod::Unlock => self.handle_unlock(req, &path).await,
            DavMethod::Head | DavMethod::Get => self.handle_get(req, &path).await,
            DavMethod::Put => self.handle_put(req, &path, body_strm.unwrap()).await,
            DavMethod::Copy | DavMethod::Move => self.handle_copymove(req, &path, method).await,
        }
    }
}
