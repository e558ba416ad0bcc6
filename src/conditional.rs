//! Evaluation of the `If` request header (RFC 4918 §10.4), and
//! gathering of the lock tokens a request submits.
use headers::HeaderMapExt;
use http::{Request, StatusCode};

use crate::davheaders::{self, IfItem};
use crate::davpath::DavPath;
use crate::fs::DavFileSystem;
use crate::locks::LockManager;
use crate::{DavError, DavResult};

// Every state token the client submitted, through Lock-Token or
// anywhere in the If header. Authorization against the lock manager
// happens later, per operation.
pub(crate) fn submitted_tokens(req: &Request<()>) -> Vec<String> {
    let mut tokens = Vec::new();
    if let Some(t) = req.headers().typed_get::<davheaders::LockToken>() {
        tokens.push(t.0.trim_matches(|c| c == '<' || c == '>').to_string());
    }
    if let Some(ifh) = req.headers().typed_get::<davheaders::If>() {
        tokens.extend(ifh.tokens());
    }
    tokens
}

// The If header is a precondition: lists are ORed, conditions within a
// list are ANDed, and a token condition holds when the token is a live
// lock covering the list's target. If no list evaluates true, the
// request fails with 412.
pub(crate) async fn eval_if_header(
    req: &Request<()>,
    fs: &dyn DavFileSystem,
    locks: &LockManager,
    path: &DavPath,
) -> DavResult<()> {
    let ifh = match req.headers().typed_try_get::<davheaders::If>() {
        Ok(Some(h)) => h,
        Ok(None) => return Ok(()),
        Err(_) => return Err(DavError::Status(StatusCode::BAD_REQUEST)),
    };

    for list in &ifh.0 {
        let target = match list.resource {
            Some(ref url) => match DavPath::from_str_and_prefix(url.path(), path.prefix()) {
                Ok(p) => p,
                Err(_) => continue,
            },
            None => path.clone(),
        };
        let etag = match fs.metadata(&target).await {
            Ok(m) => Some(format!("\"{}\"", m.etag())),
            Err(_) => None,
        };
        let satisfied = list.conditions.iter().all(|c| {
            let holds = match &c.item {
                IfItem::Token(t) => locks.has_valid_token(&target, t),
                IfItem::ETag(t) => etag.as_deref() == Some(t.as_str()),
            };
            holds != c.not
        });
        if satisfied {
            return Ok(());
        }
    }
    Err(DavError::Status(StatusCode::PRECONDITION_FAILED))
}
