use bytes::Bytes;
use futures_channel::mpsc;
use futures_util::StreamExt;
use http::{Request, Response, StatusCode};
use http_body::Frame;
use http_body_util::StreamBody;

use davmount::{body::Body, memfs::MemFs, DavHandler};

fn server() -> DavHandler {
    DavHandler::builder().filesystem(MemFs::new()).build_handler()
}

fn request(method: &str, uri: &str) -> http::request::Builder {
    Request::builder().method(method).uri(uri)
}

async fn body_bytes(resp: Response<Body>) -> Vec<u8> {
    let mut body = resp.into_body();
    let mut data = Vec::new();
    while let Some(chunk) = body.next().await {
        data.extend_from_slice(&chunk.expect("error reading body stream"));
    }
    data
}

async fn body_string(resp: Response<Body>) -> String {
    String::from_utf8(body_bytes(resp).await).expect("body was not utf-8")
}

async fn put(dav: &DavHandler, uri: &str, data: &str) -> Response<Body> {
    dav.handle(
        request("PUT", uri)
            .body(Body::from(data.to_string()))
            .unwrap(),
    )
    .await
}

async fn get(dav: &DavHandler, uri: &str) -> Response<Body> {
    dav.handle(request("GET", uri).body(Body::empty()).unwrap())
        .await
}

const LOCKINFO_EXCLUSIVE: &str = r#"<?xml version="1.0" encoding="utf-8" ?>
<D:lockinfo xmlns:D="DAV:">
  <D:lockscope><D:exclusive/></D:lockscope>
  <D:locktype><D:write/></D:locktype>
  <D:owner><D:href>u</D:href></D:owner>
</D:lockinfo>"#;

const LOCKINFO_SHARED: &str = r#"<?xml version="1.0" encoding="utf-8" ?>
<d:lockinfo xmlns:d="DAV:">
  <d:lockscope><d:shared/></d:lockscope>
  <d:locktype><d:write/></d:locktype>
</d:lockinfo>"#;

fn lock_token(resp: &Response<Body>) -> String {
    resp.headers()
        .get("lock-token")
        .expect("no lock-token header")
        .to_str()
        .unwrap()
        .trim_matches(|c| c == '<' || c == '>')
        .to_string()
}

#[tokio::test]
async fn mkcol_put_get_roundtrip() {
    let dav = server();

    let resp = dav
        .handle(request("MKCOL", "/a").body(Body::empty()).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let resp = put(&dav, "/a/x", "hi").await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let etag = resp.headers().get("etag").unwrap().to_str().unwrap().to_string();
    assert!(etag.starts_with('"') && etag.ends_with('"'));

    let resp = get(&dav, "/a/x").await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get("etag").unwrap().to_str().unwrap(), etag);
    assert_eq!(body_string(resp).await, "hi");

    // the PROPFIND getetag matches the GET etag
    let resp = dav
        .handle(
            request("PROPFIND", "/a/x")
                .header("depth", "0")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::MULTI_STATUS);
    let inner = etag.trim_matches('"').to_string();
    let body = body_string(resp).await;
    assert!(body.contains("d:getetag"));
    assert!(body.contains(&inner));
}

#[tokio::test]
async fn mkcol_conflicts() {
    let dav = server();
    let resp = dav
        .handle(request("MKCOL", "/no/parent").body(Body::empty()).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    dav.handle(request("MKCOL", "/a").body(Body::empty()).unwrap()).await;
    let resp = dav
        .handle(request("MKCOL", "/a").body(Body::empty()).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn lock_protects_put() {
    let dav = server();
    dav.handle(request("MKCOL", "/a").body(Body::empty()).unwrap()).await;
    put(&dav, "/a/x", "hi").await;

    let resp = dav
        .handle(
            request("LOCK", "/a/x")
                .header("depth", "0")
                .header("timeout", "Second-60")
                .body(Body::from(LOCKINFO_EXCLUSIVE))
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let token = lock_token(&resp);
    assert!(token.starts_with("opaquelocktoken:"));
    let body = body_string(resp).await;
    assert!(body.contains("<d:lockdiscovery>"));
    assert!(body.contains(&token));

    // modification without the token is refused
    let resp = put(&dav, "/a/x", "no").await;
    assert_eq!(resp.status(), StatusCode::LOCKED);

    // a plain read of an exclusively locked file is refused too
    let resp = get(&dav, "/a/x").await;
    assert_eq!(resp.status(), StatusCode::LOCKED);

    // with the token the write goes through
    let resp = dav
        .handle(
            request("PUT", "/a/x")
                .header("lock-token", format!("<{}>", token))
                .body(Body::from("ok"))
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let resp = dav
        .handle(
            request("UNLOCK", "/a/x")
                .header("lock-token", format!("<{}>", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let resp = get(&dav, "/a/x").await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_string(resp).await, "ok");
}

#[tokio::test]
async fn deep_lock_covers_descendants() {
    let dav = server();
    dav.handle(request("MKCOL", "/a").body(Body::empty()).unwrap()).await;

    let resp = dav
        .handle(
            request("LOCK", "/a")
                .header("depth", "infinity")
                .body(Body::from(LOCKINFO_EXCLUSIVE))
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let token = lock_token(&resp);

    let resp = put(&dav, "/a/b/c", "x").await;
    assert_eq!(resp.status(), StatusCode::LOCKED);

    let resp = dav
        .handle(
            request("PUT", "/a/b/c")
                .header("if", format!("(<{}>)", token))
                .body(Body::from("x"))
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn shared_locks_coexist() {
    let dav = server();
    put(&dav, "/f", "x").await;

    let r1 = dav
        .handle(request("LOCK", "/f").body(Body::from(LOCKINFO_SHARED)).unwrap())
        .await;
    assert_eq!(r1.status(), StatusCode::OK);
    let r2 = dav
        .handle(request("LOCK", "/f").body(Body::from(LOCKINFO_SHARED)).unwrap())
        .await;
    assert_eq!(r2.status(), StatusCode::OK);

    let r3 = dav
        .handle(request("LOCK", "/f").body(Body::from(LOCKINFO_EXCLUSIVE)).unwrap())
        .await;
    assert_eq!(r3.status(), StatusCode::LOCKED);
}

#[tokio::test]
async fn lock_without_body_is_bad_request() {
    let dav = server();
    put(&dav, "/f", "x").await;
    let resp = dav
        .handle(request("LOCK", "/f").body(Body::empty()).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn lock_refresh_by_token() {
    let dav = server();
    put(&dav, "/f", "x").await;
    let resp = dav
        .handle(
            request("LOCK", "/f")
                .header("timeout", "Second-60")
                .body(Body::from(LOCKINFO_EXCLUSIVE))
                .unwrap(),
        )
        .await;
    let token = lock_token(&resp);

    let resp = dav
        .handle(
            request("LOCK", "/f")
                .header("timeout", "Second-120")
                .header("if", format!("(<{}>)", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(body_string(resp).await.contains("Second-120"));
}

#[tokio::test]
async fn lock_on_unmapped_url_creates_resource() {
    let dav = server();
    let resp = dav
        .handle(request("LOCK", "/new").body(Body::from(LOCKINFO_EXCLUSIVE)).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let token = lock_token(&resp);

    let resp = dav
        .handle(
            request("GET", "/new")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    // exclusive lock blocks the read, but the resource exists now
    assert_eq!(resp.status(), StatusCode::LOCKED);

    let resp = dav
        .handle(
            request("UNLOCK", "/new")
                .header("lock-token", format!("<{}>", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert_eq!(get(&dav, "/new").await.status(), StatusCode::OK);
}

#[tokio::test]
async fn unlock_errors() {
    let dav = server();
    let resp = dav
        .handle(
            request("UNLOCK", "/missing")
                .header("lock-token", "<opaquelocktoken:nope>")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    put(&dav, "/f", "x").await;
    let resp = dav
        .handle(
            request("UNLOCK", "/f")
                .header("lock-token", "<opaquelocktoken:nope>")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    // missing Lock-Token header at all
    let resp = dav
        .handle(request("UNLOCK", "/f").body(Body::empty()).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn move_then_propfind() {
    let dav = server();
    dav.handle(request("MKCOL", "/a").body(Body::empty()).unwrap()).await;
    put(&dav, "/a/x", "ok").await;

    let resp = dav
        .handle(
            request("MOVE", "/a/x")
                .header("host", "localhost")
                .header("destination", "http://localhost/a/y")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    assert_eq!(get(&dav, "/a/x").await.status(), StatusCode::NOT_FOUND);
    let resp = get(&dav, "/a/y").await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_string(resp).await, "ok");

    let resp = dav
        .handle(
            request("PROPFIND", "/a")
                .header("depth", "1")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::MULTI_STATUS);
    let body = body_string(resp).await;
    assert!(body.contains("<d:href>/a</d:href>"));
    assert!(body.contains("<d:href>/a/y</d:href>"));
    assert!(body.contains("<d:collection"));
}

#[tokio::test]
async fn move_to_foreign_host_is_refused() {
    let dav = server();
    put(&dav, "/x", "data").await;
    let resp = dav
        .handle(
            request("MOVE", "/x")
                .header("host", "localhost")
                .header("destination", "http://elsewhere.example/x")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn move_migrates_locks() {
    let dav = server();
    dav.handle(request("MKCOL", "/m").body(Body::empty()).unwrap()).await;
    put(&dav, "/m/src", "v").await;

    let resp = dav
        .handle(request("LOCK", "/m/src").body(Body::from(LOCKINFO_EXCLUSIVE)).unwrap())
        .await;
    let token = lock_token(&resp);

    let resp = dav
        .handle(
            request("MOVE", "/m/src")
                .header("destination", "/m/dst")
                .header("if", format!("(<{}>)", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    // the lock followed the resource: dst is protected, src is free
    let resp = put(&dav, "/m/dst", "w").await;
    assert_eq!(resp.status(), StatusCode::LOCKED);
    let resp = put(&dav, "/m/src", "fresh").await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let resp = dav
        .handle(
            request("UNLOCK", "/m/dst")
                .header("lock-token", format!("<{}>", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn copy_preserves_content_not_etag() {
    let dav = server();
    put(&dav, "/src", "payload").await;

    let resp = dav
        .handle(
            request("COPY", "/src")
                .header("destination", "/dst")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let resp = dav
        .handle(
            request("COPY", "/dst")
                .header("destination", "/dst2")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let r1 = get(&dav, "/dst").await;
    let e1 = r1.headers().get("etag").unwrap().to_str().unwrap().to_string();
    assert_eq!(body_string(r1).await, "payload");
    let r2 = get(&dav, "/dst2").await;
    let e2 = r2.headers().get("etag").unwrap().to_str().unwrap().to_string();
    assert_eq!(body_string(r2).await, "payload");
    assert_ne!(e1, e2);

    // Overwrite: F refuses an existing destination
    let resp = dav
        .handle(
            request("COPY", "/src")
                .header("destination", "/dst")
                .header("overwrite", "F")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::PRECONDITION_FAILED);
}

#[tokio::test]
async fn delete_rules() {
    let dav = server();

    let resp = dav
        .handle(request("DELETE", "/").body(Body::empty()).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let resp = dav
        .handle(request("DELETE", "/missing").body(Body::empty()).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    dav.handle(request("MKCOL", "/d").body(Body::empty()).unwrap()).await;
    put(&dav, "/d/f", "x").await;

    let resp = dav
        .handle(request("LOCK", "/d/f").body(Body::from(LOCKINFO_EXCLUSIVE)).unwrap())
        .await;
    let token = lock_token(&resp);

    // deleting the collection without the descendant's token fails
    let resp = dav
        .handle(request("DELETE", "/d").body(Body::empty()).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::LOCKED);

    // a tagged list names the locked resource, the token authorizes
    // the whole subtree delete
    let resp = dav
        .handle(
            request("DELETE", "/d")
                .header("if", format!("<http://localhost/d/f> (<{}>)", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let resp = dav
        .handle(request("PROPFIND", "/d").body(Body::empty()).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    // the dead lock went with the subtree; a fresh lock works
    let resp = dav
        .handle(request("LOCK", "/d/f").body(Body::from(LOCKINFO_EXCLUSIVE)).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn range_requests() {
    let dav = server();
    let big = "A".repeat(4000);
    put(&dav, "/big", &big).await;

    let resp = dav
        .handle(
            request("GET", "/big")
                .header("range", "bytes=-100")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        resp.headers().get("content-range").unwrap().to_str().unwrap(),
        "bytes 3900-3999/4000"
    );
    let data = body_bytes(resp).await;
    assert_eq!(data.len(), 100);
    assert!(data.iter().all(|&b| b == b'A'));

    let resp = dav
        .handle(
            request("GET", "/big")
                .header("range", "bytes=5000-")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(
        resp.headers().get("content-range").unwrap().to_str().unwrap(),
        "bytes */4000"
    );

    // a suffix of zero bytes is unsatisfiable
    let resp = dav
        .handle(
            request("GET", "/big")
                .header("range", "bytes=-0")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE);

    // single byte of a single-byte file
    put(&dav, "/one", "Z").await;
    let resp = dav
        .handle(
            request("GET", "/one")
                .header("range", "bytes=0-0")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(body_bytes(resp).await, b"Z");
}

#[tokio::test]
async fn content_range_put_zero_pads() {
    let dav = server();
    let resp = dav
        .handle(
            request("PUT", "/sparse")
                .header("content-range", "bytes 10-19/30")
                .body(Body::from("XXXXXXXXXX"))
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let resp = get(&dav, "/sparse").await;
    let data = body_bytes(resp).await;
    assert_eq!(data.len(), 30);
    assert_eq!(&data[..10], &[0u8; 10]);
    assert_eq!(&data[10..20], b"XXXXXXXXXX");
    assert_eq!(&data[20..], &[0u8; 10]);
}

#[tokio::test]
async fn proppatch_propfind_roundtrip() {
    let dav = server();
    put(&dav, "/f", "x").await;

    let update = r#"<?xml version="1.0" encoding="utf-8" ?>
<D:propertyupdate xmlns:D="DAV:" xmlns:Z="urn:example">
  <D:set><D:prop><Z:color>blue</Z:color></D:prop></D:set>
</D:propertyupdate>"#;
    let resp = dav
        .handle(request("PROPPATCH", "/f").body(Body::from(update)).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::MULTI_STATUS);
    assert!(body_string(resp).await.contains("200 OK"));

    let find = r#"<?xml version="1.0" encoding="utf-8" ?>
<D:propfind xmlns:D="DAV:" xmlns:Z="urn:example">
  <D:prop><Z:color/></D:prop>
</D:propfind>"#;
    let resp = dav
        .handle(request("PROPFIND", "/f").body(Body::from(find)).unwrap())
        .await;
    let body = body_string(resp).await;
    assert!(body.contains("blue"));
    assert!(body.contains("200 OK"));

    let remove = r#"<?xml version="1.0" encoding="utf-8" ?>
<D:propertyupdate xmlns:D="DAV:" xmlns:Z="urn:example">
  <D:remove><D:prop><Z:color/></D:prop></D:remove>
</D:propertyupdate>"#;
    let resp = dav
        .handle(request("PROPPATCH", "/f").body(Body::from(remove)).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::MULTI_STATUS);

    let resp = dav
        .handle(request("PROPFIND", "/f").body(Body::from(find)).unwrap())
        .await;
    let body = body_string(resp).await;
    assert!(body.contains("404"));
    assert!(!body.contains("blue"));
}

#[tokio::test]
async fn proppatch_live_property_is_forbidden() {
    let dav = server();
    put(&dav, "/f", "x").await;

    let update = r#"<?xml version="1.0" encoding="utf-8" ?>
<D:propertyupdate xmlns:D="DAV:" xmlns:Z="urn:example">
  <D:set><D:prop>
    <D:getetag>"fake"</D:getetag>
    <Z:other>v</Z:other>
  </D:prop></D:set>
</D:propertyupdate>"#;
    let resp = dav
        .handle(request("PROPPATCH", "/f").body(Body::from(update)).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::MULTI_STATUS);
    let body = body_string(resp).await;
    assert!(body.contains("403"));
    assert!(body.contains("424"));

    // nothing was applied
    let find = r#"<propfind><prop><other xmlns="urn:example"/></prop></propfind>"#;
    let resp = dav
        .handle(request("PROPFIND", "/f").body(Body::from(find)).unwrap())
        .await;
    assert!(body_string(resp).await.contains("404"));
}

#[tokio::test]
async fn propfind_shapes() {
    let dav = server();
    put(&dav, "/f.txt", "hello").await;

    // allprop (empty body)
    let resp = dav
        .handle(
            request("PROPFIND", "/f.txt")
                .header("depth", "0")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    let body = body_string(resp).await;
    assert!(body.contains("<d:getcontentlength>5</d:getcontentlength>"));
    assert!(body.contains("<d:getcontenttype>text/plain</d:getcontenttype>"));
    assert!(body.contains("<d:displayname>f.txt</d:displayname>"));
    assert!(body.contains("<d:ishidden>0</d:ishidden>"));
    assert!(body.contains("<d:isreadonly>0</d:isreadonly>"));
    assert!(body.contains("d:supportedlock"));

    // propname: names only, no values
    let propname = r#"<D:propfind xmlns:D="DAV:"><D:propname/></D:propfind>"#;
    let resp = dav
        .handle(request("PROPFIND", "/f.txt").body(Body::from(propname)).unwrap())
        .await;
    let body = body_string(resp).await;
    assert!(body.contains("d:getcontentlength"));
    assert!(!body.contains(">5<"));

    // 404 if the target is missing
    let resp = dav
        .handle(request("PROPFIND", "/gone").body(Body::empty()).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn options_advertises_class_2() {
    let dav = server();
    let resp = dav
        .handle(request("OPTIONS", "/").body(Body::empty()).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get("dav").unwrap().to_str().unwrap(), "1, 2");
    assert_eq!(resp.headers().get("ms-author-via").unwrap().to_str().unwrap(), "DAV");
    assert_eq!(resp.headers().get("accept-ranges").unwrap().to_str().unwrap(), "bytes");
    let allow = resp.headers().get("allow").unwrap().to_str().unwrap().to_string();
    for m in ["PROPFIND", "LOCK", "MKCOL", "COPY", "MOVE"] {
        assert!(allow.contains(m), "{} missing from Allow", m);
    }
}

#[tokio::test]
async fn collection_get_lists_members() {
    let dav = server();
    dav.handle(request("MKCOL", "/dir").body(Body::empty()).unwrap()).await;
    put(&dav, "/dir/file.txt", "x").await;
    dav.handle(request("MKCOL", "/dir/sub").body(Body::empty()).unwrap()).await;

    let resp = get(&dav, "/dir").await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/html"));
    let body = body_string(resp).await;
    assert!(body.contains("file.txt"));
    assert!(body.contains("href=\"/dir/sub\""));
}

#[tokio::test]
async fn unknown_method_is_405() {
    let dav = server();
    let resp = dav
        .handle(request("BREW", "/").body(Body::empty()).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn basic_auth_challenge() {
    use headers::{Authorization, HeaderMapExt};

    let dav = DavHandler::builder()
        .filesystem(MemFs::new())
        .auth_realm("files")
        .auth_user("alice", "secret")
        .build_handler();

    let resp = dav
        .handle(request("OPTIONS", "/").body(Body::empty()).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        resp.headers().get("www-authenticate").unwrap().to_str().unwrap(),
        "Basic realm=\"files\""
    );

    let mut req = request("OPTIONS", "/").body(Body::empty()).unwrap();
    req.headers_mut()
        .typed_insert(Authorization::basic("alice", "secret"));
    let resp = dav.handle(req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let mut req = request("OPTIONS", "/").body(Body::empty()).unwrap();
    req.headers_mut()
        .typed_insert(Authorization::basic("alice", "wrong"));
    let resp = dav.handle(req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn custom_headers_and_prefix() {
    let dav = DavHandler::builder()
        .filesystem(MemFs::new())
        .strip_prefix("/dav")
        .custom_response_header(
            http::header::HeaderName::from_static("x-served-by"),
            http::HeaderValue::from_static("davmount"),
        )
        .build_handler();

    let resp = dav
        .handle(request("PUT", "/dav/f").body(Body::from("x")).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    assert_eq!(
        resp.headers().get("x-served-by").unwrap().to_str().unwrap(),
        "davmount"
    );

    // outside the prefix there is nothing
    let resp = dav
        .handle(request("GET", "/elsewhere/f").body(Body::empty()).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    // hrefs carry the prefix
    let resp = dav
        .handle(
            request("PROPFIND", "/dav/f")
                .header("depth", "0")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert!(body_string(resp).await.contains("<d:href>/dav/f</d:href>"));
}

#[tokio::test]
async fn cors_preflight_and_simple_requests() {
    let dav = DavHandler::builder()
        .filesystem(MemFs::new())
        .cors(davmount::CorsConfig {
            origins: vec!["http://app.example".to_string()],
            methods: Vec::new(),
            headers: Vec::new(),
            credentials: true,
        })
        .build_handler();

    let resp = dav
        .handle(
            request("OPTIONS", "/")
                .header("origin", "http://app.example")
                .header("access-control-request-method", "PROPFIND")
                .header("access-control-request-headers", "depth, content-type")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("access-control-allow-origin").unwrap().to_str().unwrap(),
        "http://app.example"
    );
    let methods = resp
        .headers()
        .get("access-control-allow-methods")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(methods.contains("PROPFIND") && methods.contains("LOCK"));
    let allow_headers = resp
        .headers()
        .get("access-control-allow-headers")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(allow_headers.contains("depth"));
    assert_eq!(
        resp.headers().get("access-control-allow-credentials").unwrap().to_str().unwrap(),
        "true"
    );

    // simple request: origin echoed on the normal response
    let resp = dav
        .handle(
            request("OPTIONS", "/")
                .header("origin", "http://app.example")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("access-control-allow-origin").unwrap().to_str().unwrap(),
        "http://app.example"
    );

    // a foreign origin gets no CORS headers
    let resp = dav
        .handle(
            request("OPTIONS", "/")
                .header("origin", "http://evil.example")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert!(resp.headers().get("access-control-allow-origin").is_none());
}

#[tokio::test]
async fn concurrent_puts_do_not_interleave() {
    let dav = server();

    // first PUT: a body fed chunk by chunk over a channel, so the
    // write stream lock stays held while we poke at the same path.
    let (tx, rx) = mpsc::unbounded::<Result<Frame<Bytes>, std::io::Error>>();
    let slow_req = request("PUT", "/c").body(StreamBody::new(rx)).unwrap();
    let dav2 = dav.clone();
    let first = tokio::spawn(async move { dav2.handle(slow_req).await });

    tx.unbounded_send(Ok(Frame::data(Bytes::from_static(b"AAAA")))).unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    // second PUT loses the race
    let resp = put(&dav, "/c", "BBBB").await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(resp.headers().get("retry-after").unwrap().to_str().unwrap(), "1");

    // concurrent read is refused as well while the write runs
    let resp = get(&dav, "/c").await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    tx.unbounded_send(Ok(Frame::data(Bytes::from_static(b"AAAA")))).unwrap();
    drop(tx);
    let resp = first.await.unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);

    // the winner's content survived intact
    let resp = get(&dav, "/c").await;
    assert_eq!(body_string(resp).await, "AAAAAAAA");
}

#[tokio::test]
async fn concurrent_reads_share_the_stream_lock() {
    let dav = server();
    put(&dav, "/f", "data").await;

    let r1 = get(&dav, "/f").await;
    assert_eq!(r1.status(), StatusCode::OK);
    // r1's body (and read lock) is still alive here
    let r2 = get(&dav, "/f").await;
    assert_eq!(r2.status(), StatusCode::OK);
    assert_eq!(body_string(r1).await, "data");
    assert_eq!(body_string(r2).await, "data");
}
