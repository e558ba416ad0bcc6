//! Canonical form of the path part of a request URL.
//!
//! Every inbound path (and every `Destination` path) is reduced to one
//! canonical key before it touches the filesystem or the lock indexes:
//! percent-decoded, slash-collapsed, `.`-free, `..`-free, with a leading
//! slash and no trailing slash except for the root itself.
use std::error::Error;

use percent_encoding as pct;

use crate::DavError;

// Encode all non-unreserved characters, except '/'.
// See RFC 3986, and https://en.wikipedia.org/wiki/Percent-encoding .
const PATH_ENCODE_SET: &pct::AsciiSet = &pct::NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// A normalized URL path, plus the mount prefix that was stripped off.
#[derive(Clone)]
pub struct DavPath {
    path:   Vec<u8>,
    prefix: String,
}

/// Error returned by the `DavPath` constructors.
#[derive(Debug)]
pub enum ParseError {
    /// cannot parse
    InvalidPath,
    /// outside of the configured prefix
    PrefixMismatch,
}

impl Error for ParseError {}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<ParseError> for DavError {
    fn from(e: ParseError) -> Self {
        match e {
            ParseError::InvalidPath => DavError::InvalidPath,
            ParseError::PrefixMismatch => DavError::IllegalPath,
        }
    }
}

// Reduce a raw URL path to its canonical decoded form:
// - raw path must be printable ascii and start with "/"
// - the query part is cut off, fragments are invalid
// - percent-decode first (spec'd order: a decoded '/' acts as a separator)
// - merge consecutive slashes, drop "." segments
// - ".." pops a segment where possible and is dropped at the root
// - no NUL in the result
// - no trailing slash, except for "/" itself
fn normalize_path(rp: &[u8]) -> Result<Vec<u8>, ParseError> {
    if rp.iter().any(|&x| !(32..=126).contains(&x)) {
        return Err(ParseError::InvalidPath);
    }

    let mut rawpath = rp;
    if let Some(pos) = rawpath.iter().position(|&x| x == b'?' || x == b'#') {
        if rawpath[pos] == b'#' {
            return Err(ParseError::InvalidPath);
        }
        rawpath = &rawpath[..pos];
    }

    if rawpath.is_empty() || rawpath[0] != b'/' {
        return Err(ParseError::InvalidPath);
    }

    let decoded: Vec<u8> = pct::percent_decode(rawpath).collect();
    if decoded.contains(&0) {
        return Err(ParseError::InvalidPath);
    }

    let mut segs: Vec<&[u8]> = Vec::new();
    for seg in decoded.split(|&c| c == b'/') {
        match seg {
            b"" | b"." => {}
            b".." => {
                segs.pop();
            }
            s => segs.push(s),
        }
    }

    let mut path = Vec::with_capacity(decoded.len());
    if segs.is_empty() {
        path.push(b'/');
    } else {
        for seg in segs {
            path.push(b'/');
            path.extend_from_slice(seg);
        }
    }
    Ok(path)
}

impl std::fmt::Display for DavPath {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.path))
    }
}

impl std::fmt::Debug for DavPath {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.prefix.is_empty() {
            write!(f, "{:?}", String::from_utf8_lossy(&self.path))
        } else {
            write!(f, "\"{}[{}]\"", self.prefix, String::from_utf8_lossy(&self.path))
        }
    }
}

impl PartialEq for DavPath {
    fn eq(&self, rhs: &DavPath) -> bool {
        self.path == rhs.path
    }
}

impl Eq for DavPath {}

impl std::hash::Hash for DavPath {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.path.hash(state)
    }
}

impl DavPath {
    /// From a URL-encoded path, without prefix stripping.
    pub fn new(src: &str) -> Result<DavPath, ParseError> {
        Ok(DavPath {
            path:   normalize_path(src.as_bytes())?,
            prefix: String::new(),
        })
    }

    /// From a URL-encoded path and a non-encoded prefix.
    pub fn from_str_and_prefix(src: &str, prefix: &str) -> Result<DavPath, ParseError> {
        let path = normalize_path(src.as_bytes())?;
        let pfx = if prefix.is_empty() {
            b"/".to_vec()
        } else {
            normalize_path(prefix.as_bytes()).map_err(|_| ParseError::PrefixMismatch)?
        };
        if pfx == b"/" {
            return Ok(DavPath {
                path,
                prefix: String::new(),
            });
        }
        if path == pfx {
            return Ok(DavPath {
                path:   b"/".to_vec(),
                prefix: String::from_utf8_lossy(&pfx).into_owned(),
            });
        }
        let mut full = pfx.clone();
        full.push(b'/');
        if !path.starts_with(&full) {
            return Err(ParseError::PrefixMismatch);
        }
        Ok(DavPath {
            path:   path[pfx.len()..].to_vec(),
            prefix: String::from_utf8_lossy(&pfx).into_owned(),
        })
    }

    /// From a request URI.
    pub fn from_uri(uri: &http::uri::Uri, prefix: &str) -> Result<DavPath, ParseError> {
        match uri.path() {
            path if path.starts_with('/') => DavPath::from_str_and_prefix(path, prefix),
            _ => Err(ParseError::InvalidPath),
        }
    }

    /// The decoded canonical path, no prefix, no trailing slash.
    pub fn as_bytes(&self) -> &[u8] {
        &self.path
    }

    /// The stripped-off URL prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Is this the root collection of the mount?
    pub fn is_root(&self) -> bool {
        self.path == b"/"
    }

    /// As URL-encoded string, without prefix.
    pub fn as_url_string(&self) -> String {
        pct::percent_encode(&self.path, PATH_ENCODE_SET).to_string()
    }

    /// As URL-encoded string, with prefix.
    pub fn as_url_string_with_prefix(&self) -> String {
        let mut s = self.prefix.clone();
        s.push_str(&self.as_url_string());
        s
    }

    /// Return the parent collection's path.
    pub fn parent(&self) -> DavPath {
        let mut segs: Vec<&[u8]> = self
            .path
            .split(|&c| c == b'/')
            .filter(|s| !s.is_empty())
            .collect();
        segs.pop();
        let mut path = Vec::new();
        if segs.is_empty() {
            path.push(b'/');
        } else {
            for seg in segs {
                path.push(b'/');
                path.extend_from_slice(seg);
            }
        }
        DavPath {
            path,
            prefix: self.prefix.clone(),
        }
    }

    /// Append one segment.
    pub fn push_segment(&mut self, seg: &[u8]) {
        if !self.is_root() {
            self.path.push(b'/');
        }
        self.path.extend_from_slice(seg);
    }

    /// Child of this path named `seg`.
    pub fn child(&self, seg: &[u8]) -> DavPath {
        let mut p = self.clone();
        p.push_segment(seg);
        p
    }

    /// The last segment of the path. Empty for the root.
    pub fn file_name(&self) -> &[u8] {
        self.path
            .split(|&c| c == b'/')
            .filter(|s| !s.is_empty())
            .last()
            .unwrap_or(b"")
    }

    /// The name a client sees for this resource: the last path segment,
    /// or "/" for the root.
    pub fn display_name(&self) -> String {
        if self.is_root() {
            "/".to_string()
        } else {
            String::from_utf8_lossy(self.file_name()).into_owned()
        }
    }

    /// True if `other` lies strictly below this path.
    pub fn is_ancestor_of(&self, other: &DavPath) -> bool {
        if self.is_root() {
            return !other.is_root();
        }
        other.path.len() > self.path.len()
            && other.path.starts_with(&self.path)
            && other.path[self.path.len()] == b'/'
    }

    /// MIME type by file extension, `application/octet-stream` fallback.
    pub(crate) fn mime_type_str(&self) -> &'static str {
        let name = self.file_name();
        let d = name.rsplitn(2, |&c| c == b'.').collect::<Vec<&[u8]>>();
        if d.len() > 1 {
            if let Ok(ext) = std::str::from_utf8(d[0]) {
                if let Some(t) = mime_guess::from_ext(ext).first_raw() {
                    return t;
                }
            }
        }
        "application/octet-stream"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(s: &str) -> String {
        DavPath::new(s).unwrap().to_string()
    }

    #[test]
    fn normalize() {
        assert_eq!(n("/"), "/");
        assert_eq!(n("/a/./b/../c"), "/a/c");
        assert_eq!(n("/.."), "/");
        assert_eq!(n("//a///b//"), "/a/b");
        assert_eq!(n("/a/"), "/a");
        assert_eq!(n("/a%20b"), "/a b");
        assert_eq!(n("/../../x"), "/x");
    }

    #[test]
    fn normalize_is_idempotent() {
        for s in ["/a/./b/../c", "/..", "//x//y/", "/a%2Fb"] {
            let once = DavPath::new(s).unwrap();
            let twice = DavPath::new(&once.as_url_string()).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!(DavPath::new("no-leading-slash").is_err());
        assert!(DavPath::new("/a\u{7f}").is_err());
        assert!(DavPath::new("/a#frag").is_err());
        assert!(DavPath::new("/a%00b").is_err());
    }

    #[test]
    fn prefix_stripping() {
        let p = DavPath::from_str_and_prefix("/dav/a/b", "/dav").unwrap();
        assert_eq!(p.as_bytes(), b"/a/b");
        assert_eq!(p.prefix(), "/dav");
        assert_eq!(p.as_url_string_with_prefix(), "/dav/a/b");

        let root = DavPath::from_str_and_prefix("/dav", "/dav").unwrap();
        assert!(root.is_root());

        let bare = DavPath::from_str_and_prefix("/a/b", "").unwrap();
        assert_eq!(bare.as_bytes(), b"/a/b");
        assert_eq!(bare.prefix(), "");

        assert!(DavPath::from_str_and_prefix("/other/a", "/dav").is_err());
    }

    #[test]
    fn ancestry() {
        let root = DavPath::new("/").unwrap();
        let a = DavPath::new("/a").unwrap();
        let ab = DavPath::new("/a/b").unwrap();
        let ax = DavPath::new("/ax").unwrap();
        assert!(root.is_ancestor_of(&a));
        assert!(a.is_ancestor_of(&ab));
        assert!(!a.is_ancestor_of(&ax));
        assert!(!a.is_ancestor_of(&a));
        assert_eq!(ab.parent(), a);
        assert_eq!(a.parent(), root);
    }

    #[test]
    fn display_names() {
        assert_eq!(DavPath::new("/").unwrap().display_name(), "/");
        assert_eq!(DavPath::new("/a/b.txt").unwrap().display_name(), "b.txt");
        assert_eq!(DavPath::new("/a/b.txt").unwrap().mime_type_str(), "text/plain");
        assert_eq!(DavPath::new("/a/b").unwrap().mime_type_str(), "application/octet-stream");
    }
}
