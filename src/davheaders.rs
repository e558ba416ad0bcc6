//! Typed versions of the WebDAV request headers.
use std::sync::OnceLock;

use headers::Header;
use http::header::{HeaderName, HeaderValue};

// helper.
fn one<'i, I>(values: &mut I) -> Result<&'i HeaderValue, headers::Error>
where
    I: Iterator<Item = &'i HeaderValue>,
{
    let v = values.next().ok_or_else(invalid)?;
    if values.next().is_some() {
        Err(invalid())
    } else {
        Ok(v)
    }
}

// helper.
fn invalid() -> headers::Error {
    headers::Error::invalid()
}

// helper.
fn map_invalid(_e: impl std::error::Error) -> headers::Error {
    headers::Error::invalid()
}

macro_rules! string_header {
    ($tname:ident, $sname:expr) => {
        #[derive(Debug, Clone, PartialEq)]
        pub(crate) struct $tname(pub String);

        impl Header for $tname {
            fn name() -> &'static HeaderName {
                static NAME: OnceLock<HeaderName> = OnceLock::new();
                NAME.get_or_init(|| HeaderName::from_static($sname))
            }

            fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
            where
                I: Iterator<Item = &'i HeaderValue>,
            {
                one(values)?
                    .to_str()
                    .map(|x| $tname(x.to_owned()))
                    .map_err(map_invalid)
            }

            fn encode<E>(&self, values: &mut E)
            where
                E: Extend<HeaderValue>,
            {
                if let Ok(value) = HeaderValue::from_str(&self.0) {
                    values.extend(std::iter::once(value));
                }
            }
        }
    };
}

string_header!(Destination, "destination");
string_header!(LockToken, "lock-token");

/// Depth: header.
#[derive(Debug, Copy, Clone, PartialEq)]
pub(crate) enum Depth {
    Zero,
    One,
    Infinity,
}

impl Header for Depth {
    fn name() -> &'static HeaderName {
        static NAME: OnceLock<HeaderName> = OnceLock::new();
        NAME.get_or_init(|| HeaderName::from_static("depth"))
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        match one(values)?.as_bytes() {
            b"0" => Ok(Depth::Zero),
            b"1" => Ok(Depth::One),
            b"infinity" | b"Infinity" => Ok(Depth::Infinity),
            _ => Err(invalid()),
        }
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        let value = match *self {
            Depth::Zero => "0",
            Depth::One => "1",
            Depth::Infinity => "Infinity",
        };
        values.extend(std::iter::once(HeaderValue::from_static(value)));
    }
}

/// One element of a Timeout: header.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum DavTimeout {
    Seconds(u32),
    Infinite,
}

/// Timeout: header, e.g. `Second-3600` or `Infinite, Second-604800`.
#[derive(Debug, Clone)]
pub(crate) struct Timeout(pub Vec<DavTimeout>);

impl Header for Timeout {
    fn name() -> &'static HeaderName {
        static NAME: OnceLock<HeaderName> = OnceLock::new();
        NAME.get_or_init(|| HeaderName::from_static("timeout"))
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let mut v = Vec::new();
        for word in one(values)?.to_str().map_err(map_invalid)?.split(',') {
            let word = word.trim();
            let w = match word {
                "Infinite" => DavTimeout::Infinite,
                _ if word.starts_with("Second-") => match word[7..].parse::<u32>() {
                    Err(_) => return Err(invalid()),
                    Ok(n) => DavTimeout::Seconds(n),
                },
                _ => return Err(invalid()),
            };
            v.push(w);
        }
        if v.is_empty() {
            return Err(invalid());
        }
        Ok(Timeout(v))
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        let value = self
            .0
            .iter()
            .map(|t| match t {
                DavTimeout::Seconds(n) => format!("Second-{}", n),
                DavTimeout::Infinite => "Infinite".to_string(),
            })
            .collect::<Vec<_>>()
            .join(", ");
        if let Ok(value) = HeaderValue::from_str(&value) {
            values.extend(std::iter::once(value));
        }
    }
}

/// Overwrite: header, `T` or `F`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Overwrite(pub bool);

impl Header for Overwrite {
    fn name() -> &'static HeaderName {
        static NAME: OnceLock<HeaderName> = OnceLock::new();
        NAME.get_or_init(|| HeaderName::from_static("overwrite"))
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        match one(values)?.as_bytes() {
            b"F" => Ok(Overwrite(false)),
            b"T" => Ok(Overwrite(true)),
            _ => Err(invalid()),
        }
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        let value = if self.0 { "T" } else { "F" };
        values.extend(std::iter::once(HeaderValue::from_static(value)));
    }
}

/// One byte range from a Range: header.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum ByteRangeSpec {
    /// `a-b`, inclusive.
    FromTo(u64, u64),
    /// `a-`.
    AllFrom(u64),
    /// `-n`, the last n bytes.
    Last(u64),
}

/// Range: header. Only a single byte range is supported; anything else
/// is a decode error, which the GET handler answers with 416.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Range(pub ByteRangeSpec);

impl Header for Range {
    fn name() -> &'static HeaderName {
        &http::header::RANGE
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let s = one(values)?.to_str().map_err(map_invalid)?;
        let s = s.strip_prefix("bytes=").ok_or_else(invalid)?;
        if s.contains(',') {
            return Err(invalid());
        }
        let nums = s.split('-').collect::<Vec<&str>>();
        if nums.len() != 2 {
            return Err(invalid());
        }
        let spec = match (nums[0].is_empty(), nums[1].is_empty()) {
            (false, false) => {
                let a = nums[0].parse::<u64>().map_err(map_invalid)?;
                let b = nums[1].parse::<u64>().map_err(map_invalid)?;
                if a > b {
                    return Err(invalid());
                }
                ByteRangeSpec::FromTo(a, b)
            }
            (false, true) => ByteRangeSpec::AllFrom(nums[0].parse::<u64>().map_err(map_invalid)?),
            (true, false) => ByteRangeSpec::Last(nums[1].parse::<u64>().map_err(map_invalid)?),
            (true, true) => return Err(invalid()),
        };
        Ok(Range(spec))
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        let value = match self.0 {
            ByteRangeSpec::FromTo(a, b) => format!("bytes={}-{}", a, b),
            ByteRangeSpec::AllFrom(a) => format!("bytes={}-", a),
            ByteRangeSpec::Last(n) => format!("bytes=-{}", n),
        };
        if let Ok(value) = HeaderValue::from_str(&value) {
            values.extend(std::iter::once(value));
        }
    }
}

/// Content-Range: header on PUT, apache mod_dav style partial write.
/// `bytes start-end/total` with `*` for an unknown total.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ContentRange {
    pub start: u64,
    pub end:   u64,
    pub total: Option<u64>,
}

impl Header for ContentRange {
    fn name() -> &'static HeaderName {
        &http::header::CONTENT_RANGE
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let s = one(values)?.to_str().map_err(map_invalid)?;
        let s = s.strip_prefix("bytes ").ok_or_else(invalid)?;
        let (range, total) = s.split_once('/').ok_or_else(invalid)?;
        let (start, end) = range.split_once('-').ok_or_else(invalid)?;
        let start = start.parse::<u64>().map_err(map_invalid)?;
        let end = end.parse::<u64>().map_err(map_invalid)?;
        if start > end {
            return Err(invalid());
        }
        let total = match total {
            "*" => None,
            t => {
                let t = t.parse::<u64>().map_err(map_invalid)?;
                if t <= end {
                    return Err(invalid());
                }
                Some(t)
            }
        };
        Ok(ContentRange { start, end, total })
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        let total = match self.total {
            Some(t) => t.to_string(),
            None => "*".to_string(),
        };
        let value = format!("bytes {}-{}/{}", self.start, self.end, total);
        if let Ok(value) = HeaderValue::from_str(&value) {
            values.extend(std::iter::once(value));
        }
    }
}

/// The If: header contains lists whose results are ORed.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct If(pub Vec<IfList>);

/// An IfList holds conditions whose results are ANDed, optionally
/// scoped to a tagged resource.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct IfList {
    pub resource:   Option<url::Url>,
    pub conditions: Vec<IfCondition>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct IfCondition {
    pub not:  bool,
    pub item: IfItem,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum IfItem {
    /// A state token, e.g. `opaquelocktoken:...` from a `<...>` coded URL.
    Token(String),
    /// An entity tag in `[...]`, quotes included.
    ETag(String),
}

impl IfList {
    fn new() -> IfList {
        IfList {
            resource:   None,
            conditions: Vec::new(),
        }
    }
}

/// Collect every state token submitted anywhere in the header.
impl If {
    pub fn tokens(&self) -> Vec<String> {
        let mut v = Vec::new();
        for list in &self.0 {
            for cond in &list.conditions {
                if let IfItem::Token(ref t) = cond.item {
                    if !cond.not {
                        v.push(t.clone());
                    }
                }
            }
        }
        v
    }
}

// Tokenizer for the RFC 4918 §10.4 grammar.
#[derive(Debug, PartialEq)]
enum IfToken {
    ListOpen,
    ListClose,
    Not,
    Pointy(String),
    ETag(String),
    End,
}

fn is_if_whitespace(c: u8) -> bool {
    matches!(c, b' ' | b'\t' | b'\r' | b'\n')
}

// scan "<...>" or "[...]", quote-aware for etags.
fn scan_until(buf: &[u8], close: u8) -> Result<(String, &[u8]), headers::Error> {
    let mut quote = false;
    for (i, &c) in buf.iter().enumerate().skip(1) {
        if c == b'"' {
            quote = !quote;
        } else if c == close && !quote {
            let s = std::str::from_utf8(&buf[1..i]).map_err(map_invalid)?;
            return Ok((s.to_string(), &buf[i + 1..]));
        } else if is_if_whitespace(c) && close == b'>' {
            break;
        }
    }
    Err(invalid())
}

fn if_token(mut buf: &[u8]) -> Result<(IfToken, &[u8]), headers::Error> {
    while !buf.is_empty() && is_if_whitespace(buf[0]) {
        buf = &buf[1..];
    }
    if buf.is_empty() {
        return Ok((IfToken::End, buf));
    }
    match buf[0] {
        b'(' => Ok((IfToken::ListOpen, &buf[1..])),
        b')' => Ok((IfToken::ListClose, &buf[1..])),
        b'N' if buf.starts_with(b"Not") => Ok((IfToken::Not, &buf[3..])),
        b'<' => {
            let (s, rest) = scan_until(buf, b'>')?;
            Ok((IfToken::Pointy(s), rest))
        }
        b'[' => {
            let (s, rest) = scan_until(buf, b']')?;
            Ok((IfToken::ETag(s), rest))
        }
        _ => Err(invalid()),
    }
}

impl Header for If {
    fn name() -> &'static HeaderName {
        static NAME: OnceLock<HeaderName> = OnceLock::new();
        NAME.get_or_init(|| HeaderName::from_static("if"))
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let mut lists = Vec::new();
        let mut cur = IfList::new();
        let mut input = one(values)?.as_bytes();
        let mut in_list = false;
        let mut not = false;

        loop {
            let (tok, rest) = if_token(input)?;
            input = rest;
            match tok {
                IfToken::End => {
                    if in_list || lists.is_empty() {
                        return Err(invalid());
                    }
                    break;
                }
                IfToken::ListOpen if !in_list => in_list = true,
                IfToken::ListClose if in_list && !not => {
                    if cur.conditions.is_empty() {
                        return Err(invalid());
                    }
                    lists.push(cur);
                    cur = IfList::new();
                    in_list = false;
                }
                IfToken::Not if in_list && !not => not = true,
                IfToken::Pointy(s) => {
                    if in_list {
                        // a state token must at least look like a URI.
                        if !s.contains(':') {
                            return Err(invalid());
                        }
                        cur.conditions.push(IfCondition {
                            not,
                            item: IfItem::Token(s),
                        });
                        not = false;
                    } else {
                        // resource tag in front of the next list.
                        if cur.resource.is_some() || not {
                            return Err(invalid());
                        }
                        cur.resource = Some(url::Url::parse(&s).map_err(map_invalid)?);
                    }
                }
                IfToken::ETag(s) if in_list => {
                    cur.conditions.push(IfCondition {
                        not,
                        item: IfItem::ETag(s),
                    });
                    not = false;
                }
                _ => return Err(invalid()),
            }
        }
        Ok(If(lists))
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        // only ever decoded.
        values.extend(std::iter::once(HeaderValue::from_static("")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode<H: Header>(s: &'static str) -> Result<H, headers::Error> {
        let val = HeaderValue::from_static(s);
        let mut iter = std::iter::once(&val);
        H::decode(&mut iter)
    }

    #[test]
    fn range_forms() {
        assert_eq!(decode::<Range>("bytes=0-99").unwrap().0, ByteRangeSpec::FromTo(0, 99));
        assert_eq!(decode::<Range>("bytes=100-").unwrap().0, ByteRangeSpec::AllFrom(100));
        assert_eq!(decode::<Range>("bytes=-5").unwrap().0, ByteRangeSpec::Last(5));
        assert!(decode::<Range>("bytes=5-2").is_err());
        assert!(decode::<Range>("bytes=0-1,5-6").is_err());
        assert!(decode::<Range>("lines=1-2").is_err());
    }

    #[test]
    fn content_range_forms() {
        let cr = decode::<ContentRange>("bytes 10-19/30").unwrap();
        assert_eq!((cr.start, cr.end, cr.total), (10, 19, Some(30)));
        let cr = decode::<ContentRange>("bytes 0-4/*").unwrap();
        assert_eq!(cr.total, None);
        assert!(decode::<ContentRange>("bytes 5-2/10").is_err());
        assert!(decode::<ContentRange>("bytes 0-9/5").is_err());
    }

    #[test]
    fn timeout_forms() {
        let t = decode::<Timeout>("Second-600").unwrap();
        assert_eq!(t.0, vec![DavTimeout::Seconds(600)]);
        let t = decode::<Timeout>("Infinite, Second-4100000000").unwrap();
        assert_eq!(t.0[0], DavTimeout::Infinite);
        assert!(decode::<Timeout>("Minute-5").is_err());
    }

    #[test]
    fn if_header_grammar() {
        let h = decode::<If>("(<opaquelocktoken:deadbeef>)").unwrap();
        assert_eq!(h.0.len(), 1);
        assert_eq!(h.tokens(), vec!["opaquelocktoken:deadbeef".to_string()]);

        let h = decode::<If>(
            r#"<http://host/r1> (<urn:x> [W/"etag"]) (Not <urn:y> ["tag2"])"#,
        )
        .unwrap();
        assert_eq!(h.0.len(), 2);
        assert_eq!(h.0[0].resource.as_ref().unwrap().path(), "/r1");
        assert_eq!(h.0[1].conditions[0].not, true);
        // negated tokens are not "submitted"
        assert_eq!(h.tokens(), vec!["urn:x".to_string()]);

        assert!(decode::<If>("()").is_err());
        assert!(decode::<If>("no-parens").is_err());
        assert!(decode::<If>("(plainword)").is_err());
    }
}
