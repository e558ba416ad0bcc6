use std::collections::HashMap;
use std::io::Cursor;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use headers::HeaderMapExt;
use http::{HeaderValue, Request, Response, StatusCode};
use log::trace;
use xml::writer::EventWriter;
use xmltree::Element;

use crate::body::Body;
use crate::conditional::{eval_if_header, submitted_tokens};
use crate::davhandler::DavInner;
use crate::davheaders::Depth;
use crate::davpath::DavPath;
use crate::davxml::{dav_child, emitter, is_dav_elem, ElementExt, NS_DAV_URI};
use crate::fs::{DavMetaData, DavProp};
use crate::handle_lock::{lockdiscovery_elem, supportedlock_elem};
use crate::util::{systemtime_to_httpdate, systemtime_to_rfc3339, MemBuffer};
use crate::{DavError, DavResult};

// Live properties we compute from resource state. Everything else goes
// through the dead-property store.
const LIVE_PROPS: &[&str] = &[
    "creationdate",
    "displayname",
    "getcontentlength",
    "getcontenttype",
    "getetag",
    "getlastmodified",
    "ishidden",
    "isreadonly",
    "lockdiscovery",
    "resourcetype",
    "supportedlock",
];

// The three shapes of a PROPFIND request body.
#[derive(Debug, Clone)]
enum PropfindKind {
    AllProp,
    PropName,
    Prop(Vec<Element>),
}

fn is_live_prop(e: &Element) -> bool {
    e.namespace.as_deref().map_or(true, |ns| ns == NS_DAV_URI)
        && LIVE_PROPS.contains(&e.name.as_str())
}

fn parse_propfind(xmldata: &[u8]) -> DavResult<PropfindKind> {
    if xmldata.is_empty() {
        return Ok(PropfindKind::AllProp);
    }
    let tree = Element::parse2(Cursor::new(xmldata))?;
    if !is_dav_elem(&tree, "propfind") {
        return Err(DavError::XmlParseError);
    }
    if dav_child(&tree, "propname").is_some() {
        return Ok(PropfindKind::PropName);
    }
    if let Some(prop) = dav_child(&tree, "prop") {
        let wanted = prop.child_elems().into_iter().cloned().collect();
        return Ok(PropfindKind::Prop(wanted));
    }
    if dav_child(&tree, "allprop").is_some() {
        return Ok(PropfindKind::AllProp);
    }
    Err(DavError::XmlParseError)
}

// An element carrying just the requested property's name, used in 404
// propstat entries and propname listings.
fn prop_name_elem(e: &Element) -> Element {
    if is_live_prop(e) {
        return Element::new2(format!("d:{}", e.name).as_str());
    }
    let mut out = Element::new(&e.name);
    out.prefix = e.prefix.clone();
    out.namespace = e.namespace.clone();
    if let (Some(pfx), Some(ns)) = (e.prefix.as_deref(), e.namespace.as_deref()) {
        out = out.ns(pfx, ns);
    }
    out
}

fn davprop_from_elem(elem: &Element, with_value: bool) -> DavProp {
    let xml = if with_value {
        // make the serialized fragment self-contained: its namespace
        // must be declared on the fragment itself.
        let mut standalone = elem.clone();
        if let Some(ns) = standalone.namespace.clone() {
            let pfx = standalone.prefix.clone().unwrap_or_default();
            standalone = standalone.ns(pfx, ns);
        }
        let mut xw = EventWriter::new(Cursor::new(Vec::new()));
        standalone.write_ev(&mut xw).ok();
        Some(xw.into_inner().into_inner())
    } else {
        None
    };
    DavProp {
        name:      elem.name.clone(),
        prefix:    elem.prefix.clone(),
        namespace: elem.namespace.clone(),
        xml,
    }
}

fn davprop_to_element(prop: &DavProp) -> Element {
    if let Some(ref xml) = prop.xml {
        if let Ok(e) = Element::parse(Cursor::new(xml)) {
            return e;
        }
    }
    let mut elem = Element::new(&prop.name);
    elem.prefix = prop.prefix.clone();
    elem.namespace = prop.namespace.clone();
    if let (Some(pfx), Some(ns)) = (prop.prefix.as_deref(), prop.namespace.as_deref()) {
        elem = elem.ns(pfx, ns);
    }
    elem
}

// Accumulates multistatus responses into one buffered XML document.
struct PropWriter {
    xw: EventWriter<MemBuffer>,
}

impl PropWriter {
    fn new() -> DavResult<PropWriter> {
        let mut xw = emitter(MemBuffer::new())?;
        xw.write(xml::writer::XmlEvent::start_element("d:multistatus").ns("d", NS_DAV_URI))?;
        Ok(PropWriter { xw })
    }

    fn write_response(
        &mut self,
        path: &DavPath,
        propstats: &HashMap<StatusCode, Vec<Element>>,
    ) -> DavResult<()> {
        self.xw.write(xml::writer::XmlEvent::start_element("d:response"))?;
        Element::new2("d:href")
            .text(path.as_url_string_with_prefix())
            .write_ev(&mut self.xw)?;

        let mut statuses: Vec<&StatusCode> = propstats.keys().collect();
        statuses.sort();
        for status in statuses {
            self.xw.write(xml::writer::XmlEvent::start_element("d:propstat"))?;
            self.xw.write(xml::writer::XmlEvent::start_element("d:prop"))?;
            for elem in &propstats[status] {
                elem.write_ev(&mut self.xw)?;
            }
            self.xw.write(xml::writer::XmlEvent::end_element())?;
            Element::new2("d:status")
                .text(format!("HTTP/1.1 {}", status))
                .write_ev(&mut self.xw)?;
            self.xw.write(xml::writer::XmlEvent::end_element())?;
        }

        self.xw.write(xml::writer::XmlEvent::end_element())?;
        Ok(())
    }

    fn finish(mut self) -> DavResult<bytes::Bytes> {
        self.xw.write(xml::writer::XmlEvent::end_element())?;
        Ok(self.xw.into_inner().take())
    }
}

fn multistatus_response(body: bytes::Bytes) -> Response<Body> {
    let mut res = Response::new(Body::empty());
    *res.status_mut() = StatusCode::MULTI_STATUS;
    res.headers_mut().insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/xml; charset=utf-8"),
    );
    res.headers_mut()
        .typed_insert(headers::ContentLength(body.len() as u64));
    *res.body_mut() = Body::from(body);
    res
}

impl DavInner {
    // One live property, or None when it does not apply to this node.
    fn build_live_prop(
        &self,
        name: &str,
        path: &DavPath,
        meta: &dyn DavMetaData,
        content: bool,
    ) -> Option<Element> {
        let elem = Element::new2(format!("d:{}", name).as_str());
        if !content {
            return Some(elem);
        }
        let elem = match name {
            "creationdate" => elem.text(systemtime_to_rfc3339(meta.created())),
            "displayname" => elem.text(path.display_name()),
            "getcontentlength" => {
                if meta.is_collection() {
                    return None;
                }
                elem.text(meta.len().to_string())
            }
            "getcontenttype" => {
                if meta.is_collection() {
                    elem.text("httpd/unix-directory")
                } else {
                    elem.text(path.mime_type_str())
                }
            }
            "getetag" => elem.text(format!("\"{}\"", meta.etag())),
            "getlastmodified" => elem.text(systemtime_to_httpdate(meta.modified())),
            "ishidden" => elem.text("0"),
            "isreadonly" => elem.text("0"),
            "lockdiscovery" => return Some(lockdiscovery_elem(&self.locks, path)),
            "resourcetype" => {
                let mut elem = elem;
                if meta.is_collection() {
                    elem.push_elem(Element::new2("d:collection"));
                }
                elem
            }
            "supportedlock" => return Some(supportedlock_elem()),
            _ => return None,
        };
        Some(elem)
    }

    // Gather the propstat groups for one resource.
    async fn prop_responses(
        &self,
        kind: &PropfindKind,
        path: &DavPath,
        meta: &dyn DavMetaData,
    ) -> HashMap<StatusCode, Vec<Element>> {
        let mut out: HashMap<StatusCode, Vec<Element>> = HashMap::new();
        let content = !matches!(kind, PropfindKind::PropName);

        match kind {
            PropfindKind::Prop(wanted) => {
                for want in wanted {
                    if is_live_prop(want) {
                        match self.build_live_prop(&want.name, path, meta, true) {
                            Some(elem) => out.entry(StatusCode::OK).or_default().push(elem),
                            None => out
                                .entry(StatusCode::NOT_FOUND)
                                .or_default()
                                .push(prop_name_elem(want)),
                        }
                        continue;
                    }
                    // dead property lookup.
                    let dprop = davprop_from_elem(want, false);
                    match self.fs.get_prop(path, &dprop).await {
                        Ok(xml) => {
                            let prop = DavProp { xml: Some(xml), ..dprop };
                            out.entry(StatusCode::OK)
                                .or_default()
                                .push(davprop_to_element(&prop));
                        }
                        Err(_) => out
                            .entry(StatusCode::NOT_FOUND)
                            .or_default()
                            .push(prop_name_elem(want)),
                    }
                }
            }
            PropfindKind::AllProp | PropfindKind::PropName => {
                for name in LIVE_PROPS {
                    if let Some(elem) = self.build_live_prop(name, path, meta, content) {
                        out.entry(StatusCode::OK).or_default().push(elem);
                    }
                }
                if let Ok(props) = self.fs.list_props(path, content).await {
                    for p in &props {
                        out.entry(StatusCode::OK)
                            .or_default()
                            .push(davprop_to_element(p));
                    }
                }
            }
        }
        out
    }

    async fn write_resource(
        &self,
        pw: &mut PropWriter,
        kind: &PropfindKind,
        path: &DavPath,
        meta: &dyn DavMetaData,
    ) -> DavResult<()> {
        let propstats = self.prop_responses(kind, path, meta).await;
        pw.write_response(path, &propstats)
    }

    fn propfind_collection<'a>(
        &'a self,
        pw: &'a mut PropWriter,
        kind: &'a PropfindKind,
        path: &'a DavPath,
        depth: Depth,
    ) -> BoxFuture<'a, DavResult<()>> {
        async move {
            let members = self.fs.members(path).await?;
            for member in members {
                let mpath = path.child(&member.name);
                self.write_resource(pw, kind, &mpath, &*member.meta).await?;
                if depth == Depth::Infinity && member.meta.is_collection() {
                    self.propfind_collection(pw, kind, &mpath, depth).await?;
                }
            }
            Ok(())
        }
        .boxed()
    }

    pub(crate) async fn handle_propfind(
        &self,
        req: &Request<()>,
        path: &DavPath,
        xmldata: &[u8],
    ) -> DavResult<Response<Body>> {
        let meta = self.fs.metadata(path).await?;

        let depth = req
            .headers()
            .typed_get::<Depth>()
            .unwrap_or(Depth::Infinity);
        let kind = parse_propfind(xmldata)?;
        trace!("PROPFIND {}: {:?} depth {:?}", path, kind, depth);

        let mut pw = PropWriter::new()?;
        self.write_resource(&mut pw, &kind, path, &*meta).await?;
        if meta.is_collection() && depth != Depth::Zero {
            self.propfind_collection(&mut pw, &kind, path, depth).await?;
        }
        Ok(multistatus_response(pw.finish()?))
    }

    pub(crate) async fn handle_proppatch(
        &self,
        req: &Request<()>,
        path: &DavPath,
        xmldata: &[u8],
    ) -> DavResult<Response<Body>> {
        self.fs.metadata(path).await?;

        eval_if_header(req, &*self.fs, &self.locks, path).await?;
        let tokens = submitted_tokens(req);
        if self.locks.check(path, false, &tokens).is_err() {
            return Err(DavError::Status(StatusCode::LOCKED));
        }

        let tree = Element::parse2(Cursor::new(xmldata))?;
        if !is_dav_elem(&tree, "propertyupdate") {
            return Err(DavError::XmlParseError);
        }

        // Walk set/remove blocks in document order. Live properties are
        // read-only: touching one fails that property with 403.
        let mut patch: Vec<(bool, DavProp)> = Vec::new();
        let mut rejected: Vec<(StatusCode, DavProp)> = Vec::new();
        for block in tree.child_elems() {
            let set = if is_dav_elem(block, "set") {
                true
            } else if is_dav_elem(block, "remove") {
                false
            } else {
                continue;
            };
            for prop in block
                .child_elems()
                .into_iter()
                .filter(|e| is_dav_elem(e, "prop"))
                .flat_map(|e| e.child_elems())
            {
                if is_live_prop(prop) {
                    rejected.push((StatusCode::FORBIDDEN, davprop_from_elem(prop, false)));
                } else {
                    patch.push((set, davprop_from_elem(prop, set)));
                }
            }
        }

        // All or nothing: when anything is rejected, the rest of the
        // update is not applied and reports 424.
        let results: Vec<(StatusCode, DavProp)> = if !rejected.is_empty() {
            rejected
                .into_iter()
                .chain(
                    patch
                        .into_iter()
                        .map(|(_, p)| (StatusCode::FAILED_DEPENDENCY, p)),
                )
                .collect()
        } else {
            self.fs.patch_props(path, patch).await?
        };

        let mut propstats: HashMap<StatusCode, Vec<Element>> = HashMap::new();
        for (status, prop) in results {
            propstats
                .entry(status)
                .or_default()
                .push(davprop_to_element(&DavProp { xml: None, ..prop }));
        }

        let mut pw = PropWriter::new()?;
        pw.write_response(path, &propstats)?;
        Ok(multistatus_response(pw.finish()?))
    }
}
