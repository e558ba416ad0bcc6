//! Glue between `xmltree` (request parsing) and the `xml-rs` event
//! writer (response generation).
//!
//! Requests are matched on local names, so `D:prop`, `d:prop` and a
//! bare `prop` are all accepted; an element that explicitly claims a
//! non-DAV namespace is not treated as a DAV element. Responses are
//! emitted with the `d:` prefix and `xmlns:d="DAV:"` declared on the
//! root element.
use std::borrow::Cow;
use std::io::{Read, Write};

use xml::common::XmlVersion;
use xml::writer::events::XmlEvent;
use xml::writer::EventWriter;
use xml::EmitterConfig;
use xmltree::{Element, Namespace, XMLNode};

use crate::{DavError, DavResult};

pub(crate) const NS_DAV_URI: &str = "DAV:";

pub(crate) trait ElementExt {
    fn new2<'a, N: Into<&'a str>>(n: N) -> Self;
    fn ns<S: Into<String>>(self, prefix: S, namespace: S) -> Self;
    fn text<T: Into<String>>(self, t: T) -> Self;
    fn push_elem(&mut self, e: Element);
    fn child_elems(&self) -> Vec<&Element>;
    fn parse2<R: Read>(r: R) -> DavResult<Element>;
    fn write_ev<W: Write>(&self, emitter: &mut EventWriter<W>) -> xml::writer::Result<()>;
}

impl ElementExt for Element {
    // Element from a "pfx:name" string.
    fn new2<'a, N: Into<&'a str>>(n: N) -> Element {
        let v: Vec<&str> = n.into().splitn(2, ':').collect();
        if v.len() == 1 {
            Element::new(v[0])
        } else {
            let mut e = Element::new(v[1]);
            e.prefix = Some(v[0].to_string());
            e
        }
    }

    fn ns<S: Into<String>>(mut self, prefix: S, namespace: S) -> Element {
        let mut ns = self.namespaces.unwrap_or_else(Namespace::empty);
        ns.force_put(prefix.into(), namespace.into());
        self.namespaces = Some(ns);
        self
    }

    fn text<T: Into<String>>(mut self, t: T) -> Element {
        self.children.push(XMLNode::Text(t.into()));
        self
    }

    fn push_elem(&mut self, e: Element) {
        self.children.push(XMLNode::Element(e));
    }

    fn child_elems(&self) -> Vec<&Element> {
        self.children
            .iter()
            .filter_map(|n| match n {
                XMLNode::Element(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    fn parse2<R: Read>(r: R) -> DavResult<Element> {
        match Element::parse(r) {
            Ok(elem) => Ok(elem),
            Err(xmltree::ParseError::MalformedXml(_)) => Err(DavError::XmlParseError),
            Err(_) => Err(DavError::XmlReadError),
        }
    }

    fn write_ev<W: Write>(&self, emitter: &mut EventWriter<W>) -> xml::writer::Result<()> {
        use xml::attribute::Attribute;
        use xml::name::Name;

        let mut name = Name::local(&self.name);
        if let Some(ref ns) = self.namespace {
            name.namespace = Some(ns);
        }
        if let Some(ref p) = self.prefix {
            name.prefix = Some(p);
        }

        let mut attributes = Vec::with_capacity(self.attributes.len());
        for (k, v) in &self.attributes {
            attributes.push(Attribute {
                name:  Name::local(k.as_str()),
                value: v.as_str(),
            });
        }

        let namespace = match self.namespaces {
            Some(ref ns) => Cow::Owned(ns.clone()),
            None => Cow::Owned(Namespace::empty()),
        };

        emitter.write(XmlEvent::StartElement {
            name,
            attributes: Cow::Owned(attributes),
            namespace,
        })?;
        for node in &self.children {
            match node {
                XMLNode::Element(e) => e.write_ev(emitter)?,
                XMLNode::Text(t) => emitter.write(XmlEvent::Characters(t))?,
                _ => {}
            }
        }
        emitter.write(XmlEvent::EndElement { name: Some(name) })
    }
}

// Is this parsed element the DAV element `name`? Prefix-tolerant: an
// undeclared namespace counts as DAV.
pub(crate) fn is_dav_elem(e: &Element, name: &str) -> bool {
    e.name == name && e.namespace.as_deref().map_or(true, |ns| ns == NS_DAV_URI)
}

// Find the first DAV child element with the given local name.
pub(crate) fn dav_child<'a>(e: &'a Element, name: &str) -> Option<&'a Element> {
    e.child_elems().into_iter().find(|c| is_dav_elem(c, name))
}

/// Event writer with the XML declaration already emitted.
pub(crate) fn emitter<W: Write>(w: W) -> DavResult<EventWriter<W>> {
    let mut emitter = EventWriter::new_with_config(
        w,
        EmitterConfig {
            normalize_empty_elements: false,
            perform_indent: false,
            indent_string: Cow::Borrowed(""),
            ..Default::default()
        },
    );
    emitter.write(XmlEvent::StartDocument {
        version:    XmlVersion::Version10,
        encoding:   Some("utf-8"),
        standalone: None,
    })?;
    Ok(emitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn prefix_tolerant_matching() {
        for body in [
            r#"<D:propfind xmlns:D="DAV:"><D:allprop/></D:propfind>"#,
            r#"<d:propfind xmlns:d="DAV:"><d:allprop/></d:propfind>"#,
            r#"<propfind><allprop/></propfind>"#,
        ] {
            let e = Element::parse2(Cursor::new(body.as_bytes())).unwrap();
            assert!(is_dav_elem(&e, "propfind"));
            assert!(dav_child(&e, "allprop").is_some());
        }
        let foreign =
            r#"<x:propfind xmlns:x="urn:not-dav"><x:allprop/></x:propfind>"#;
        let e = Element::parse2(Cursor::new(foreign.as_bytes())).unwrap();
        assert!(!is_dav_elem(&e, "propfind"));
    }

    #[test]
    fn emits_d_prefix() {
        let mut buf = crate::util::MemBuffer::new();
        let mut xw = emitter(&mut buf).unwrap();
        let mut root = Element::new2("d:multistatus").ns("d", NS_DAV_URI);
        root.push_elem(Element::new2("d:response").text("x"));
        root.write_ev(&mut xw).unwrap();
        drop(xw);
        let out = String::from_utf8(buf.take().to_vec()).unwrap();
        assert!(out.contains(r#"<d:multistatus xmlns:d="DAV:">"#));
        assert!(out.contains("<d:response>x</d:response>"));
    }
}
