//! Simple in-memory filesystem.
//!
//! This implementation has state. If you create a new instance in a
//! request handler it will be empty every time, so create the instance
//! once with `MemFs::new`, store it, and clone it every time you pass
//! it to the DavHandler. A `MemFs` is just a handle, cloning is cheap.
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use futures_util::stream;
use futures_util::StreamExt;
use http::StatusCode;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::davpath::DavPath;
use crate::fs::*;

const READ_CHUNK: usize = 65536;

/// Ephemeral in-memory filesystem.
#[derive(Debug, Clone)]
pub struct MemFs {
    inner: Arc<Mutex<MemFsInner>>,
}

// One flat map keyed by canonical path. Subtree operations are prefix
// rewrites executed under the single lock, which is what makes
// copy/move/delete atomic with respect to other callers.
#[derive(Debug)]
struct MemFsInner {
    nodes: BTreeMap<Vec<u8>, MemNode>,
}

#[derive(Debug, Clone)]
struct MemNode {
    kind:   NodeKind,
    data:   Vec<u8>,
    props:  HashMap<String, DavProp>,
    mtime:  SystemTime,
    crtime: SystemTime,
    etag:   String,
}

#[derive(Debug)]
struct MemFile {
    inner: Arc<Mutex<MemFsInner>>,
    key:   Vec<u8>,
    pos:   usize,
}

#[derive(Debug, Clone)]
struct MemMeta {
    len:    u64,
    kind:   NodeKind,
    etag:   String,
    mtime:  SystemTime,
    crtime: SystemTime,
}

fn fresh_etag() -> String {
    Uuid::new_v4().simple().to_string()
}

fn propkey(ns: &Option<String>, name: &str) -> String {
    format!("{}:{}", ns.as_deref().unwrap_or(""), name)
}

fn cloneprop(p: &DavProp) -> DavProp {
    DavProp {
        name:      p.name.clone(),
        prefix:    p.prefix.clone(),
        namespace: p.namespace.clone(),
        xml:       None,
    }
}

impl MemNode {
    fn new(kind: NodeKind) -> MemNode {
        let now = SystemTime::now();
        MemNode {
            kind,
            data: Vec::new(),
            props: HashMap::new(),
            mtime: now,
            crtime: now,
            etag: fresh_etag(),
        }
    }

    fn meta(&self) -> MemMeta {
        MemMeta {
            len:    self.data.len() as u64,
            kind:   self.kind,
            etag:   self.etag.clone(),
            mtime:  self.mtime,
            crtime: self.crtime,
        }
    }
}

impl DavMetaData for MemMeta {
    fn len(&self) -> u64 {
        self.len
    }
    fn kind(&self) -> NodeKind {
        self.kind
    }
    fn etag(&self) -> String {
        self.etag.clone()
    }
    fn modified(&self) -> SystemTime {
        self.mtime
    }
    fn created(&self) -> SystemTime {
        self.crtime
    }
}

// prefix under which all strict descendants of `path` live.
fn subtree_prefix(path: &[u8]) -> Vec<u8> {
    let mut p = path.to_vec();
    if p != b"/" {
        p.push(b'/');
    }
    p
}

impl MemFsInner {
    fn get(&self, path: &[u8]) -> FsResult<&MemNode> {
        self.nodes.get(path).ok_or(FsError::NotFound)
    }

    fn get_mut(&mut self, path: &[u8]) -> FsResult<&mut MemNode> {
        self.nodes.get_mut(path).ok_or(FsError::NotFound)
    }

    // Make sure every ancestor of `path` exists and is a collection.
    fn ensure_parents(&mut self, path: &DavPath) -> FsResult<()> {
        let bytes = path.as_bytes();
        let mut key: Vec<u8> = Vec::new();
        for seg in bytes.split(|&c| c == b'/').filter(|s| !s.is_empty()) {
            let this = {
                let mut k = key.clone();
                k.push(b'/');
                k.extend_from_slice(seg);
                k
            };
            if this.as_slice() == bytes {
                break;
            }
            match self.nodes.get(&this) {
                Some(n) if n.kind == NodeKind::Collection => {}
                Some(_) => return Err(FsError::Forbidden),
                None => {
                    self.nodes.insert(this.clone(), MemNode::new(NodeKind::Collection));
                }
            }
            key = this;
        }
        Ok(())
    }

    fn touch_parent(&mut self, path: &DavPath) {
        let parent = path.parent();
        if let Some(n) = self.nodes.get_mut(parent.as_bytes()) {
            n.mtime = SystemTime::now();
        }
    }

    fn subtree_keys(&self, path: &[u8]) -> Vec<Vec<u8>> {
        let prefix = subtree_prefix(path);
        self.nodes
            .keys()
            .filter(|k| k.as_slice() == path || k.starts_with(&prefix))
            .cloned()
            .collect()
    }
}

impl MemFs {
    /// Create a new, empty "memfs" filesystem.
    pub fn new() -> Box<MemFs> {
        let mut nodes = BTreeMap::new();
        nodes.insert(b"/".to_vec(), MemNode::new(NodeKind::Collection));
        Box::new(MemFs {
            inner: Arc::new(Mutex::new(MemFsInner { nodes })),
        })
    }
}

impl Default for MemFs {
    fn default() -> Self {
        *MemFs::new()
    }
}

impl DavFileSystem for MemFs {
    fn node_type<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, Option<NodeKind>> {
        Box::pin(async move {
            let inner = self.inner.lock();
            Ok(inner.nodes.get(path.as_bytes()).map(|n| n.kind))
        })
    }

    fn metadata<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, Box<dyn DavMetaData>> {
        Box::pin(async move {
            let inner = self.inner.lock();
            Ok(Box::new(inner.get(path.as_bytes())?.meta()) as Box<dyn DavMetaData>)
        })
    }

    fn create<'a>(&'a self, path: &'a DavPath, kind: NodeKind) -> FsFuture<'a, ()> {
        Box::pin(async move {
            let mut inner = self.inner.lock();
            if inner.nodes.contains_key(path.as_bytes()) {
                return Err(FsError::Exists);
            }
            inner.ensure_parents(path)?;
            inner.nodes.insert(path.as_bytes().to_vec(), MemNode::new(kind));
            inner.touch_parent(path);
            Ok(())
        })
    }

    fn remove<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        Box::pin(async move {
            if path.is_root() {
                return Err(FsError::Forbidden);
            }
            let mut inner = self.inner.lock();
            let keys = inner.subtree_keys(path.as_bytes());
            if keys.is_empty() {
                return Err(FsError::NotFound);
            }
            for k in keys {
                inner.nodes.remove(&k);
            }
            inner.touch_parent(path);
            Ok(())
        })
    }

    fn copy<'a>(&'a self, from: &'a DavPath, to: &'a DavPath) -> FsFuture<'a, ()> {
        Box::pin(async move {
            if from.is_root() || from == to || from.is_ancestor_of(to) || to.is_ancestor_of(from) {
                return Err(FsError::Forbidden);
            }
            let mut inner = self.inner.lock();
            let src_keys = inner.subtree_keys(from.as_bytes());
            if src_keys.is_empty() {
                return Err(FsError::NotFound);
            }
            inner.ensure_parents(to)?;
            for k in inner.subtree_keys(to.as_bytes()) {
                inner.nodes.remove(&k);
            }
            let now = SystemTime::now();
            for k in src_keys {
                let mut node = inner.nodes.get(&k).unwrap().clone();
                node.crtime = now;
                node.etag = fresh_etag();
                let mut newkey = to.as_bytes().to_vec();
                newkey.extend_from_slice(&k[from.as_bytes().len()..]);
                inner.nodes.insert(newkey, node);
            }
            inner.touch_parent(to);
            Ok(())
        })
    }

    fn rename<'a>(&'a self, from: &'a DavPath, to: &'a DavPath) -> FsFuture<'a, ()> {
        Box::pin(async move {
            if from.is_root() || from == to || from.is_ancestor_of(to) || to.is_ancestor_of(from) {
                return Err(FsError::Forbidden);
            }
            let mut inner = self.inner.lock();
            let src_keys = inner.subtree_keys(from.as_bytes());
            if src_keys.is_empty() {
                return Err(FsError::NotFound);
            }
            inner.ensure_parents(to)?;
            for k in inner.subtree_keys(to.as_bytes()) {
                inner.nodes.remove(&k);
            }
            for k in src_keys {
                let mut node = inner.nodes.remove(&k).unwrap();
                node.etag = fresh_etag();
                let mut newkey = to.as_bytes().to_vec();
                newkey.extend_from_slice(&k[from.as_bytes().len()..]);
                inner.nodes.insert(newkey, node);
            }
            inner.touch_parent(from);
            inner.touch_parent(to);
            Ok(())
        })
    }

    fn members<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, Vec<DavMember>> {
        Box::pin(async move {
            let inner = self.inner.lock();
            let node = inner.get(path.as_bytes())?;
            if node.kind != NodeKind::Collection {
                return Err(FsError::NotACollection);
            }
            let prefix = subtree_prefix(path.as_bytes());
            let mut v = Vec::new();
            for (k, n) in inner.nodes.iter() {
                if !k.starts_with(&prefix) || k.len() == prefix.len() {
                    continue;
                }
                let name = &k[prefix.len()..];
                if name.contains(&b'/') {
                    continue;
                }
                v.push(DavMember {
                    name: name.to_vec(),
                    meta: Box::new(n.meta()),
                });
            }
            Ok(v)
        })
    }

    fn read_stream<'a>(
        &'a self,
        path: &'a DavPath,
        range: Option<ByteRange>,
    ) -> FsFuture<'a, FsStream<Bytes>> {
        Box::pin(async move {
            let inner = self.inner.lock();
            let node = inner.get(path.as_bytes())?;
            if node.kind != NodeKind::File {
                return Err(FsError::Forbidden);
            }
            let (start, end) = match range {
                Some(r) => (r.start as usize, (r.end as usize + 1).min(node.data.len())),
                None => (0, node.data.len()),
            };
            let slice = if start < end { &node.data[start..end] } else { &[][..] };
            let chunks: Vec<FsResult<Bytes>> = slice
                .chunks(READ_CHUNK)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();
            Ok(stream::iter(chunks).boxed())
        })
    }

    fn open_write<'a>(
        &'a self,
        path: &'a DavPath,
        range: Option<WriteRange>,
    ) -> FsFuture<'a, Box<dyn DavFile>> {
        Box::pin(async move {
            let mut inner = self.inner.lock();
            if !inner.nodes.contains_key(path.as_bytes()) {
                inner.ensure_parents(path)?;
                inner
                    .nodes
                    .insert(path.as_bytes().to_vec(), MemNode::new(NodeKind::File));
                inner.touch_parent(path);
            }
            let node = inner.get_mut(path.as_bytes())?;
            if node.kind != NodeKind::File {
                return Err(FsError::Forbidden);
            }
            let pos = match range {
                None => {
                    node.data.clear();
                    0
                }
                Some(r) => {
                    if let Some(total) = r.total {
                        if node.data.len() < total as usize {
                            node.data.resize(total as usize, 0);
                        }
                    }
                    if node.data.len() < r.start as usize {
                        node.data.resize(r.start as usize, 0);
                    }
                    r.start as usize
                }
            };
            Ok(Box::new(MemFile {
                inner: self.inner.clone(),
                key:   path.as_bytes().to_vec(),
                pos,
            }) as Box<dyn DavFile>)
        })
    }

    fn patch_props<'a>(
        &'a self,
        path: &'a DavPath,
        patch: Vec<(bool, DavProp)>,
    ) -> FsFuture<'a, Vec<(StatusCode, DavProp)>> {
        Box::pin(async move {
            let mut inner = self.inner.lock();
            let node = inner.get_mut(path.as_bytes())?;
            let mut res = Vec::new();
            for (set, p) in patch.into_iter() {
                let key = propkey(&p.namespace, &p.name);
                if set {
                    res.push((StatusCode::OK, cloneprop(&p)));
                    node.props.insert(key, p);
                } else {
                    node.props.remove(&key);
                    res.push((StatusCode::OK, p));
                }
            }
            Ok(res)
        })
    }

    fn get_prop<'a>(&'a self, path: &'a DavPath, prop: &'a DavProp) -> FsFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let inner = self.inner.lock();
            let node = inner.get(path.as_bytes())?;
            let p = node
                .props
                .get(&propkey(&prop.namespace, &prop.name))
                .ok_or(FsError::NotFound)?;
            p.xml.clone().ok_or(FsError::NotFound)
        })
    }

    fn list_props<'a>(
        &'a self,
        path: &'a DavPath,
        with_content: bool,
    ) -> FsFuture<'a, Vec<DavProp>> {
        Box::pin(async move {
            let inner = self.inner.lock();
            let node = inner.get(path.as_bytes())?;
            let mut v = Vec::new();
            for p in node.props.values() {
                v.push(if with_content { p.clone() } else { cloneprop(p) });
            }
            Ok(v)
        })
    }
}

impl DavFile for MemFile {
    fn write_bytes(&mut self, buf: Bytes) -> FsFuture<'_, ()> {
        Box::pin(async move {
            let mut inner = self.inner.lock();
            let node = inner.get_mut(&self.key)?;
            let end = self.pos + buf.len();
            if node.data.len() < end {
                node.data.resize(end, 0);
            }
            node.data[self.pos..end].copy_from_slice(&buf);
            self.pos = end;
            Ok(())
        })
    }

    fn commit(&mut self) -> FsFuture<'_, Box<dyn DavMetaData>> {
        Box::pin(async move {
            let mut inner = self.inner.lock();
            let node = inner.get_mut(&self.key)?;
            node.mtime = SystemTime::now();
            node.etag = fresh_etag();
            Ok(Box::new(node.meta()) as Box<dyn DavMetaData>)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn p(s: &str) -> DavPath {
        DavPath::new(s).unwrap()
    }

    async fn put(fs: &MemFs, path: &DavPath, data: &[u8]) -> String {
        let mut f = fs.open_write(path, None).await.unwrap();
        f.write_bytes(Bytes::copy_from_slice(data)).await.unwrap();
        f.commit().await.unwrap().etag()
    }

    async fn content(fs: &MemFs, path: &DavPath) -> Vec<u8> {
        let mut strm = fs.read_stream(path, None).await.unwrap();
        let mut v = Vec::new();
        while let Some(chunk) = strm.next().await {
            v.extend_from_slice(&chunk.unwrap());
        }
        v
    }

    #[tokio::test]
    async fn create_write_read() {
        let fs = MemFs::new();
        let path = p("/a/b/c.txt");
        let etag = put(&fs, &path, b"hello").await;
        assert_eq!(content(&fs, &path).await, b"hello");
        // parents were created implicitly
        assert_eq!(fs.node_type(&p("/a/b")).await.unwrap(), Some(NodeKind::Collection));
        let meta = fs.metadata(&path).await.unwrap();
        assert_eq!(meta.len(), 5);
        assert_eq!(meta.etag(), etag);
    }

    #[tokio::test]
    async fn overwrite_regenerates_etag() {
        let fs = MemFs::new();
        let path = p("/f");
        let e1 = put(&fs, &path, b"one").await;
        let e2 = put(&fs, &path, b"two").await;
        assert_ne!(e1, e2);
        assert_eq!(content(&fs, &path).await, b"two");
    }

    #[tokio::test]
    async fn ranged_write_zero_pads() {
        let fs = MemFs::new();
        let path = p("/sparse");
        let range = WriteRange { start: 10, end: 19, total: Some(30) };
        let mut f = fs.open_write(&path, Some(range)).await.unwrap();
        f.write_bytes(Bytes::from_static(b"XXXXXXXXXX")).await.unwrap();
        f.commit().await.unwrap();
        let data = content(&fs, &path).await;
        assert_eq!(data.len(), 30);
        assert_eq!(&data[..10], &[0u8; 10]);
        assert_eq!(&data[10..20], b"XXXXXXXXXX");
        assert_eq!(&data[20..], &[0u8; 10]);
    }

    #[tokio::test]
    async fn copy_and_rename_subtrees() {
        let fs = MemFs::new();
        put(&fs, &p("/dir/x"), b"x").await;
        put(&fs, &p("/dir/sub/y"), b"y").await;

        fs.copy(&p("/dir"), &p("/copy")).await.unwrap();
        assert_eq!(content(&fs, &p("/copy/sub/y")).await, b"y");
        assert_eq!(content(&fs, &p("/dir/x")).await, b"x");
        let src_etag = fs.metadata(&p("/dir/x")).await.unwrap().etag();
        let dst_etag = fs.metadata(&p("/copy/x")).await.unwrap().etag();
        assert_ne!(src_etag, dst_etag);

        fs.rename(&p("/dir"), &p("/moved")).await.unwrap();
        assert_eq!(fs.node_type(&p("/dir")).await.unwrap(), None);
        assert_eq!(content(&fs, &p("/moved/sub/y")).await, b"y");
    }

    #[tokio::test]
    async fn members_lists_direct_children_only() {
        let fs = MemFs::new();
        put(&fs, &p("/d/one"), b"1").await;
        put(&fs, &p("/d/sub/two"), b"2").await;
        let mut names: Vec<Vec<u8>> = fs
            .members(&p("/d"))
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        names.sort();
        assert_eq!(names, vec![b"one".to_vec(), b"sub".to_vec()]);
        assert_eq!(fs.members(&p("/d/one")).await.unwrap_err(), FsError::NotACollection);
    }

    #[tokio::test]
    async fn dead_props_roundtrip() {
        let fs = MemFs::new();
        put(&fs, &p("/f"), b"x").await;
        let prop = DavProp {
            name:      "color".to_string(),
            prefix:    Some("Z".to_string()),
            namespace: Some("urn:example".to_string()),
            xml:       Some(b"<Z:color>blue</Z:color>".to_vec()),
        };
        fs.set_prop(&p("/f"), prop.clone()).await.unwrap();
        let xml = fs.get_prop(&p("/f"), &prop).await.unwrap();
        assert_eq!(xml, b"<Z:color>blue</Z:color>".to_vec());
        fs.remove_prop(&p("/f"), cloneprop(&prop)).await.unwrap();
        assert!(fs.get_prop(&p("/f"), &prop).await.is_err());
    }
}
