//! Snapshot tree file format.
//!
//! ```text
//! <SnapshotTree>
//!   <SavedStateItem guid="" vmstate="poweroff">        head
//!     <Name/> <DateTime/> <Creator/> <ScreenShot/> <Description/>
//!     <SavedStateItem guid="{...}" current="yes" vmstate="poweron">
//!       <Name>..</Name> <DateTime>..</DateTime> <Creator>..</Creator>
//!       <ScreenShot>..</ScreenShot> <Description><![CDATA[..]]></Description>
//!       <Runtime><Size>..</Size><OsVersion>..</OsVersion></Runtime>
//!       ...nested SavedStateItem
//! ```

use super::tree::{ParsedItem, SnapshotData, SnapshotRuntime, SnapshotTree, DATE_FORMAT, HEAD_GUID};
use crate::error::{Error, Result};
use crate::vm::SnapshotVmState;
use chrono::NaiveDateTime;
use quick_xml::events::{BytesCData, BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::path::Path;

const EL_ROOT: &str = "SnapshotTree";
const EL_ITEM: &str = "SavedStateItem";
const EL_NAME: &str = "Name";
const EL_CREATE_TIME: &str = "DateTime";
const EL_CREATOR: &str = "Creator";
const EL_SCREENSHOT: &str = "ScreenShot";
const EL_DESCRIPTION: &str = "Description";
const EL_RUNTIME: &str = "Runtime";
const EL_SIZE: &str = "Size";
const EL_OS_VERSION: &str = "OsVersion";
const AT_GUID: &str = "guid";
const AT_CURRENT: &str = "current";
const AT_VMSTATE: &str = "vmstate";
const VAL_CURRENT: &str = "yes";

// ============================================================================
// Parsing
// ============================================================================

#[derive(Debug, Default)]
struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    text: String,
    cdata: Option<String>,
    children: Vec<Element>,
}

impl Element {
    fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

fn bad(msg: impl Into<String>) -> Error {
    Error::BadSnapshotTree(msg.into())
}

fn start_element(e: &BytesStart<'_>) -> Result<Element> {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut attrs = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| bad(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| bad(e.to_string()))?
            .into_owned();
        attrs.push((key, value));
    }
    Ok(Element {
        name,
        attrs,
        ..Element::default()
    })
}

fn parse_document(content: &str) -> Result<Element> {
    // Field values keep their whitespace. Indentation between elements
    // lands in container text, which is ignored.
    let mut reader = Reader::from_str(content);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event().map_err(|e| bad(e.to_string()))? {
            Event::Start(e) => stack.push(start_element(&e)?),
            Event::Empty(e) => {
                let el = start_element(&e)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(el),
                    None if root.is_none() => root = Some(el),
                    None => return Err(bad("multiple root elements")),
                }
            }
            Event::Text(t) => {
                let text = t.unescape().map_err(|e| bad(e.to_string()))?;
                match stack.last_mut() {
                    Some(el) => el.text.push_str(&text),
                    None if text.trim().is_empty() => {}
                    None => return Err(bad("text outside the root element")),
                }
            }
            Event::CData(c) => {
                let text = String::from_utf8(c.into_inner().into_owned())
                    .map_err(|e| bad(e.to_string()))?;
                match stack.last_mut() {
                    Some(el) => el.cdata.get_or_insert_with(String::new).push_str(&text),
                    None => return Err(bad("cdata outside the root element")),
                }
            }
            Event::End(_) => {
                let el = stack.pop().ok_or_else(|| bad("unbalanced end tag"))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(el),
                    None if root.is_none() => root = Some(el),
                    None => return Err(bad("multiple root elements")),
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(bad("unexpected end of document"));
    }
    root.ok_or_else(|| bad("document has no root element"))
}

fn expect<'a>(
    iter: &mut std::iter::Peekable<std::slice::Iter<'a, Element>>,
    name: &str,
) -> Result<&'a Element> {
    match iter.next() {
        Some(el) if el.name == name => Ok(el),
        Some(el) => Err(bad(format!("expected <{}>, found <{}>", name, el.name))),
        None => Err(bad(format!("missing <{}>", name))),
    }
}

fn number<T: std::str::FromStr>(el: &Element) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    el.text
        .trim()
        .parse()
        .map_err(|e| bad(format!("bad <{}> '{}': {}", el.name, el.text, e)))
}

fn parse_item(el: &Element, is_head: bool) -> Result<ParsedItem> {
    if el.name != EL_ITEM {
        return Err(bad(format!("unexpected element <{}>", el.name)));
    }

    let guid = el.attr(AT_GUID).unwrap_or_default().to_string();
    if guid.is_empty() && !is_head {
        return Err(bad("snapshot item without guid"));
    }
    let current = el
        .attr(AT_CURRENT)
        .map(|v| v.eq_ignore_ascii_case(VAL_CURRENT))
        .unwrap_or(false);
    let vm_state = el
        .attr(AT_VMSTATE)
        .and_then(|v| SnapshotVmState::from_xml(&v.to_ascii_lowercase()))
        .unwrap_or(SnapshotVmState::Stopped);

    let mut iter = el.children.iter().peekable();
    let name = expect(&mut iter, EL_NAME)?.text.clone();
    let created_text = expect(&mut iter, EL_CREATE_TIME)?.text.clone();
    let created = if created_text.is_empty() {
        None
    } else {
        Some(
            NaiveDateTime::parse_from_str(&created_text, DATE_FORMAT)
                .map_err(|e| bad(format!("bad create time '{}': {}", created_text, e)))?,
        )
    };
    let creator = expect(&mut iter, EL_CREATOR)?.text.clone();
    let screenshot = expect(&mut iter, EL_SCREENSHOT)?.text.clone();
    let description_el = expect(&mut iter, EL_DESCRIPTION)?;
    let description = description_el
        .cdata
        .clone()
        .unwrap_or_else(|| description_el.text.clone());

    let runtime = match iter.peek() {
        Some(rt) if rt.name == EL_RUNTIME => {
            let mut runtime = SnapshotRuntime::default();
            for field in &rt.children {
                match field.name.as_str() {
                    EL_SIZE => runtime.size = number(field)?,
                    EL_OS_VERSION => runtime.os_version = number(field)?,
                    _ => {}
                }
            }
            iter.next();
            Some(runtime)
        }
        _ => None,
    };

    let mut children = Vec::new();
    for child in iter {
        if child.name == EL_ITEM {
            children.push(parse_item(child, false)?);
        }
    }

    Ok(ParsedItem {
        data: SnapshotData {
            guid,
            name,
            description,
            creator,
            created,
            vm_state,
            screenshot,
            runtime,
        },
        current,
        children,
    })
}

/// Parse a snapshot tree document.
///
/// A root other than `SnapshotTree` is [`Error::BadSnapshotTree`]; a root
/// without a head item is [`Error::EmptySnapshotTree`].
pub fn from_xml(content: &str) -> Result<SnapshotTree> {
    let root = parse_document(content)?;
    if root.name != EL_ROOT {
        return Err(bad(format!("unexpected root element <{}>", root.name)));
    }
    if !root.text.trim().is_empty() || root.cdata.is_some() {
        return Err(bad("text directly under the root element"));
    }
    let Some(head) = root.children.first() else {
        return Err(Error::EmptySnapshotTree);
    };
    SnapshotTree::from_parsed(parse_item(head, true)?)
}

// ============================================================================
// Writing
// ============================================================================

type XmlWriter = Writer<Vec<u8>>;

fn write_err(e: impl std::fmt::Display) -> Error {
    Error::BadSnapshotTree(format!("cannot serialize snapshot tree: {}", e))
}

fn text_element(w: &mut XmlWriter, name: &str, text: &str) -> Result<()> {
    w.write_event(Event::Start(BytesStart::new(name)))
        .map_err(write_err)?;
    if !text.is_empty() {
        w.write_event(Event::Text(BytesText::new(text)))
            .map_err(write_err)?;
    }
    w.write_event(Event::End(BytesEnd::new(name)))
        .map_err(write_err)
}

fn write_item(w: &mut XmlWriter, tree: &SnapshotTree, guid: &str) -> Result<()> {
    let data = tree
        .node_data(guid)
        .ok_or_else(|| Error::unexpected(format!("dangling snapshot {}", guid)))?;

    let mut start = BytesStart::new(EL_ITEM);
    start.push_attribute((AT_GUID, data.guid.as_str()));
    if tree.is_current(guid) {
        start.push_attribute((AT_CURRENT, VAL_CURRENT));
    }
    start.push_attribute((AT_VMSTATE, data.vm_state.as_xml()));
    w.write_event(Event::Start(start)).map_err(write_err)?;

    text_element(w, EL_NAME, &data.name)?;
    text_element(w, EL_CREATE_TIME, &data.created_str())?;
    text_element(w, EL_CREATOR, &data.creator)?;
    text_element(w, EL_SCREENSHOT, &data.screenshot)?;

    w.write_event(Event::Start(BytesStart::new(EL_DESCRIPTION)))
        .map_err(write_err)?;
    if data.description.contains("]]>") {
        w.write_event(Event::Text(BytesText::new(&data.description)))
            .map_err(write_err)?;
    } else {
        w.write_event(Event::CData(BytesCData::new(data.description.as_str())))
            .map_err(write_err)?;
    }
    w.write_event(Event::End(BytesEnd::new(EL_DESCRIPTION)))
        .map_err(write_err)?;

    if let Some(rt) = &data.runtime {
        w.write_event(Event::Start(BytesStart::new(EL_RUNTIME)))
            .map_err(write_err)?;
        text_element(w, EL_SIZE, &rt.size.to_string())?;
        text_element(w, EL_OS_VERSION, &rt.os_version.to_string())?;
        w.write_event(Event::End(BytesEnd::new(EL_RUNTIME)))
            .map_err(write_err)?;
    }

    for child in tree.children(guid) {
        write_item(w, tree, child)?;
    }

    w.write_event(Event::End(BytesEnd::new(EL_ITEM)))
        .map_err(write_err)
}

/// Serialize a tree to its document form.
pub fn to_xml(tree: &SnapshotTree) -> Result<String> {
    let mut w = Writer::new_with_indent(Vec::new(), b' ', 4);
    w.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(write_err)?;
    w.write_event(Event::Start(BytesStart::new(EL_ROOT)))
        .map_err(write_err)?;
    if !tree.is_empty() {
        write_item(&mut w, tree, HEAD_GUID)?;
    }
    w.write_event(Event::End(BytesEnd::new(EL_ROOT)))
        .map_err(write_err)?;
    String::from_utf8(w.into_inner()).map_err(write_err)
}

/// Load a tree file. A childless root yields an empty tree.
pub fn load_file(path: &Path) -> Result<SnapshotTree> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::bad_file(path, e))?;
    match from_xml(&content) {
        Ok(tree) => Ok(tree),
        Err(Error::EmptySnapshotTree) => Ok(SnapshotTree::new()),
        Err(e) => Err(e),
    }
}

/// Write a tree file through a temporary sibling and rename.
pub fn save_file(tree: &SnapshotTree, path: &Path) -> Result<()> {
    let content = to_xml(tree)?;
    let tmp = path.with_extension("xml.tmp");
    std::fs::write(&tmp, content).map_err(|e| Error::bad_file(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| Error::bad_file(path, e))
}
