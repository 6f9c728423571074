//! Naive tag-based XML extraction.
//!
//! This is not a conforming XML parser. It builds a small element tree
//! (elements, attributes, text, CDATA, the predefined and numeric entities)
//! and treats repeated child elements as records. Namespaces and DTDs are
//! ignored.

use super::{cell_value, ParseOptions, ParsedData, Parser, Row};
use crate::{Error, Result};
use serde_json::Value;
use std::collections::HashSet;

/// Parser for XML documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct XmlParser;

#[derive(Debug, Default)]
struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    children: Vec<Element>,
    text: String,
}

impl Element {
    fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

impl Parser for XmlParser {
    fn parse(&self, content: &str, options: &ParseOptions) -> Result<ParsedData> {
        let root = parse_document(content)?;

        let records: Vec<&Element> = match options.record_tag.as_deref() {
            Some(tag) => {
                let mut found = Vec::new();
                collect_tagged(&root, tag, &mut found);
                found
            }
            None => record_elements(&root),
        };

        let mut names: Vec<String> = Vec::new();
        let rows: Vec<Row> = records
            .into_iter()
            .map(|element| {
                let mut row = Row::new();
                record_fields(&mut row, element);
                for key in row.keys() {
                    if !names.iter().any(|n| n == key) {
                        names.push(key.clone());
                    }
                }
                row
            })
            .collect();

        Ok(ParsedData::from_rows(rows, names))
    }
}

/// Pick the record elements when no tag is configured.
///
/// Descends through single-child wrappers, then treats the children of the
/// container as records. A container whose children are distinct plain
/// leaves is itself the only record.
fn record_elements(root: &Element) -> Vec<&Element> {
    let mut node = root;
    while node.children.len() == 1 && !node.children[0].is_leaf() {
        node = &node.children[0];
    }

    if node.children.is_empty() {
        return Vec::new();
    }

    let mut seen = HashSet::new();
    let single_record = node
        .children
        .iter()
        .all(|c| c.is_leaf() && c.attributes.is_empty() && seen.insert(c.name.as_str()));

    if single_record {
        vec![node]
    } else {
        node.children.iter().collect()
    }
}

fn collect_tagged<'a>(element: &'a Element, tag: &str, out: &mut Vec<&'a Element>) {
    if element.name == tag {
        out.push(element);
        return;
    }
    for child in &element.children {
        collect_tagged(child, tag, out);
    }
}

fn record_fields(row: &mut Row, record: &Element) {
    for (name, value) in &record.attributes {
        row.insert(name.clone(), cell_value(value));
    }
    if record.is_leaf() {
        if !record.text.trim().is_empty() || record.attributes.is_empty() {
            row.insert("value".to_string(), cell_value(&record.text));
        }
        return;
    }
    for child in &record.children {
        nested_fields(row, &child.name, child);
    }
}

fn nested_fields(row: &mut Row, prefix: &str, element: &Element) {
    for (name, value) in &element.attributes {
        row.insert(format!("{}.{}", prefix, name), cell_value(value));
    }
    if element.is_leaf() {
        if !element.text.trim().is_empty() || element.attributes.is_empty() {
            row.insert(prefix.to_string(), cell_value(&element.text));
        }
        return;
    }
    for child in &element.children {
        nested_fields(row, &format!("{}.{}", prefix, child.name), child);
    }
}

fn xml_error(message: impl Into<String>) -> Error {
    Error::parse("xml", message)
}

fn parse_document(content: &str) -> Result<Element> {
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;
    let mut rest = content.trim_start_matches('\u{feff}');

    while !rest.is_empty() {
        let Some(lt) = rest.find('<') else {
            append_text(&mut stack, &decode_entities(rest), root.is_some())?;
            break;
        };
        if lt > 0 {
            append_text(&mut stack, &decode_entities(&rest[..lt]), root.is_some())?;
        }
        rest = &rest[lt..];

        if rest.starts_with("<?") {
            rest = skip_past(rest, "?>")?;
        } else if rest.starts_with("<!--") {
            rest = skip_past(rest, "-->")?;
        } else if let Some(body) = rest.strip_prefix("<![CDATA[") {
            let end = body
                .find("]]>")
                .ok_or_else(|| xml_error("unterminated CDATA section"))?;
            append_text(&mut stack, &body[..end], root.is_some())?;
            rest = &body[end + 3..];
        } else if rest.starts_with("<!") {
            let end = match (rest.find('['), rest.find('>')) {
                (Some(open), Some(close)) if open < close => rest[open..]
                    .find("]>")
                    .map(|i| open + i + 2)
                    .ok_or_else(|| xml_error("unterminated DOCTYPE"))?,
                (_, Some(close)) => close + 1,
                _ => return Err(xml_error("unterminated declaration")),
            };
            rest = &rest[end..];
        } else if let Some(body) = rest.strip_prefix("</") {
            let end = body
                .find('>')
                .ok_or_else(|| xml_error("unterminated closing tag"))?;
            let name = body[..end].trim();
            let element = stack
                .pop()
                .ok_or_else(|| xml_error(format!("unexpected closing tag </{}>", name)))?;
            if element.name != name {
                return Err(xml_error(format!(
                    "mismatched closing tag: expected </{}>, found </{}>",
                    element.name, name
                )));
            }
            close_element(&mut stack, &mut root, element)?;
            rest = &body[end + 1..];
        } else {
            let end = tag_end(rest).ok_or_else(|| xml_error("unterminated start tag"))?;
            let inner = &rest[1..end];
            let (inner, self_closing) = match inner.strip_suffix('/') {
                Some(stripped) => (stripped, true),
                None => (inner, false),
            };
            let element = parse_start_tag(inner)?;
            if self_closing {
                close_element(&mut stack, &mut root, element)?;
            } else {
                if stack.is_empty() && root.is_some() {
                    return Err(xml_error("multiple root elements"));
                }
                stack.push(element);
            }
            rest = &rest[end + 1..];
        }
    }

    if let Some(open) = stack.last() {
        return Err(xml_error(format!("unclosed tag <{}>", open.name)));
    }
    root.ok_or_else(|| xml_error("document has no root element"))
}

fn close_element(stack: &mut [Element], root: &mut Option<Element>, element: Element) -> Result<()> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None if root.is_none() => *root = Some(element),
        None => return Err(xml_error("multiple root elements")),
    }
    Ok(())
}

fn append_text(stack: &mut [Element], text: &str, after_root: bool) -> Result<()> {
    match stack.last_mut() {
        Some(top) => top.text.push_str(text),
        None if text.trim().is_empty() => {}
        None if after_root => return Err(xml_error("content after root element")),
        None => return Err(xml_error("content before root element")),
    }
    Ok(())
}

fn skip_past<'a>(rest: &'a str, terminator: &str) -> Result<&'a str> {
    rest.find(terminator)
        .map(|i| &rest[i + terminator.len()..])
        .ok_or_else(|| xml_error(format!("missing '{}'", terminator)))
}

/// Byte index of the `>` closing the tag at the start of `rest`, skipping
/// quoted attribute values.
fn tag_end(rest: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, c) in rest.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '>') => return Some(i),
            _ => {}
        }
    }
    None
}

fn parse_start_tag(inner: &str) -> Result<Element> {
    let inner = inner.trim();
    let name_end = inner.find(char::is_whitespace).unwrap_or(inner.len());
    let name = &inner[..name_end];
    if name.is_empty() {
        return Err(xml_error("empty tag name"));
    }

    let mut attributes = Vec::new();
    let mut rest = inner[name_end..].trim_start();
    while !rest.is_empty() {
        let key_end = rest
            .find(|c: char| c == '=' || c.is_whitespace())
            .unwrap_or(rest.len());
        let key = &rest[..key_end];
        rest = rest[key_end..].trim_start();

        let Some(after_eq) = rest.strip_prefix('=') else {
            attributes.push((key.to_string(), String::new()));
            continue;
        };
        let after_eq = after_eq.trim_start();
        let quote = after_eq
            .chars()
            .next()
            .filter(|c| *c == '"' || *c == '\'')
            .ok_or_else(|| xml_error(format!("unquoted value for attribute '{}'", key)))?;
        let value_end = after_eq[1..]
            .find(quote)
            .ok_or_else(|| xml_error(format!("unterminated value for attribute '{}'", key)))?;
        attributes.push((key.to_string(), decode_entities(&after_eq[1..1 + value_end])));
        rest = after_eq[value_end + 2..].trim_start();
    }

    Ok(Element {
        name: name.to_string(),
        attributes,
        ..Default::default()
    })
}

/// Decode the predefined and numeric character entities. Unknown entities
/// are left as written.
fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];

        let decoded = rest.find(';').and_then(|semi| {
            let entity = &rest[1..semi];
            let ch = match entity {
                "lt" => Some('<'),
                "gt" => Some('>'),
                "amp" => Some('&'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                _ => entity
                    .strip_prefix("#x")
                    .or_else(|| entity.strip_prefix("#X"))
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                    .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                    .and_then(char::from_u32),
            };
            ch.map(|c| (c, semi))
        });

        match decoded {
            Some((c, semi)) => {
                out.push(c);
                rest = &rest[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
