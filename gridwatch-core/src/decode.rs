//! Workbook decoding collaborator.
//!
//! The pipeline only depends on the [`SnapshotDecoder`] trait; the shipped
//! [`XlsxDecoder`] reads the xlsx zip container directly (workbook part for
//! sheet names, shared strings, per-sheet cell values and formulas, the
//! external-reference relationship table, and the last-modified-by author
//! from the document properties). Decoders are handed paths inside the cache
//! directory only and must release every handle before returning.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::LazyLock;

use quick_xml::Reader;
use quick_xml::events::Event;
use regex::Regex;
use thiserror::Error;
use zip::ZipArchive;
use zip::result::ZipError;

use crate::snapshot::{CellContent, DecodedWorkbook, SheetCells};

#[derive(Error, Debug)]
pub enum DecodeError {
    /// The file is not a readable zip container (truncated save, wrong type).
    #[error("unreadable workbook container: {0}")]
    Container(String),

    #[error("missing workbook part: {0}")]
    MissingPart(String),

    #[error("malformed workbook xml: {0}")]
    Malformed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Black-box decode capability: parse a local file into sheet/cell content.
pub trait SnapshotDecoder: Send + Sync {
    fn decode(&self, local_path: &Path) -> Result<DecodedWorkbook, DecodeError>;
}

/// Decoder for `.xlsx`/`.xlsm` office open xml workbooks.
#[derive(Debug, Default, Clone, Copy)]
pub struct XlsxDecoder;

impl SnapshotDecoder for XlsxDecoder {
    fn decode(&self, local_path: &Path) -> Result<DecodedWorkbook, DecodeError> {
        let file = File::open(local_path)?;
        let mut archive = ZipArchive::new(BufReader::new(file))
            .map_err(|err| DecodeError::Container(err.to_string()))?;

        let workbook_xml = read_part(&mut archive, "xl/workbook.xml")?
            .ok_or_else(|| DecodeError::MissingPart("xl/workbook.xml".into()))?;
        let rels_xml = read_part(&mut archive, "xl/_rels/workbook.xml.rels")?
            .ok_or_else(|| DecodeError::MissingPart("xl/_rels/workbook.xml.rels".into()))?;

        let shared = match read_part(&mut archive, "xl/sharedStrings.xml")? {
            Some(xml) => parse_shared_strings(&xml)?,
            None => Vec::new(),
        };

        let rels = parse_relationships(&rels_xml)?;
        let sheet_refs = parse_workbook_sheets(&workbook_xml)?;

        let mut sheets = BTreeMap::new();
        for (name, rel_id) in sheet_refs {
            let Some(rel) = rels.iter().find(|rel| rel.id == rel_id) else {
                continue;
            };
            let part = part_path(&rel.target);
            let Some(sheet_xml) = read_part(&mut archive, &part)? else {
                return Err(DecodeError::MissingPart(part));
            };
            let cells = parse_sheet_cells(&sheet_xml, &shared)?;
            if !cells.is_empty() {
                sheets.insert(name, cells);
            }
        }

        let external_refs = resolve_external_refs(&mut archive, &rels)?;

        let last_author = match read_part(&mut archive, "docProps/core.xml")? {
            Some(xml) => parse_last_author(&xml)?,
            None => None,
        };

        Ok(DecodedWorkbook {
            sheets,
            external_refs,
            last_author,
        })
    }
}

struct Relationship {
    id: String,
    rel_type: String,
    target: String,
}

fn read_part<R: Read + std::io::Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> Result<Option<String>, DecodeError> {
    match archive.by_name(name) {
        Ok(mut part) => {
            let mut xml = String::new();
            part.read_to_string(&mut xml)?;
            Ok(Some(xml))
        }
        Err(ZipError::FileNotFound) => Ok(None),
        Err(err) => Err(DecodeError::Container(err.to_string())),
    }
}

/// Rels targets are relative to `xl/`; absolute targets carry a leading `/`.
fn part_path(target: &str) -> String {
    match target.strip_prefix('/') {
        Some(absolute) => absolute.to_string(),
        None => format!("xl/{target}"),
    }
}

fn xml_reader(xml: &str) -> Reader<&[u8]> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    reader
}

fn malformed<E: std::fmt::Display>(err: E) -> DecodeError {
    DecodeError::Malformed(err.to_string())
}

fn attr_value(attr: &quick_xml::events::attributes::Attribute<'_>) -> Result<String, DecodeError> {
    attr.unescape_value()
        .map(|value| value.into_owned())
        .map_err(malformed)
}

fn parse_relationships(xml: &str) -> Result<Vec<Relationship>, DecodeError> {
    let mut reader = xml_reader(xml);
    let mut out = Vec::new();
    loop {
        match reader.read_event().map_err(malformed)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"Relationship" => {
                let mut id = None;
                let mut rel_type = None;
                let mut target = None;
                for attr in e.attributes().flatten() {
                    match attr.key.as_ref() {
                        b"Id" => id = Some(attr_value(&attr)?),
                        b"Type" => rel_type = Some(attr_value(&attr)?),
                        b"Target" => target = Some(attr_value(&attr)?),
                        _ => {}
                    }
                }
                if let (Some(id), Some(rel_type), Some(target)) = (id, rel_type, target) {
                    out.push(Relationship {
                        id,
                        rel_type,
                        target,
                    });
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(out)
}

/// Sheet display names with their relationship ids, in workbook order.
fn parse_workbook_sheets(xml: &str) -> Result<Vec<(String, String)>, DecodeError> {
    let mut reader = xml_reader(xml);
    let mut out = Vec::new();
    loop {
        match reader.read_event().map_err(malformed)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"sheet" => {
                let mut name = None;
                let mut rel_id = None;
                for attr in e.attributes().flatten() {
                    match attr.key.as_ref() {
                        b"name" => name = Some(attr_value(&attr)?),
                        // The relationship id attribute is namespaced (r:id).
                        key if key == b"r:id" || key.ends_with(b":id") => {
                            rel_id = Some(attr_value(&attr)?);
                        }
                        _ => {}
                    }
                }
                if let (Some(name), Some(rel_id)) = (name, rel_id) {
                    out.push((name, rel_id));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(out)
}

/// Shared string items; rich-text runs are flattened by concatenating their
/// `<t>` fragments.
fn parse_shared_strings(xml: &str) -> Result<Vec<String>, DecodeError> {
    let mut reader = xml_reader(xml);
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_si = false;
    let mut in_text = false;
    loop {
        match reader.read_event().map_err(malformed)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"si" => {
                    in_si = true;
                    current.clear();
                }
                b"t" if in_si => in_text = true,
                _ => {}
            },
            Event::Text(t) if in_text => {
                current.push_str(&t.unescape().map_err(malformed)?);
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"si" => {
                    in_si = false;
                    out.push(std::mem::take(&mut current));
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(out)
}

fn parse_sheet_cells(xml: &str, shared: &[String]) -> Result<SheetCells, DecodeError> {
    let mut reader = xml_reader(xml);
    let mut cells = SheetCells::new();

    let mut address: Option<String> = None;
    let mut cell_type = String::new();
    let mut formula: Option<String> = None;
    let mut array_formula = false;
    let mut raw_value: Option<String> = None;
    let mut in_formula = false;
    let mut in_value = false;
    let mut in_inline_text = false;

    loop {
        match reader.read_event().map_err(malformed)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"c" => {
                address = None;
                cell_type = String::from("n");
                formula = None;
                array_formula = false;
                raw_value = None;
                for attr in e.attributes().flatten() {
                    match attr.key.as_ref() {
                        b"r" => address = Some(attr_value(&attr)?),
                        b"t" => cell_type = attr_value(&attr)?,
                        _ => {}
                    }
                }
            }
            Event::Start(e) => match e.local_name().as_ref() {
                b"f" => {
                    in_formula = true;
                    formula = Some(String::new());
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"t" && attr_value(&attr)? == "array" {
                            array_formula = true;
                        }
                    }
                }
                b"v" => in_value = true,
                b"t" if cell_type == "inlineStr" => in_inline_text = true,
                _ => {}
            },
            Event::Text(t) => {
                let text = t.unescape().map_err(malformed)?;
                if in_formula {
                    if let Some(f) = formula.as_mut() {
                        f.push_str(&text);
                    }
                } else if in_value || in_inline_text {
                    raw_value
                        .get_or_insert_with(String::new)
                        .push_str(&text);
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"f" => in_formula = false,
                b"v" => in_value = false,
                b"t" => in_inline_text = false,
                b"c" => {
                    if let Some(addr) = address.take() {
                        let value = raw_value
                            .take()
                            .map(|raw| cell_value(&cell_type, &raw, shared))
                            .transpose()?;
                        let content = CellContent {
                            value,
                            formula: formula.take().filter(|f| !f.is_empty()),
                            array_formula,
                        };
                        if !content.is_empty() {
                            cells.insert(addr, content);
                        }
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(cells)
}

fn cell_value(
    cell_type: &str,
    raw: &str,
    shared: &[String],
) -> Result<serde_json::Value, DecodeError> {
    match cell_type {
        "s" => {
            let index: usize = raw
                .trim()
                .parse()
                .map_err(|_| DecodeError::Malformed(format!("bad shared string index {raw:?}")))?;
            let text = shared.get(index).ok_or_else(|| {
                DecodeError::Malformed(format!("shared string index {index} out of range"))
            })?;
            Ok(serde_json::Value::String(text.clone()))
        }
        "b" => Ok(serde_json::Value::Bool(raw.trim() == "1")),
        "str" | "inlineStr" | "e" => Ok(serde_json::Value::String(raw.to_string())),
        _ => {
            let trimmed = raw.trim();
            if let Ok(int) = trimmed.parse::<i64>() {
                Ok(serde_json::Value::from(int))
            } else if let Ok(float) = trimmed.parse::<f64>() {
                Ok(serde_json::Value::from(float))
            } else {
                Ok(serde_json::Value::String(raw.to_string()))
            }
        }
    }
}

static EXTERNAL_LINK_INDEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"externalLink(\d+)\.xml$").unwrap());

/// Placeholder index (the `[n]` cited by formulas) to the linked workbook
/// path, resolved from the relationship parts rather than formula text.
fn resolve_external_refs<R: Read + std::io::Seek>(
    archive: &mut ZipArchive<R>,
    rels: &[Relationship],
) -> Result<BTreeMap<u32, String>, DecodeError> {
    let mut refs = BTreeMap::new();
    for rel in rels {
        if !rel.rel_type.ends_with("/externalLink") {
            continue;
        }
        let Some(caps) = EXTERNAL_LINK_INDEX.captures(&rel.target) else {
            continue;
        };
        let index: u32 = caps[1]
            .parse()
            .map_err(|_| DecodeError::Malformed(format!("bad external link {:?}", rel.target)))?;

        let link_part = part_path(&rel.target);
        let link_rels_part = link_rels_path(&link_part);
        let mut path = String::new();
        if let Some(xml) = read_part(archive, &link_rels_part)? {
            for link_rel in parse_relationships(&xml)? {
                if link_rel.rel_type.ends_with("/externalLinkPath") {
                    path = link_rel.target;
                    break;
                }
            }
        }
        refs.insert(index, path);
    }
    Ok(refs)
}

/// `xl/externalLinks/externalLink1.xml` ->
/// `xl/externalLinks/_rels/externalLink1.xml.rels`
fn link_rels_path(part: &str) -> String {
    match part.rsplit_once('/') {
        Some((dir, file)) => format!("{dir}/_rels/{file}.rels"),
        None => format!("_rels/{part}.rels"),
    }
}

fn parse_last_author(xml: &str) -> Result<Option<String>, DecodeError> {
    let mut reader = xml_reader(xml);
    let mut in_field = false;
    let mut author = None;
    loop {
        match reader.read_event().map_err(malformed)? {
            Event::Start(e) if e.local_name().as_ref() == b"lastModifiedBy" => in_field = true,
            Event::Text(t) if in_field => {
                author = Some(t.unescape().map_err(malformed)?.into_owned());
            }
            Event::End(e) if e.local_name().as_ref() == b"lastModifiedBy" => break,
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(author.filter(|a| !a.is_empty()))
}
