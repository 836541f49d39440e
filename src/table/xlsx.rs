use super::RawTable;
use crate::error::{DispatchError, DispatchResult};
use quick_xml::escape::resolve_xml_entity;
use quick_xml::events::{BytesRef, BytesStart, Event};
use quick_xml::Reader;
use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Seek};
use zip::result::ZipError;
use zip::ZipArchive;

const WORKBOOK: &str = "xl/workbook.xml";
const WORKBOOK_RELS: &str = "xl/_rels/workbook.xml.rels";
const SHARED_STRINGS: &str = "xl/sharedStrings.xml";
const FALLBACK_SHEET: &str = "xl/worksheets/sheet1.xml";
const MAX_COLUMNS: usize = 16_384; // XFD

#[derive(Debug, thiserror::Error)]
enum XlsxError {
    #[error("{0}")]
    Zip(#[from] ZipError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Xml(#[from] quick_xml::Error),
    #[error("{0}")]
    XmlEncoding(#[from] quick_xml::encoding::EncodingError),
    #[error("{0}")]
    XmlEscape(#[from] quick_xml::escape::EscapeError),
    #[error("{0}")]
    XmlAttribute(#[from] quick_xml::events::attributes::AttrError),
    #[error("{0}")]
    Number(#[from] std::num::ParseIntError),
    #[error("missing workbook part {0}")]
    MissingPart(String),
    #[error("unknown XML entity '&{0};'")]
    Entity(String),
    #[error("cell {0} references unknown shared string {1}")]
    SharedString(String, usize),
    #[error("cell reference '{0}' is beyond column XFD")]
    ColumnOutOfRange(String),
    #[error("worksheet has no header row")]
    NoHeaderRow,
}

/// Reads the first worksheet of an `.xlsx` workbook.
///
/// The first row holding any value is the header row; every later row is
/// data, with cells placed by their `r` reference so gaps stay aligned.
pub fn read_xlsx<R: Read + Seek>(reader: R) -> DispatchResult<RawTable> {
    read_workbook(reader).map_err(|e| DispatchError::Input(format!("invalid xlsx workbook: {e}")))
}

fn read_workbook<R: Read + Seek>(reader: R) -> Result<RawTable, XlsxError> {
    let mut zip = ZipArchive::new(reader)?;
    let sheet_path = first_sheet_path(&mut zip)?;
    log::debug!("Reading worksheet {sheet_path}");

    let shared_strings = match read_part(&mut zip, SHARED_STRINGS)? {
        Some(xml) => parse_shared_strings(&xml)?,
        None => Vec::new(),
    };
    let sheet = read_part(&mut zip, &sheet_path)?
        .ok_or_else(|| XlsxError::MissingPart(sheet_path.clone()))?;
    let mut rows = parse_sheet_rows(&sheet, &shared_strings)?.into_iter();

    let Some(header_row) = rows.by_ref().find(|row| !row.is_empty()) else {
        return Err(XlsxError::NoHeaderRow);
    };
    let width = header_row.keys().next_back().map(|col| col + 1).unwrap_or(0);
    let headers: Vec<String> = (0..width)
        .map(|col| header_row.get(&col).cloned().unwrap_or_default())
        .collect();

    let data = rows.map(|mut row| (0..width).map(|col| row.remove(&col)).collect::<Vec<_>>());
    Ok(RawTable::from_rows(headers, data))
}

/// Finds a part by name, ignoring case and path separator style.
fn read_part<R: Read + Seek>(
    zip: &mut ZipArchive<R>,
    name: &str,
) -> Result<Option<String>, XlsxError> {
    let wanted = name.replace('\\', "/");
    let actual = zip
        .file_names()
        .find(|file_name| wanted.eq_ignore_ascii_case(&file_name.replace('\\', "/")))
        .map(|file_name| file_name.to_owned());
    let Some(actual) = actual else {
        return Ok(None);
    };

    let mut file = match zip.by_name(&actual) {
        Ok(file) => file,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(error) => return Err(error.into()),
    };
    let mut content = String::new();
    file.read_to_string(&mut content)?;
    Ok(Some(content))
}

fn xml_reader(xml: &str) -> Reader<&[u8]> {
    let mut reader = Reader::from_str(xml);
    let config = reader.config_mut();
    config.check_end_names = false;
    config.expand_empty_elements = true;
    config.trim_text(false);
    reader
}

fn attribute(event: &BytesStart<'_>, name: &str) -> Result<Option<String>, XlsxError> {
    match event.try_get_attribute(name)? {
        Some(attribute) => Ok(Some(attribute.unescape_value()?.into_owned())),
        None => Ok(None),
    }
}

fn push_reference(text: &mut String, reference: &BytesRef<'_>) -> Result<(), XlsxError> {
    let raw = reference.xml_content()?;
    if let Some(number) = raw.strip_prefix('#') {
        let code = match number.strip_prefix('x') {
            Some(hex) => u32::from_str_radix(hex, 16)?,
            None => number.parse::<u32>()?,
        };
        if let Some(character) = char::from_u32(code) {
            text.push(character);
        }
    } else if let Some(entity) = resolve_xml_entity(&raw) {
        text.push_str(entity);
    } else {
        return Err(XlsxError::Entity(raw.into_owned()));
    }
    Ok(())
}

fn first_sheet_path<R: Read + Seek>(zip: &mut ZipArchive<R>) -> Result<String, XlsxError> {
    let workbook = read_part(zip, WORKBOOK)?
        .ok_or_else(|| XlsxError::MissingPart(WORKBOOK.to_string()))?;

    let mut relationship_id = None;
    let mut reader = xml_reader(&workbook);
    loop {
        match reader.read_event()? {
            Event::Start(event) if event.local_name().as_ref() == b"sheet" => {
                for result in event.attributes() {
                    let attribute = result?;
                    if attribute.key.local_name().as_ref() == b"id" {
                        relationship_id = Some(attribute.unescape_value()?.into_owned());
                    }
                }
                break;
            }
            Event::Eof => break,
            _ => (),
        }
    }

    let Some(relationship_id) = relationship_id else {
        return Ok(FALLBACK_SHEET.to_string());
    };
    let Some(rels) = read_part(zip, WORKBOOK_RELS)? else {
        return Ok(FALLBACK_SHEET.to_string());
    };

    let mut reader = xml_reader(&rels);
    loop {
        match reader.read_event()? {
            Event::Start(event) if event.local_name().as_ref() == b"Relationship" => {
                if attribute(&event, "Id")?.as_deref() == Some(relationship_id.as_str()) {
                    if let Some(target) = attribute(&event, "Target")? {
                        return Ok(to_zip_path(&target));
                    }
                }
            }
            Event::Eof => break,
            _ => (),
        }
    }
    Ok(FALLBACK_SHEET.to_string())
}

/// Relationship targets are relative to `xl/` unless absolute.
fn to_zip_path(target: &str) -> String {
    let target = target.replace('\\', "/");
    match target.strip_prefix('/') {
        Some(absolute) => absolute.to_string(),
        None => format!("xl/{target}"),
    }
}

fn parse_shared_strings(xml: &str) -> Result<Vec<String>, XlsxError> {
    let mut strings = Vec::new();
    let mut current = String::new();
    let mut in_text = false;
    let mut in_phonetic = false;

    let mut reader = xml_reader(xml);
    loop {
        match reader.read_event()? {
            Event::Start(event) => match event.local_name().as_ref() {
                b"si" => current.clear(),
                b"rPh" => in_phonetic = true,
                b"t" if !in_phonetic => in_text = true,
                _ => (),
            },
            Event::End(event) => match event.local_name().as_ref() {
                b"si" => strings.push(std::mem::take(&mut current)),
                b"rPh" => in_phonetic = false,
                b"t" => in_text = false,
                _ => (),
            },
            Event::Text(text) if in_text => current.push_str(&text.xml_content()?),
            Event::CData(text) if in_text => current.push_str(&text.xml_content()?),
            Event::GeneralRef(reference) if in_text => push_reference(&mut current, &reference)?,
            Event::Eof => break,
            _ => (),
        }
    }
    Ok(strings)
}

/// Cell kind from the `t` attribute of `<c>`.
#[derive(Debug, Clone, Copy, PartialEq)]
enum CellKind {
    Shared,
    Inline,
    Value,
}

fn parse_sheet_rows(
    xml: &str,
    shared_strings: &[String],
) -> Result<Vec<BTreeMap<usize, String>>, XlsxError> {
    let mut rows = Vec::new();
    let mut row: BTreeMap<usize, String> = BTreeMap::new();
    let mut reference = String::new();
    let mut column = 0usize;
    let mut next_column = 0usize;
    let mut kind = CellKind::Value;
    let mut value = String::new();
    let mut in_value = false;
    let mut in_phonetic = false;

    let mut reader = xml_reader(xml);
    loop {
        match reader.read_event()? {
            Event::Start(event) => match event.local_name().as_ref() {
                b"row" => {
                    row = BTreeMap::new();
                    next_column = 0;
                }
                b"c" => {
                    reference = attribute(&event, "r")?.unwrap_or_default();
                    column = column_index(&reference)?.unwrap_or(next_column);
                    if column >= MAX_COLUMNS {
                        return Err(XlsxError::ColumnOutOfRange(reference));
                    }
                    next_column = column + 1;
                    kind = match attribute(&event, "t")?.as_deref() {
                        Some("s") => CellKind::Shared,
                        Some("inlineStr") => CellKind::Inline,
                        _ => CellKind::Value,
                    };
                    value.clear();
                }
                b"v" => in_value = true,
                b"t" if kind == CellKind::Inline && !in_phonetic => in_value = true,
                b"rPh" => in_phonetic = true,
                _ => (),
            },
            Event::End(event) => match event.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"rPh" => in_phonetic = false,
                b"c" => {
                    let text = match kind {
                        CellKind::Shared if !value.trim().is_empty() => {
                            let index = value.trim().parse::<usize>()?;
                            shared_strings
                                .get(index)
                                .cloned()
                                .ok_or_else(|| XlsxError::SharedString(reference.clone(), index))?
                        }
                        _ => std::mem::take(&mut value),
                    };
                    if !text.trim().is_empty() {
                        row.insert(column, text);
                    }
                    value.clear();
                }
                b"row" => rows.push(std::mem::take(&mut row)),
                _ => (),
            },
            Event::Text(text) if in_value => value.push_str(&text.xml_content()?),
            Event::CData(text) if in_value => value.push_str(&text.xml_content()?),
            Event::GeneralRef(reference) if in_value => push_reference(&mut value, &reference)?,
            Event::Eof => break,
            _ => (),
        }
    }
    Ok(rows)
}

/// Zero-based column of a cell reference such as `AB12`, `None` when the
/// reference carries no column letters.
fn column_index(reference: &str) -> Result<Option<usize>, XlsxError> {
    let mut column = 0usize;
    let mut seen = false;
    for c in reference.chars().take_while(|c| c.is_ascii_alphabetic()) {
        let digit = c.to_ascii_uppercase() as usize - 'A' as usize + 1;
        column = column
            .checked_mul(26)
            .and_then(|column| column.checked_add(digit))
            .filter(|&column| column <= MAX_COLUMNS)
            .ok_or_else(|| XlsxError::ColumnOutOfRange(reference.to_string()))?;
        seen = true;
    }
    Ok(seen.then(|| column - 1))
}
