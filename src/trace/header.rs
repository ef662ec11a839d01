//! `<DataFileHeader>` XML header.
//!
//! ```xml
//! <DataFileHeader>
//!   <Variables>
//!     <Element name="scanName" type="str">rabi</Element>
//!     <Element name="fit" type="dict">
//!       <Element name="slope" type="float">0.1</Element>
//!     </Element>
//!   </Variables>
//!   <Traces>
//!     <Trace name="counts" rows="10" finalized="true">
//!       <Description>...</Description>
//!       <ColumnSpec>x,y,top,bottom,raw,timeTickFirst,timeTickLast</ColumnSpec>
//!       <ColumnTypes>float,float,float,float,int,int,int</ColumnTypes>
//!     </Trace>
//!   </Traces>
//!   <ColumnSpec>counts.x,counts.y,...</ColumnSpec>
//! </DataFileHeader>
//! ```
//!
//! The top-level `ColumnSpec` names the body columns in order; each body
//! column is `<trace>.<column>`.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde::{Deserialize, Serialize};

use super::{ColumnType, MetaValue};
use crate::error::TraceError;

/// Header of one trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceHeader {
    /// Trace name.
    pub name: String,
    /// Trace description.
    pub description: BTreeMap<String, MetaValue>,
    /// Columns in order.
    pub columns: Vec<(String, ColumnType)>,
    /// Number of rows.
    pub rows: usize,
    /// Whether the trace was finalized when written.
    pub finalized: bool,
}

/// Header of a trace file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FileHeader {
    /// Collection description.
    pub variables: BTreeMap<String, MetaValue>,
    /// Per-trace headers in file order.
    pub traces: Vec<TraceHeader>,
}

impl FileHeader {
    /// Body column names (`trace.column`) in order.
    pub fn column_spec(&self) -> Vec<String> {
        self.traces
            .iter()
            .flat_map(|t| t.columns.iter().map(move |(c, _)| format!("{}.{}", t.name, c)))
            .collect()
    }

    /// Number of body rows.
    pub fn body_rows(&self) -> usize {
        self.traces.iter().map(|t| t.rows).max().unwrap_or(0)
    }

    /// Pretty-printed XML.
    pub fn to_xml(&self) -> Result<String, TraceError> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        start(&mut writer, BytesStart::new("DataFileHeader"))?;

        start(&mut writer, BytesStart::new("Variables"))?;
        write_elements(&mut writer, &self.variables)?;
        end(&mut writer, "Variables")?;

        start(&mut writer, BytesStart::new("Traces"))?;
        for trace in &self.traces {
            let rows = trace.rows.to_string();
            let mut tag = BytesStart::new("Trace");
            tag.push_attribute(("name", trace.name.as_str()));
            tag.push_attribute(("rows", rows.as_str()));
            tag.push_attribute(("finalized", if trace.finalized { "true" } else { "false" }));
            start(&mut writer, tag)?;

            start(&mut writer, BytesStart::new("Description"))?;
            write_elements(&mut writer, &trace.description)?;
            end(&mut writer, "Description")?;

            let names: Vec<&str> = trace.columns.iter().map(|(n, _)| n.as_str()).collect();
            let types: Vec<&str> = trace.columns.iter().map(|(_, t)| t.name()).collect();
            text_element(&mut writer, "ColumnSpec", &names.join(","))?;
            text_element(&mut writer, "ColumnTypes", &types.join(","))?;
            end(&mut writer, "Trace")?;
        }
        end(&mut writer, "Traces")?;

        text_element(&mut writer, "ColumnSpec", &self.column_spec().join(","))?;
        end(&mut writer, "DataFileHeader")?;

        String::from_utf8(writer.into_inner()).map_err(|e| TraceError::Xml(e.to_string()))
    }

    /// Parse XML written by [`to_xml`](Self::to_xml).
    pub fn from_xml(xml: &str) -> Result<Self, TraceError> {
        let root = parse_tree(xml)?;
        if root.name != "DataFileHeader" {
            return Err(TraceError::Xml(format!(
                "expected <DataFileHeader>, found <{}>",
                root.name
            )));
        }

        let variables = match root.child("Variables") {
            Some(node) => read_elements(node)?,
            None => BTreeMap::new(),
        };

        let mut traces = Vec::new();
        if let Some(list) = root.child("Traces") {
            for node in list.children.iter().filter(|c| c.name == "Trace") {
                traces.push(read_trace(node)?);
            }
        }
        Ok(Self { variables, traces })
    }
}

fn xml_err(e: impl std::fmt::Display) -> TraceError {
    TraceError::Xml(e.to_string())
}

fn start(writer: &mut Writer<Vec<u8>>, tag: BytesStart<'_>) -> Result<(), TraceError> {
    writer.write_event(Event::Start(tag)).map_err(xml_err)
}

fn end(writer: &mut Writer<Vec<u8>>, name: &str) -> Result<(), TraceError> {
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .map_err(xml_err)
}

fn text_element(writer: &mut Writer<Vec<u8>>, name: &str, text: &str) -> Result<(), TraceError> {
    start(writer, BytesStart::new(name))?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .map_err(xml_err)?;
    end(writer, name)
}

fn write_elements(
    writer: &mut Writer<Vec<u8>>,
    elements: &BTreeMap<String, MetaValue>,
) -> Result<(), TraceError> {
    for (name, value) in elements {
        let mut tag = BytesStart::new("Element");
        tag.push_attribute(("name", name.as_str()));
        tag.push_attribute(("type", value.type_name()));
        match value {
            MetaValue::Dict(inner) => {
                start(writer, tag)?;
                write_elements(writer, inner)?;
                end(writer, "Element")?;
            }
            scalar => {
                start(writer, tag)?;
                writer
                    .write_event(Event::Text(BytesText::new(&scalar_text(scalar))))
                    .map_err(xml_err)?;
                end(writer, "Element")?;
            }
        }
    }
    Ok(())
}

fn scalar_text(value: &MetaValue) -> String {
    match value {
        MetaValue::Str(s) => s.clone(),
        MetaValue::Int(i) => i.to_string(),
        MetaValue::Float(f) => f.to_string(),
        MetaValue::DateTime(t) => t.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        MetaValue::Dict(_) => String::new(),
    }
}

fn parse_scalar(name: &str, ty: &str, text: &str) -> Result<MetaValue, TraceError> {
    let bad = |what: &str| TraceError::Xml(format!("element '{name}': bad {what} '{text}'"));
    Ok(match ty {
        "str" => MetaValue::Str(text.to_string()),
        "int" => MetaValue::Int(text.trim().parse().map_err(|_| bad("int"))?),
        "float" => MetaValue::Float(text.trim().parse().map_err(|_| bad("float"))?),
        "datetime" => MetaValue::DateTime(
            DateTime::parse_from_rfc3339(text.trim())
                .map_err(|_| bad("datetime"))?
                .with_timezone(&Utc),
        ),
        other => return Err(TraceError::Xml(format!("element '{name}': unknown type '{other}'"))),
    })
}

fn read_elements(node: &XmlNode) -> Result<BTreeMap<String, MetaValue>, TraceError> {
    let mut out = BTreeMap::new();
    for child in node.children.iter().filter(|c| c.name == "Element") {
        let name = child.required("name")?.to_string();
        let ty = child.required("type")?;
        let value = if ty == "dict" {
            MetaValue::Dict(read_elements(child)?)
        } else {
            parse_scalar(&name, ty, &child.text)?
        };
        out.insert(name, value);
    }
    Ok(out)
}

fn read_trace(node: &XmlNode) -> Result<TraceHeader, TraceError> {
    let name = node.required("name")?.to_string();
    let rows = node
        .required("rows")?
        .parse()
        .map_err(|_| TraceError::Xml(format!("trace '{name}': bad row count")))?;
    let finalized = node.attribute("finalized") == Some("true");
    let description = match node.child("Description") {
        Some(d) => read_elements(d)?,
        None => BTreeMap::new(),
    };
    let spec = node.child("ColumnSpec").map_or("", |c| c.text.as_str());
    let types = node.child("ColumnTypes").map_or("", |c| c.text.as_str());
    let names: Vec<&str> = split_list(spec);
    let types: Vec<&str> = split_list(types);
    if names.len() != types.len() {
        return Err(TraceError::Xml(format!(
            "trace '{name}': {} columns but {} types",
            names.len(),
            types.len()
        )));
    }
    let columns = names
        .into_iter()
        .zip(types)
        .map(|(n, t)| Ok((n.to_string(), ColumnType::parse(t)?)))
        .collect::<Result<Vec<_>, TraceError>>()?;
    Ok(TraceHeader {
        name,
        description,
        columns,
        rows,
        finalized,
    })
}

fn split_list(text: &str) -> Vec<&str> {
    text.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Minimal element tree of the header.
#[derive(Debug, Default)]
struct XmlNode {
    name: String,
    attributes: Vec<(String, String)>,
    children: Vec<XmlNode>,
    text: String,
}

impl XmlNode {
    fn from_start(e: &BytesStart<'_>) -> Result<Self, TraceError> {
        let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
        let mut attributes = Vec::new();
        for attr in e.attributes() {
            let attr = attr.map_err(xml_err)?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr.unescape_value().map_err(xml_err)?.into_owned();
            attributes.push((key, value));
        }
        Ok(Self {
            name,
            attributes,
            ..Default::default()
        })
    }

    fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn required(&self, key: &str) -> Result<&str, TraceError> {
        self.attribute(key).ok_or_else(|| {
            TraceError::Xml(format!("<{}> is missing attribute '{key}'", self.name))
        })
    }

    fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == name)
    }
}

fn parse_tree(xml: &str) -> Result<XmlNode, TraceError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<XmlNode> = Vec::new();
    let mut root = None;
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => stack.push(XmlNode::from_start(&e)?),
            Event::Empty(e) => {
                let node = XmlNode::from_start(&e)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => root = Some(node),
                }
            }
            Event::Text(t) => {
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&t.unescape().map_err(xml_err)?);
                }
            }
            Event::End(_) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| TraceError::Xml("unbalanced end tag".into()))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => root = Some(node),
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    if !stack.is_empty() {
        return Err(TraceError::Xml("unterminated element".into()));
    }
    root.ok_or_else(|| TraceError::Xml("empty header".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FileHeader {
        let mut fit = BTreeMap::new();
        fit.insert("slope".to_string(), MetaValue::Float(0.1));
        fit.insert("function".to_string(), MetaValue::from("linear"));

        let mut variables = BTreeMap::new();
        variables.insert("scanName".to_string(), MetaValue::from("rabi <&> 'q'"));
        variables.insert("repeats".to_string(), MetaValue::Int(-3));
        variables.insert("third".to_string(), MetaValue::Float(1.0 / 3.0));
        variables.insert("fit".to_string(), MetaValue::Dict(fit));
        variables.insert(
            "fileCreation".to_string(),
            MetaValue::DateTime(Utc::now()),
        );

        FileHeader {
            variables,
            traces: vec![TraceHeader {
                name: "counts".into(),
                description: BTreeMap::from([("comment".to_string(), MetaValue::from("ok"))]),
                columns: vec![
                    ("x".into(), ColumnType::Float),
                    ("raw".into(), ColumnType::Int),
                ],
                rows: 3,
                finalized: true,
            }],
        }
    }

    #[test]
    fn xml_round_trip_is_exact() {
        let header = sample();
        let xml = header.to_xml().unwrap();
        assert!(xml.starts_with("<DataFileHeader>"));
        assert!(xml.contains("<ColumnSpec>counts.x,counts.raw</ColumnSpec>"));
        assert_eq!(FileHeader::from_xml(&xml).unwrap(), header);
    }

    #[test]
    fn rejects_unknown_types() {
        let xml = r#"<DataFileHeader><Variables><Element name="a" type="complex">1</Element></Variables></DataFileHeader>"#;
        assert!(matches!(FileHeader::from_xml(xml), Err(TraceError::Xml(_))));
    }

    #[test]
    fn rejects_foreign_root() {
        assert!(FileHeader::from_xml("<Other/>").is_err());
    }
}
