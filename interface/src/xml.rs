//! # XML data adaptor
//!
//! A minimal element tree with ordered attributes and ordered children,
//! parsed with [quick_xml] and written back as indented XML.
//!
//! Floating point values are written with the shortest representation that
//! round-trips exactly.

use std::{fmt::Display, str::FromStr};

use quick_xml::{events::Event, Reader};

#[derive(Debug, thiserror::Error)]
pub enum XmlError {
    #[error("XML parsing failed: {0}")]
    Parse(String),
    #[error("missing attribute {attribute} in element {element}")]
    MissingAttribute { element: String, attribute: String },
    #[error("invalid value {value:?} for attribute {attribute} in element {element}")]
    InvalidValue {
        element: String,
        attribute: String,
        value: String,
    },
    #[error("missing element {0}")]
    MissingElement(String),
    #[error("the XML document is empty")]
    Empty,
}
pub type Result<T> = std::result::Result<T, XmlError>;

/// XML element
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataAdaptor {
    name: String,
    attributes: Vec<(String, String)>,
    children: Vec<DataAdaptor>,
}

impl DataAdaptor {
    /// Creates an empty element
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    /// Sets an attribute value, replacing any previous value
    pub fn set_value<K: AsRef<str>, V: Display>(&mut self, key: K, value: V) -> &mut Self {
        let value = value.to_string();
        match self
            .attributes
            .iter_mut()
            .find(|(k, _)| k.as_str() == key.as_ref())
        {
            Some((_, v)) => *v = value,
            None => self.attributes.push((key.as_ref().to_string(), value)),
        }
        self
    }
    /// Chained version of [DataAdaptor::set_value]
    pub fn with_value<K: AsRef<str>, V: Display>(mut self, key: K, value: V) -> Self {
        self.set_value(key, value);
        self
    }
    pub fn has_attribute(&self, key: &str) -> bool {
        self.attributes.iter().any(|(k, _)| k == key)
    }
    pub fn string_value(&self, key: &str) -> Result<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .ok_or_else(|| XmlError::MissingAttribute {
                element: self.name.clone(),
                attribute: key.to_string(),
            })
    }
    /// Parses an attribute value
    pub fn value<T: FromStr>(&self, key: &str) -> Result<T> {
        let value = self.string_value(key)?;
        value.trim().parse().map_err(|_| XmlError::InvalidValue {
            element: self.name.clone(),
            attribute: key.to_string(),
            value: value.to_string(),
        })
    }
    pub fn f64_value(&self, key: &str) -> Result<f64> {
        self.value(key)
    }
    /// Parses a boolean written either as `true`/`false` or as `1`/`0`
    pub fn bool_value(&self, key: &str) -> Result<bool> {
        match self.string_value(key)?.trim() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            value => Err(XmlError::InvalidValue {
                element: self.name.clone(),
                attribute: key.to_string(),
                value: value.to_string(),
            }),
        }
    }
    /// Parses a whitespace separated list of numbers
    pub fn f64_array(&self, key: &str) -> Result<Vec<f64>> {
        self.string_value(key)?
            .split_whitespace()
            .map(|v| {
                v.parse().map_err(|_| XmlError::InvalidValue {
                    element: self.name.clone(),
                    attribute: key.to_string(),
                    value: v.to_string(),
                })
            })
            .collect()
    }
    /// Writes a whitespace separated list of numbers
    pub fn set_f64_array(&mut self, key: &str, values: &[f64]) -> &mut Self {
        let s: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        self.set_value(key, s.join(" "))
    }
    /// Returns the first child with the given name
    pub fn child(&self, name: &str) -> Option<&DataAdaptor> {
        self.children.iter().find(|c| c.name == name)
    }
    /// Returns the first child with the given name or an error
    pub fn require_child(&self, name: &str) -> Result<&DataAdaptor> {
        self.child(name)
            .ok_or_else(|| XmlError::MissingElement(format!("{}/{}", self.name, name)))
    }
    /// Iterates over the children with the given name
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a DataAdaptor> {
        self.children.iter().filter(move |c| c.name == name)
    }
    pub fn children(&self) -> &[DataAdaptor] {
        &self.children
    }
    /// Appends a new empty child and returns it
    pub fn create_child<S: Into<String>>(&mut self, name: S) -> &mut DataAdaptor {
        self.children.push(DataAdaptor::new(name));
        let n = self.children.len();
        &mut self.children[n - 1]
    }
    pub fn add_child(&mut self, child: DataAdaptor) -> &mut Self {
        self.children.push(child);
        self
    }

    /// Parses a XML document returning its root element
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut buf = Vec::new();
        let mut stack: Vec<DataAdaptor> = Vec::new();
        let mut root: Option<DataAdaptor> = None;
        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(e)) => {
                    stack.push(Self::element(&e)?);
                }
                Ok(Event::Empty(e)) => {
                    let element = Self::element(&e)?;
                    match stack.last_mut() {
                        Some(parent) => {
                            parent.children.push(element);
                        }
                        None => root = root.or(Some(element)),
                    }
                }
                Ok(Event::End(_)) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| XmlError::Parse("unbalanced end tag".into()))?;
                    match stack.last_mut() {
                        Some(parent) => {
                            parent.children.push(element);
                        }
                        None => root = root.or(Some(element)),
                    }
                }
                Ok(Event::Eof) => break,
                Err(e) => return Err(XmlError::Parse(e.to_string())),
                _ => {}
            }
            buf.clear();
        }
        if !stack.is_empty() {
            return Err(XmlError::Parse("unclosed element".into()));
        }
        root.ok_or(XmlError::Empty)
    }
    fn element(e: &quick_xml::events::BytesStart) -> Result<Self> {
        let mut element = DataAdaptor::new(String::from_utf8_lossy(e.name().as_ref()).to_string());
        for attr in e.attributes() {
            let attr = attr.map_err(|e| XmlError::Parse(e.to_string()))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
            let raw = String::from_utf8_lossy(&attr.value).to_string();
            let value = quick_xml::escape::unescape(&raw)
                .map_err(|e| XmlError::Parse(e.to_string()))?
                .to_string();
            element.attributes.push((key, value));
        }
        Ok(element)
    }

    /// Writes the element and its children as a XML document
    pub fn to_xml_string(&self) -> String {
        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        self.write(&mut xml, 0);
        xml
    }
    fn write(&self, xml: &mut String, depth: usize) {
        let indent = "    ".repeat(depth);
        xml.push_str(&indent);
        xml.push('<');
        xml.push_str(&self.name);
        for (key, value) in &self.attributes {
            xml.push_str(&format!(" {}=\"{}\"", key, quick_xml::escape::escape(value.as_str())));
        }
        if self.children.is_empty() {
            xml.push_str("/>\n");
        } else {
            xml.push_str(">\n");
            for child in &self.children {
                child.write(xml, depth + 1);
            }
            xml.push_str(&format!("{indent}</{}>\n", self.name));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut root = DataAdaptor::new("WARM_LINAC_TUNEUP");
        root.set_value("keep_cav_params", false);
        let cav = root.create_child("CAVITY");
        cav.set_value("alias", "DTL1");
        cav.set_value("newPhase", -0.1 + 0.2);
        cav.set_value("name", "a<b & \"c\"");
        cav.set_f64_array("phase", &[1. / 3., -180., 1e-17]);
        root.create_child("BPM").set_value("alias", "MEBT_Diag:BPM11");
        let xml = root.to_xml_string();
        let back = DataAdaptor::parse(&xml).unwrap();
        assert_eq!(back, root);
        let cav = back.child("CAVITY").unwrap();
        assert_eq!(cav.f64_value("newPhase").unwrap(), -0.1 + 0.2);
        assert_eq!(cav.f64_array("phase").unwrap()[0], 1. / 3.);
        assert_eq!(cav.string_value("name").unwrap(), "a<b & \"c\"");
        assert!(!back.bool_value("keep_cav_params").unwrap());
    }

    #[test]
    fn tolerates_unknown_elements() {
        let xml = r#"<ROOT version="2"><FUTURE a="1"><NESTED/></FUTURE><BPM alias="B1" pos="1.5"/></ROOT>"#;
        let root = DataAdaptor::parse(xml).unwrap();
        assert_eq!(root.children_named("BPM").count(), 1);
        assert_eq!(root.require_child("BPM").unwrap().f64_value("pos").unwrap(), 1.5);
        assert!(root.require_child("CAVITY").is_err());
        assert!(matches!(
            root.require_child("BPM").unwrap().f64_value("alias"),
            Err(XmlError::InvalidValue { .. })
        ));
    }
}
