//! Hardware description loader.
//!
//! Populates a [`RegisterFile`] from the register-map XML document.
//! The document is a list of `<group>` elements holding `<register>`
//! and `<array>` declarations; registers may carry `<bit>` overlays
//! with `<choice>` values and multilingual `<descr>` children.

use std::collections::BTreeMap;

use roxmltree::Node;
use thiserror::Error;

use super::{
    BitField, Choice, REG_COUNT, RegAccess, RegArray, RegError, RegGroup, Register, RegisterFile,
};

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("XML parse error: {0}")]
    Xml(#[from] roxmltree::Error),

    #[error("<{element}> is missing attribute {attr}")]
    MissingAttr {
        element: &'static str,
        attr: &'static str,
    },

    #[error("bad value {value} for attribute {attr} on <{element}>")]
    BadAttr {
        element: &'static str,
        attr: &'static str,
        value: String,
    },

    #[error("array {name} runs past the register bank (base 0x{base:02X}, count {count})")]
    ArrayTooLong { name: String, base: u8, count: u8 },

    #[error(transparent)]
    Reg(#[from] RegError),
}

/// Parses the register-map document into a fresh container.
pub fn load_registers(xml: &str) -> Result<RegisterFile, LoadError> {
    let doc = roxmltree::Document::parse(xml)?;
    let mut file = RegisterFile::new();

    for group_node in doc
        .root_element()
        .children()
        .filter(|n| n.has_tag_name("group"))
    {
        let group_name = require_attr(&group_node, "group", "name")?;
        let mut addrs = Vec::new();

        for node in group_node.children().filter(Node::is_element) {
            match node.tag_name().name() {
                "register" => {
                    let reg = parse_register(&node)?;
                    addrs.push(reg.addr);
                    file.add_register(reg)?;
                }
                "array" => {
                    let array = parse_array(&node)?;
                    let access = parse_access(&node)?;
                    for i in 0..array.count {
                        let member = Register {
                            name: format!("{}{}", array.name, i),
                            shortname: format!("{}{}", array.name.to_uppercase(), i),
                            addr: array.base + i,
                            access,
                            min: None,
                            max: None,
                            descriptions: parse_descriptions(&node),
                            fields: Vec::new(),
                        };
                        addrs.push(member.addr);
                        file.add_register(member)?;
                    }
                    file.add_array(array)?;
                }
                _ => {}
            }
        }

        file.add_group(RegGroup {
            name: group_name.to_string(),
            addrs,
        })?;
    }

    Ok(file)
}

/// The register map shipped with the crate.
pub fn default_registers() -> Result<RegisterFile, LoadError> {
    load_registers(include_str!("../../data/regs.xml"))
}

fn parse_register(node: &Node) -> Result<Register, LoadError> {
    let name = require_attr(node, "register", "name")?;
    let addr = parse_u8(node, "register", "addr")?;
    let shortname = match node.attribute("shortname") {
        Some(s) => s.to_string(),
        None => name.to_uppercase(),
    };

    let mut fields = Vec::new();
    for bit in node.children().filter(|n| n.has_tag_name("bit")) {
        fields.push(parse_bit(&bit)?);
    }

    Ok(Register {
        name: name.to_string(),
        shortname,
        addr,
        access: parse_access(node)?,
        min: opt_num(node, "register", "min")?,
        max: opt_num(node, "register", "max")?,
        descriptions: parse_descriptions(node),
        fields,
    })
}

fn parse_array(node: &Node) -> Result<RegArray, LoadError> {
    let name = require_attr(node, "array", "name")?.to_string();
    let base = parse_u8(node, "array", "addr")?;
    let count = parse_u8(node, "array", "count")?;
    if base as usize + count as usize > REG_COUNT {
        return Err(LoadError::ArrayTooLong { name, base, count });
    }
    Ok(RegArray { name, base, count })
}

fn parse_bit(node: &Node) -> Result<BitField, LoadError> {
    let mut choices = Vec::new();
    for choice in node.children().filter(|n| n.has_tag_name("choice")) {
        choices.push(Choice {
            name: require_attr(&choice, "choice", "name")?.to_string(),
            value: parse_num(&choice, "choice", "value")?,
            descriptions: parse_descriptions(&choice),
        });
    }
    Ok(BitField {
        name: require_attr(node, "bit", "name")?.to_string(),
        offset: parse_u8(node, "bit", "offset")?,
        width: opt_u8(node, "bit", "width")?.unwrap_or(1),
        choices,
    })
}

fn parse_access(node: &Node) -> Result<RegAccess, LoadError> {
    match node.attribute("access").unwrap_or("r") {
        "r" => Ok(RegAccess::ReadOnly),
        "rw" => Ok(RegAccess::ReadWrite),
        other => Err(LoadError::BadAttr {
            element: "register",
            attr: "access",
            value: other.to_string(),
        }),
    }
}

/// The `descr` attribute is the default language; `<descr lang="..">`
/// children add translations.
fn parse_descriptions(node: &Node) -> BTreeMap<String, String> {
    let mut descriptions = BTreeMap::new();
    if let Some(text) = node.attribute("descr") {
        descriptions.insert(String::new(), text.to_string());
    }
    for child in node.children().filter(|n| n.has_tag_name("descr")) {
        let lang = child.attribute("lang").unwrap_or("").to_string();
        if let Some(text) = child.text() {
            descriptions.insert(lang, text.trim().to_string());
        }
    }
    descriptions
}

fn require_attr<'a>(
    node: &Node<'a, '_>,
    element: &'static str,
    attr: &'static str,
) -> Result<&'a str, LoadError> {
    node.attribute(attr)
        .ok_or(LoadError::MissingAttr { element, attr })
}

fn parse_num(node: &Node, element: &'static str, attr: &'static str) -> Result<u16, LoadError> {
    let text = require_attr(node, element, attr)?;
    num_from_str(text).ok_or_else(|| LoadError::BadAttr {
        element,
        attr,
        value: text.to_string(),
    })
}

/// Like `parse_num`, but the value must also fit one byte.
fn parse_u8(node: &Node, element: &'static str, attr: &'static str) -> Result<u8, LoadError> {
    let text = require_attr(node, element, attr)?;
    num_from_str(text)
        .and_then(|v| u8::try_from(v).ok())
        .ok_or_else(|| LoadError::BadAttr {
            element,
            attr,
            value: text.to_string(),
        })
}

fn opt_u8(node: &Node, element: &'static str, attr: &'static str) -> Result<Option<u8>, LoadError> {
    match node.attribute(attr) {
        None => Ok(None),
        Some(text) => num_from_str(text)
            .and_then(|v| u8::try_from(v).ok())
            .map(Some)
            .ok_or_else(|| LoadError::BadAttr {
                element,
                attr,
                value: text.to_string(),
            }),
    }
}

fn opt_num(node: &Node, element: &'static str, attr: &'static str) -> Result<Option<u16>, LoadError> {
    match node.attribute(attr) {
        None => Ok(None),
        Some(text) => num_from_str(text)
            .map(Some)
            .ok_or_else(|| LoadError::BadAttr {
                element,
                attr,
                value: text.to_string(),
            }),
    }
}

fn num_from_str(text: &str) -> Option<u16> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}
