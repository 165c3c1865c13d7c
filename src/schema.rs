//! Schema registry: RFC 4512 attribute types and object classes, merging of
//! schema sources, entry validation and equality matching.

use crate::dn::Dn;
use crate::entry::Entry;
use crate::error::{DirectoryError, DirectoryResult};
use base64::Engine;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use tracing::debug;

const STANDARD_SCHEMA: &str = include_str!("../resources/standard-schema.ldif");

const SYNTAX_PREFIX: &str = "1.3.6.1.4.1.1466.115.121.1.";

const EXTENSIBLE_OBJECT: &str = "extensibleobject";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeUsage {
    UserApplications,
    DirectoryOperation,
    DistributedOperation,
    DsaOperation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeType {
    pub oid: String,
    pub names: Vec<String>,
    pub description: Option<String>,
    pub superior: Option<String>,
    pub equality: Option<String>,
    pub ordering: Option<String>,
    pub substr: Option<String>,
    pub syntax: Option<String>,
    pub single_value: bool,
    pub no_user_modification: bool,
    pub usage: AttributeUsage,
}

impl AttributeType {
    /// Primary name, or the OID for unnamed types.
    pub fn name(&self) -> &str {
        self.names.first().map(String::as_str).unwrap_or(&self.oid)
    }

    pub fn is_operational(&self) -> bool {
        self.usage != AttributeUsage::UserApplications
    }

    /// Equal in everything but DESC text.
    pub fn same_definition(&self, other: &AttributeType) -> bool {
        self.oid == other.oid
            && same_names(&self.names, &other.names)
            && same_name(&self.superior, &other.superior)
            && same_name(&self.equality, &other.equality)
            && same_name(&self.ordering, &other.ordering)
            && same_name(&self.substr, &other.substr)
            && self.syntax == other.syntax
            && self.single_value == other.single_value
            && self.no_user_modification == other.no_user_modification
            && self.usage == other.usage
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectClassKind {
    Abstract,
    Structural,
    Auxiliary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectClass {
    pub oid: String,
    pub names: Vec<String>,
    pub description: Option<String>,
    /// First declared superior; the chain is walked by name lookup.
    pub superior: Option<String>,
    pub kind: ObjectClassKind,
    pub must: Vec<String>,
    pub may: Vec<String>,
}

impl ObjectClass {
    pub fn name(&self) -> &str {
        self.names.first().map(String::as_str).unwrap_or(&self.oid)
    }

    /// Equal in everything but DESC text.
    pub fn same_definition(&self, other: &ObjectClass) -> bool {
        self.oid == other.oid
            && same_names(&self.names, &other.names)
            && same_name(&self.superior, &other.superior)
            && self.kind == other.kind
            && same_names(&self.must, &other.must)
            && same_names(&self.may, &other.may)
    }
}

fn same_name(a: &Option<String>, b: &Option<String>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        (None, None) => true,
        _ => false,
    }
}

/// Case-insensitive set comparison of descriptor lists.
fn same_names(a: &[String], b: &[String]) -> bool {
    a.len() == b.len()
        && a.iter().all(|x| b.iter().any(|y| x.eq_ignore_ascii_case(y)))
        && b.iter().all(|y| a.iter().any(|x| x.eq_ignore_ascii_case(y)))
}

/// LDAP syntaxes the registry knows how to check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeSyntax {
    Boolean,
    CountryString,
    DirectoryString,
    DistinguishedName,
    GeneralizedTime,
    Ia5String,
    Integer,
    NumericString,
    Oid,
    PrintableString,
    TelephoneNumber,
    Binary,
    Other,
}

impl AttributeSyntax {
    pub fn from_oid(oid: &str) -> Self {
        let oid = oid.split('{').next().unwrap_or(oid).trim();
        match oid.strip_prefix(SYNTAX_PREFIX) {
            Some("7") => AttributeSyntax::Boolean,
            Some("11") => AttributeSyntax::CountryString,
            Some("15") => AttributeSyntax::DirectoryString,
            Some("12") => AttributeSyntax::DistinguishedName,
            Some("24") => AttributeSyntax::GeneralizedTime,
            Some("26") => AttributeSyntax::Ia5String,
            Some("27") => AttributeSyntax::Integer,
            Some("36") => AttributeSyntax::NumericString,
            Some("38") => AttributeSyntax::Oid,
            Some("44") => AttributeSyntax::PrintableString,
            Some("50") => AttributeSyntax::TelephoneNumber,
            Some("4") | Some("5") | Some("8") | Some("9") | Some("10") | Some("28")
            | Some("40") | Some("49") => AttributeSyntax::Binary,
            _ => AttributeSyntax::Other,
        }
    }

    pub fn accepts(self, value: &[u8]) -> bool {
        let text = match self {
            AttributeSyntax::Binary | AttributeSyntax::Other => return true,
            _ => match std::str::from_utf8(value) {
                Ok(text) => text,
                Err(_) => return false,
            },
        };
        match self {
            AttributeSyntax::Boolean => text == "TRUE" || text == "FALSE",
            AttributeSyntax::CountryString => {
                text.chars().count() == 2 && text.chars().all(is_printable)
            }
            AttributeSyntax::DirectoryString => !text.is_empty(),
            AttributeSyntax::DistinguishedName => Dn::parse(text).is_ok(),
            AttributeSyntax::GeneralizedTime => is_generalized_time(text),
            AttributeSyntax::Ia5String => text.is_ascii(),
            AttributeSyntax::Integer => {
                let digits = text.strip_prefix('-').unwrap_or(text);
                !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
            }
            AttributeSyntax::NumericString => {
                !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit() || b == b' ')
            }
            AttributeSyntax::Oid => is_oid(text),
            AttributeSyntax::PrintableString | AttributeSyntax::TelephoneNumber => {
                !text.is_empty() && text.chars().all(is_printable)
            }
            AttributeSyntax::Binary | AttributeSyntax::Other => true,
        }
    }
}

fn is_printable(c: char) -> bool {
    c.is_ascii_alphanumeric() || " '()+,-./:?=".contains(c)
}

fn is_oid(text: &str) -> bool {
    let numeric = !text.is_empty()
        && text
            .split('.')
            .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()));
    let descriptor = text.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
        && text.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    numeric || descriptor
}

fn is_generalized_time(text: &str) -> bool {
    let bytes = text.as_bytes();
    if bytes.len() < 11 || !bytes[..10].iter().all(u8::is_ascii_digit) {
        return false;
    }
    let zone_ok = if text.ends_with('Z') {
        true
    } else {
        let tail = &bytes[bytes.len().saturating_sub(5)..];
        tail.len() == 5 && (tail[0] == b'+' || tail[0] == b'-') && tail[1..].iter().all(u8::is_ascii_digit)
    };
    zone_ok
        && bytes[10..]
            .iter()
            .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b',' | b'Z' | b'+' | b'-'))
}

/// Equality matching rules the evaluator implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchingRule {
    CaseIgnore,
    CaseExact,
    Octet,
    Integer,
    DistinguishedName,
    Boolean,
    NumericString,
    TelephoneNumber,
}

impl MatchingRule {
    pub fn from_equality(name: &str) -> Option<Self> {
        let rule = match name.to_ascii_lowercase().as_str() {
            "caseignorematch" | "caseignoreia5match" | "caseignorelistmatch"
            | "objectidentifiermatch" | "objectidentifierfirstcomponentmatch"
            | "generalizedtimematch" => MatchingRule::CaseIgnore,
            "caseexactmatch" | "caseexactia5match" => MatchingRule::CaseExact,
            "octetstringmatch" | "bitstringmatch" | "certificateexactmatch" => MatchingRule::Octet,
            "integermatch" => MatchingRule::Integer,
            "distinguishednamematch" | "uniquemembermatch" => MatchingRule::DistinguishedName,
            "booleanmatch" => MatchingRule::Boolean,
            "numericstringmatch" => MatchingRule::NumericString,
            "telephonenumbermatch" => MatchingRule::TelephoneNumber,
            _ => return None,
        };
        Some(rule)
    }

    pub fn from_syntax(syntax: AttributeSyntax) -> Self {
        match syntax {
            AttributeSyntax::Binary => MatchingRule::Octet,
            AttributeSyntax::Integer => MatchingRule::Integer,
            AttributeSyntax::DistinguishedName => MatchingRule::DistinguishedName,
            AttributeSyntax::Boolean => MatchingRule::Boolean,
            AttributeSyntax::NumericString => MatchingRule::NumericString,
            AttributeSyntax::TelephoneNumber => MatchingRule::TelephoneNumber,
            _ => MatchingRule::CaseIgnore,
        }
    }

    /// Canonical form used for equality and ordering.
    pub fn normalize(self, value: &[u8]) -> Vec<u8> {
        let text = match self {
            MatchingRule::Octet => return value.to_vec(),
            _ => String::from_utf8_lossy(value),
        };
        let collapsed = || text.split_whitespace().collect::<Vec<_>>().join(" ");
        let normalized = match self {
            MatchingRule::CaseIgnore => collapsed().to_lowercase(),
            MatchingRule::CaseExact => collapsed(),
            MatchingRule::Integer => match text.trim().parse::<i128>() {
                Ok(n) => n.to_string(),
                Err(_) => text.trim().to_string(),
            },
            MatchingRule::DistinguishedName => match Dn::parse(&text) {
                Ok(dn) => dn.normalize().as_str().to_string(),
                Err(_) => collapsed().to_lowercase(),
            },
            MatchingRule::Boolean => text.trim().to_ascii_uppercase(),
            MatchingRule::NumericString => text.chars().filter(|c| *c != ' ').collect(),
            MatchingRule::TelephoneNumber => text
                .chars()
                .filter(|c| *c != ' ' && *c != '-')
                .collect::<String>()
                .to_lowercase(),
            MatchingRule::Octet => text.into_owned(),
        };
        normalized.into_bytes()
    }

    /// Canonical form of one substring assertion part. Whitespace runs
    /// collapse to one space but a space at either edge of the part is kept.
    pub fn normalize_substring(self, part: &[u8]) -> Vec<u8> {
        if !matches!(self, MatchingRule::CaseIgnore | MatchingRule::CaseExact) {
            return self.normalize(part);
        }
        let text = String::from_utf8_lossy(part);
        let mut collapsed = String::with_capacity(text.len());
        let mut in_space = false;
        for c in text.chars() {
            if c.is_whitespace() {
                if !in_space {
                    collapsed.push(' ');
                }
                in_space = true;
            } else {
                collapsed.push(c);
                in_space = false;
            }
        }
        if self == MatchingRule::CaseIgnore {
            collapsed = collapsed.to_lowercase();
        }
        collapsed.into_bytes()
    }

    pub fn equal(self, a: &[u8], b: &[u8]) -> bool {
        self.normalize(a) == self.normalize(b)
    }

    /// Ordering of two values; integers compare numerically.
    pub fn compare(self, a: &[u8], b: &[u8]) -> Ordering {
        if self == MatchingRule::Integer {
            let parse = |v: &[u8]| {
                std::str::from_utf8(v)
                    .ok()
                    .and_then(|s| s.trim().parse::<i128>().ok())
            };
            if let (Some(x), Some(y)) = (parse(a), parse(b)) {
                return x.cmp(&y);
            }
        }
        self.normalize(a).cmp(&self.normalize(b))
    }
}

/// One parsed schema source.
#[derive(Debug, Clone, Default)]
pub struct SchemaDefinition {
    pub attribute_types: Vec<AttributeType>,
    pub object_classes: Vec<ObjectClass>,
}

impl SchemaDefinition {
    /// Parse an LDIF subschema document (`attributeTypes:` / `objectClasses:`
    /// values) or an OpenLDAP schema file (`attributetype ( ... )` blocks).
    pub fn parse(text: &str) -> DirectoryResult<Self> {
        let mut definition = SchemaDefinition::default();
        for block in logical_blocks(text) {
            let Some((kind, body)) = block.definition()? else {
                continue;
            };
            let raw = RawDefinition::parse(&body)
                .map_err(|msg| DirectoryError::Schema(format!("line {}: {}", block.line, msg)))?;
            match kind {
                DefinitionKind::AttributeType => {
                    definition.attribute_types.push(raw.into_attribute_type().map_err(
                        |msg| DirectoryError::Schema(format!("line {}: {}", block.line, msg)),
                    )?)
                }
                DefinitionKind::ObjectClass => {
                    definition.object_classes.push(raw.into_object_class().map_err(
                        |msg| DirectoryError::Schema(format!("line {}: {}", block.line, msg)),
                    )?)
                }
            }
        }
        debug!(
            "Parsed schema source: {} attribute types, {} object classes",
            definition.attribute_types.len(),
            definition.object_classes.len()
        );
        Ok(definition)
    }

    /// The built-in standard schema.
    pub fn standard() -> DirectoryResult<Self> {
        Self::parse(STANDARD_SCHEMA)
    }
}

#[derive(Debug, Clone, Copy)]
enum DefinitionKind {
    AttributeType,
    ObjectClass,
}

struct Block<'a> {
    line: usize,
    head: &'a str,
    rest: Vec<&'a str>,
}

impl Block<'_> {
    fn definition(&self) -> DirectoryResult<Option<(DefinitionKind, String)>> {
        let lower = self.head.to_ascii_lowercase();
        if let Some(colon) = self.head.find(':') {
            let key = lower[..colon].trim();
            let kind = match key {
                "attributetypes" => DefinitionKind::AttributeType,
                "objectclasses" => DefinitionKind::ObjectClass,
                _ => return Ok(None),
            };
            // LDIF folding: drop exactly one leading space of each continuation.
            let mut value = self.head[colon + 1..].to_string();
            for cont in &self.rest {
                value.push_str(&cont[1..]);
            }
            let value = if let Some(encoded) = value.strip_prefix(':') {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(encoded.trim())
                    .map_err(|e| {
                        DirectoryError::Schema(format!("line {}: bad base64: {}", self.line, e))
                    })?;
                String::from_utf8(bytes).map_err(|_| {
                    DirectoryError::Schema(format!("line {}: definition is not UTF-8", self.line))
                })?
            } else {
                value.trim().to_string()
            };
            return Ok(Some((kind, value)));
        }
        for (keyword, kind) in [
            ("attributetype", DefinitionKind::AttributeType),
            ("objectclass", DefinitionKind::ObjectClass),
        ] {
            if let Some(tail) = lower.strip_prefix(keyword) {
                if tail.starts_with(|c: char| c.is_whitespace() || c == '(') {
                    let mut value = self.head[keyword.len()..].trim().to_string();
                    for cont in &self.rest {
                        value.push(' ');
                        value.push_str(cont.trim());
                    }
                    return Ok(Some((kind, value)));
                }
            }
        }
        Ok(None)
    }
}

fn logical_blocks(text: &str) -> Vec<Block<'_>> {
    let mut blocks: Vec<Block<'_>> = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim_end_matches('\r');
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(block) = blocks.last_mut() {
                block.rest.push(line);
                continue;
            }
        }
        blocks.push(Block {
            line: idx + 1,
            head: line,
            rest: Vec::new(),
        });
    }
    blocks
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Open,
    Close,
    Dollar,
    Quoted(String),
    Word(String),
}

fn tokenize(text: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '$' => {
                chars.next();
                tokens.push(Token::Dollar);
            }
            '\'' => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => value.push(c),
                        None => return Err("unterminated quoted string".to_string()),
                    }
                }
                tokens.push(Token::Quoted(
                    value.replace("\\27", "'").replace("\\5C", "\\").replace("\\5c", "\\"),
                ));
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || matches!(c, '(' | ')' | '$' | '\'') {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
        }
    }
    Ok(tokens)
}

/// Keyword/value view of one `( oid ... )` definition.
#[derive(Debug, Default)]
struct RawDefinition {
    oid: String,
    names: Vec<String>,
    description: Option<String>,
    superiors: Vec<String>,
    fields: HashMap<String, String>,
    flags: HashSet<String>,
    must: Vec<String>,
    may: Vec<String>,
}

impl RawDefinition {
    fn parse(text: &str) -> Result<Self, String> {
        let tokens = tokenize(text)?;
        let mut iter = tokens.into_iter().peekable();
        if iter.next() != Some(Token::Open) {
            return Err(format!("definition must start with '(': {}", text));
        }
        let mut raw = RawDefinition {
            oid: match iter.next() {
                Some(Token::Word(oid)) => oid,
                _ => return Err("missing numeric OID".to_string()),
            },
            ..Default::default()
        };
        loop {
            let keyword = match iter.next() {
                Some(Token::Close) => break,
                Some(Token::Word(word)) => word.to_ascii_uppercase(),
                Some(other) => return Err(format!("unexpected token {:?}", other)),
                None => return Err("missing closing ')'".to_string()),
            };
            match keyword.as_str() {
                "NAME" => raw.names = Self::qdstrings(&mut iter)?,
                "DESC" => raw.description = Self::qdstrings(&mut iter)?.into_iter().next(),
                "SUP" => raw.superiors = Self::oids(&mut iter)?,
                "MUST" => raw.must = Self::oids(&mut iter)?,
                "MAY" => raw.may = Self::oids(&mut iter)?,
                "EQUALITY" | "ORDERING" | "SUBSTR" | "SYNTAX" | "USAGE" => match iter.next() {
                    Some(Token::Word(value)) | Some(Token::Quoted(value)) => {
                        raw.fields.insert(keyword.clone(), value);
                    }
                    _ => return Err(format!("{} needs a value", keyword)),
                },
                "OBSOLETE" | "SINGLE-VALUE" | "COLLECTIVE" | "NO-USER-MODIFICATION"
                | "ABSTRACT" | "STRUCTURAL" | "AUXILIARY" => {
                    raw.flags.insert(keyword);
                }
                k if k.starts_with("X-") => {
                    Self::qdstrings(&mut iter)?;
                }
                other => return Err(format!("unknown keyword '{}'", other)),
            }
        }
        if iter.next().is_some() {
            return Err("trailing text after closing ')'".to_string());
        }
        if raw.names.iter().any(|n| n.is_empty()) {
            return Err("empty NAME".to_string());
        }
        Ok(raw)
    }

    fn qdstrings(iter: &mut std::iter::Peekable<std::vec::IntoIter<Token>>) -> Result<Vec<String>, String> {
        match iter.next() {
            Some(Token::Quoted(value)) => Ok(vec![value]),
            Some(Token::Open) => {
                let mut values = Vec::new();
                loop {
                    match iter.next() {
                        Some(Token::Quoted(value)) => values.push(value),
                        Some(Token::Close) => return Ok(values),
                        _ => return Err("malformed quoted string list".to_string()),
                    }
                }
            }
            _ => Err("expected quoted string".to_string()),
        }
    }

    fn oids(iter: &mut std::iter::Peekable<std::vec::IntoIter<Token>>) -> Result<Vec<String>, String> {
        match iter.next() {
            Some(Token::Word(value)) => Ok(vec![value]),
            Some(Token::Open) => {
                let mut values = Vec::new();
                loop {
                    match iter.next() {
                        Some(Token::Word(value)) => values.push(value),
                        Some(Token::Dollar) => {}
                        Some(Token::Close) => return Ok(values),
                        _ => return Err("malformed OID list".to_string()),
                    }
                }
            }
            _ => Err("expected OID".to_string()),
        }
    }

    fn into_attribute_type(mut self) -> Result<AttributeType, String> {
        let usage = match self.fields.remove("USAGE").as_deref() {
            None | Some("userApplications") => AttributeUsage::UserApplications,
            Some("directoryOperation") => AttributeUsage::DirectoryOperation,
            Some("distributedOperation") => AttributeUsage::DistributedOperation,
            Some("dSAOperation") => AttributeUsage::DsaOperation,
            Some(other) => return Err(format!("unknown USAGE '{}'", other)),
        };
        let superior = self.superiors.into_iter().next();
        let syntax = self.fields.remove("SYNTAX");
        if superior.is_none() && syntax.is_none() {
            return Err(format!("attribute type {} has neither SUP nor SYNTAX", self.oid));
        }
        Ok(AttributeType {
            oid: self.oid,
            names: self.names,
            description: self.description,
            superior,
            equality: self.fields.remove("EQUALITY"),
            ordering: self.fields.remove("ORDERING"),
            substr: self.fields.remove("SUBSTR"),
            syntax,
            single_value: self.flags.contains("SINGLE-VALUE"),
            no_user_modification: self.flags.contains("NO-USER-MODIFICATION"),
            usage,
        })
    }

    fn into_object_class(self) -> Result<ObjectClass, String> {
        let kind = match (
            self.flags.contains("ABSTRACT"),
            self.flags.contains("AUXILIARY"),
        ) {
            (true, false) => ObjectClassKind::Abstract,
            (false, true) => ObjectClassKind::Auxiliary,
            (false, false) => ObjectClassKind::Structural,
            (true, true) => return Err(format!("object class {} has two kinds", self.oid)),
        };
        Ok(ObjectClass {
            oid: self.oid,
            names: self.names,
            description: self.description,
            superior: self.superiors.into_iter().next(),
            kind,
            must: self.must,
            may: self.may,
        })
    }
}

/// Validation switches taken from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaOptions {
    pub enforce_single_structural: bool,
    pub enforce_syntax: bool,
}

impl Default for SchemaOptions {
    fn default() -> Self {
        Self {
            enforce_single_structural: false,
            enforce_syntax: true,
        }
    }
}

/// Merged, immutable schema registry.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    attribute_types: Vec<AttributeType>,
    object_classes: Vec<ObjectClass>,
    attribute_index: HashMap<String, usize>,
    class_index: HashMap<String, usize>,
    options: SchemaOptions,
}

fn index_keys(oid: &str, names: &[String]) -> Vec<String> {
    std::iter::once(oid)
        .chain(names.iter().map(String::as_str))
        .map(str::to_ascii_lowercase)
        .collect()
}

/// Attribute description without options (`cn;lang-en` -> `cn`), lower-cased.
fn base_name(attr: &str) -> String {
    attr.split(';').next().unwrap_or(attr).trim().to_ascii_lowercase()
}

impl Schema {
    pub fn merge<I>(definitions: I) -> DirectoryResult<Schema>
    where
        I: IntoIterator<Item = SchemaDefinition>,
    {
        let mut schema = Schema::default();
        for definition in definitions {
            for attribute_type in definition.attribute_types {
                schema.insert_attribute_type(attribute_type)?;
            }
            for object_class in definition.object_classes {
                schema.insert_object_class(object_class)?;
            }
        }
        schema.check_references()?;
        Ok(schema)
    }

    pub fn standard() -> DirectoryResult<Schema> {
        Self::merge([SchemaDefinition::standard()?])
    }

    pub fn with_options(mut self, options: SchemaOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> SchemaOptions {
        self.options
    }

    fn insert_attribute_type(&mut self, attribute_type: AttributeType) -> DirectoryResult<()> {
        let keys = index_keys(&attribute_type.oid, &attribute_type.names);
        if let Some(&idx) = keys.iter().find_map(|k| self.attribute_index.get(k)) {
            if self.attribute_types[idx].same_definition(&attribute_type) {
                return Ok(());
            }
            return Err(DirectoryError::SchemaConflict(format!(
                "attribute type '{}' is already defined differently",
                attribute_type.name()
            )));
        }
        let idx = self.attribute_types.len();
        for key in keys {
            self.attribute_index.insert(key, idx);
        }
        self.attribute_types.push(attribute_type);
        Ok(())
    }

    fn insert_object_class(&mut self, object_class: ObjectClass) -> DirectoryResult<()> {
        let keys = index_keys(&object_class.oid, &object_class.names);
        if let Some(&idx) = keys.iter().find_map(|k| self.class_index.get(k)) {
            if self.object_classes[idx].same_definition(&object_class) {
                return Ok(());
            }
            return Err(DirectoryError::SchemaConflict(format!(
                "object class '{}' is already defined differently",
                object_class.name()
            )));
        }
        let idx = self.object_classes.len();
        for key in keys {
            self.class_index.insert(key, idx);
        }
        self.object_classes.push(object_class);
        Ok(())
    }

    fn check_references(&self) -> DirectoryResult<()> {
        for at in &self.attribute_types {
            if let Some(sup) = &at.superior {
                if self.attribute_type(sup).is_none() {
                    return Err(DirectoryError::Schema(format!(
                        "attribute type '{}' has undefined superior '{}'",
                        at.name(),
                        sup
                    )));
                }
            }
        }
        for oc in &self.object_classes {
            if let Some(sup) = &oc.superior {
                if self.object_class(sup).is_none() {
                    return Err(DirectoryError::Schema(format!(
                        "object class '{}' has undefined superior '{}'",
                        oc.name(),
                        sup
                    )));
                }
            }
            if let Some(attr) = oc
                .must
                .iter()
                .chain(oc.may.iter())
                .find(|a| self.attribute_type(a).is_none())
            {
                return Err(DirectoryError::Schema(format!(
                    "object class '{}' references undefined attribute '{}'",
                    oc.name(),
                    attr
                )));
            }
        }
        Ok(())
    }

    pub fn attribute_type(&self, name: &str) -> Option<&AttributeType> {
        self.attribute_index
            .get(&base_name(name))
            .map(|&idx| &self.attribute_types[idx])
    }

    pub fn object_class(&self, name: &str) -> Option<&ObjectClass> {
        self.class_index
            .get(&name.trim().to_ascii_lowercase())
            .map(|&idx| &self.object_classes[idx])
    }

    pub fn attribute_types(&self) -> impl Iterator<Item = &AttributeType> {
        self.attribute_types.iter()
    }

    pub fn object_classes(&self) -> impl Iterator<Item = &ObjectClass> {
        self.object_classes.iter()
    }

    /// Attribute type followed by its superiors.
    fn attribute_chain(&self, name: &str) -> Vec<&AttributeType> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = self.attribute_type(name);
        while let Some(at) = current {
            if !seen.insert(at.oid.as_str()) {
                break;
            }
            chain.push(at);
            current = at.superior.as_deref().and_then(|s| self.attribute_type(s));
        }
        chain
    }

    /// Object class followed by its superiors.
    fn class_chain(&self, name: &str) -> Vec<&ObjectClass> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = self.object_class(name);
        while let Some(oc) = current {
            if !seen.insert(oc.oid.as_str()) {
                break;
            }
            chain.push(oc);
            current = oc.superior.as_deref().and_then(|s| self.object_class(s));
        }
        chain
    }

    pub fn syntax_of(&self, attr: &str) -> Option<AttributeSyntax> {
        self.attribute_chain(attr)
            .into_iter()
            .find_map(|at| at.syntax.as_deref())
            .map(AttributeSyntax::from_oid)
    }

    pub fn matching_rule(&self, attr: &str) -> MatchingRule {
        let chain = self.attribute_chain(attr);
        if let Some(rule) = chain
            .iter()
            .find_map(|at| at.equality.as_deref())
            .and_then(MatchingRule::from_equality)
        {
            return rule;
        }
        self.syntax_of(attr)
            .map(MatchingRule::from_syntax)
            .unwrap_or(MatchingRule::CaseIgnore)
    }

    pub fn is_single_valued(&self, attr: &str) -> bool {
        self.attribute_type(attr).is_some_and(|at| at.single_value)
    }

    pub fn is_operational(&self, attr: &str) -> bool {
        self.attribute_type(attr).is_some_and(AttributeType::is_operational)
    }

    /// Identity key of an attribute description: the OID when declared.
    pub fn canonical_name(&self, attr: &str) -> String {
        match self.attribute_type(attr) {
            Some(at) => at.oid.clone(),
            None => base_name(attr),
        }
    }

    pub fn same_attribute(&self, a: &str, b: &str) -> bool {
        self.canonical_name(a) == self.canonical_name(b)
    }

    /// True when `attr` is `ancestor` or one of its subtypes (`cn` is a `name`).
    pub fn is_subtype_of(&self, attr: &str, ancestor: &str) -> bool {
        let target = self.canonical_name(ancestor);
        if self.canonical_name(attr) == target {
            return true;
        }
        self.attribute_chain(attr).iter().any(|at| at.oid == target)
    }

    /// Check an entry against the registry. Pure.
    pub fn validate(&self, entry: &Entry) -> DirectoryResult<()> {
        let class_names = entry.object_classes();
        if class_names.is_empty() {
            return Err(DirectoryError::ObjectClassViolation(format!(
                "entry {} has no objectClass",
                entry.dn()
            )));
        }

        let mut declared = Vec::with_capacity(class_names.len());
        for name in &class_names {
            match self.object_class(name) {
                Some(oc) => declared.push(oc),
                None => {
                    return Err(DirectoryError::ObjectClassViolation(format!(
                        "undefined object class '{}'",
                        name
                    )))
                }
            }
        }

        for attribute in entry.attributes() {
            if self.attribute_type(&attribute.name).is_none() {
                return Err(DirectoryError::UndefinedAttributeType(attribute.name.clone()));
            }
        }

        let mut closure: Vec<&ObjectClass> = Vec::new();
        let mut seen = HashSet::new();
        for oc in &declared {
            for member in self.class_chain(&oc.oid) {
                if seen.insert(member.oid.as_str()) {
                    closure.push(member);
                }
            }
        }

        let present: HashSet<String> = entry
            .attributes()
            .map(|a| self.canonical_name(&a.name))
            .collect();
        for oc in &closure {
            if let Some(missing) = oc
                .must
                .iter()
                .find(|attr| !present.contains(&self.canonical_name(attr)))
            {
                return Err(DirectoryError::ObjectClassViolation(format!(
                    "object class '{}' requires attribute '{}'",
                    oc.name(),
                    missing
                )));
            }
        }

        let extensible = closure
            .iter()
            .any(|oc| oc.names.iter().any(|n| n.eq_ignore_ascii_case(EXTENSIBLE_OBJECT)));
        if !extensible {
            let allowed: HashSet<String> = closure
                .iter()
                .flat_map(|oc| oc.must.iter().chain(oc.may.iter()))
                .map(|attr| self.canonical_name(attr))
                .collect();
            for attribute in entry.attributes() {
                if self.is_operational(&attribute.name) {
                    continue;
                }
                if !allowed.contains(&self.canonical_name(&attribute.name)) {
                    return Err(DirectoryError::ObjectClassViolation(format!(
                        "attribute '{}' is not allowed by the entry's object classes",
                        attribute.name
                    )));
                }
            }
        }

        for attribute in entry.attributes() {
            if attribute.values.len() > 1 && self.is_single_valued(&attribute.name) {
                return Err(DirectoryError::ConstraintViolation(format!(
                    "attribute '{}' is single-valued",
                    attribute.name
                )));
            }
        }

        if self.options.enforce_single_structural {
            self.check_structural(&declared)?;
        }

        if self.options.enforce_syntax {
            for attribute in entry.attributes() {
                let Some(syntax) = self.syntax_of(&attribute.name) else {
                    continue;
                };
                if let Some(bad) = attribute.values.iter().find(|v| !syntax.accepts(v)) {
                    return Err(DirectoryError::InvalidAttributeSyntax(format!(
                        "value '{}' of attribute '{}' is not a valid {:?}",
                        String::from_utf8_lossy(bad),
                        attribute.name,
                        syntax
                    )));
                }
            }
        }

        Ok(())
    }

    /// Exactly one structural chain: some structural class must have every
    /// other declared structural class among its superiors.
    fn check_structural(&self, declared: &[&ObjectClass]) -> DirectoryResult<()> {
        let structural: Vec<&ObjectClass> = declared
            .iter()
            .copied()
            .filter(|oc| oc.kind == ObjectClassKind::Structural)
            .collect();
        if structural.is_empty() {
            return Err(DirectoryError::ObjectClassViolation(
                "entry has no structural object class".to_string(),
            ));
        }
        let single_chain = structural.iter().any(|candidate| {
            let chain: HashSet<&str> = self
                .class_chain(&candidate.oid)
                .iter()
                .map(|oc| oc.oid.as_str())
                .collect();
            structural.iter().all(|oc| chain.contains(oc.oid.as_str()))
        });
        if single_chain {
            Ok(())
        } else {
            let names: Vec<&str> = structural.iter().map(|oc| oc.name()).collect();
            Err(DirectoryError::ObjectClassViolation(format!(
                "multiple structural object classes: {}",
                names.join(", ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person(cn: &str) -> Entry {
        Entry::new(Dn::parse(&format!("cn={},dc=example,dc=com", cn)).unwrap())
            .with_attribute("objectClass", ["top", "person"])
            .with_attribute("cn", [cn])
            .with_attribute("sn", ["Smith"])
    }

    #[test]
    fn test_standard_schema_loads() {
        let schema = Schema::standard().unwrap();
        assert!(schema.attribute_type("cn").is_some());
        assert!(schema.attribute_type("commonName").is_some());
        assert!(schema.attribute_type("2.5.4.3").is_some());
        assert!(schema.object_class("inetOrgPerson").is_some());
        assert!(schema.object_class("INETORGPERSON").is_some());
    }

    #[test]
    fn test_attribute_inherits_from_superior() {
        let schema = Schema::standard().unwrap();
        assert_eq!(schema.syntax_of("cn"), Some(AttributeSyntax::DirectoryString));
        assert_eq!(schema.matching_rule("cn"), MatchingRule::CaseIgnore);
        assert_eq!(schema.matching_rule("member"), MatchingRule::DistinguishedName);
        assert_eq!(schema.matching_rule("userPassword"), MatchingRule::Octet);
        assert_eq!(schema.matching_rule("uidNumber"), MatchingRule::Integer);
        assert_eq!(schema.matching_rule("jpegPhoto"), MatchingRule::Octet);
        assert_eq!(schema.matching_rule("notDefined"), MatchingRule::CaseIgnore);
        assert!(schema.is_subtype_of("cn", "name"));
        assert!(!schema.is_subtype_of("mail", "name"));
    }

    #[test]
    fn test_parse_openldap_format() {
        let text = r#"
# custom schema
attributetype ( 1.3.6.1.4.1.99999.1.1 NAME 'favouriteColour'
        DESC 'A colour'
        EQUALITY caseIgnoreMatch
        SYNTAX 1.3.6.1.4.1.1466.115.121.1.15 SINGLE-VALUE )

objectclass ( 1.3.6.1.4.1.99999.2.1 NAME 'colourful'
        SUP top AUXILIARY
        MAY ( favouriteColour $ description ) )
"#;
        let def = SchemaDefinition::parse(text).unwrap();
        assert_eq!(def.attribute_types.len(), 1);
        assert_eq!(def.object_classes.len(), 1);
        let at = &def.attribute_types[0];
        assert_eq!(at.name(), "favouriteColour");
        assert_eq!(at.description.as_deref(), Some("A colour"));
        assert!(at.single_value);
        let oc = &def.object_classes[0];
        assert_eq!(oc.kind, ObjectClassKind::Auxiliary);
        assert_eq!(oc.may, vec!["favouriteColour", "description"]);
    }

    #[test]
    fn test_parse_ldif_format_with_folding() {
        let text = "dn: cn=schema\nobjectClass: subschema\nattributeTypes: ( 1.2.3.4 NAME 'exa\n mple' SYNTAX 1.3.6.1.4.1.1466.115.121.1.15 )\n";
        let def = SchemaDefinition::parse(text).unwrap();
        assert_eq!(def.attribute_types[0].name(), "example");
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            SchemaDefinition::parse("attributetype ( 1.2.3 NAME 'x' SYNTAX 1.2"),
            Err(DirectoryError::Schema(_))
        ));
        assert!(SchemaDefinition::parse("attributetype ( 1.2.3 NAME 'x )").is_err());
        assert!(SchemaDefinition::parse("attributetype ( 1.2.3 NAME 'x' BOGUS y )").is_err());
        assert!(SchemaDefinition::parse("attributetype ( 1.2.3 NAME 'x' )").is_err());
        assert!(SchemaDefinition::parse("objectclass 1.2.3 NAME 'x'").is_err());
    }

    #[test]
    fn test_merge_identical_and_conflicting() {
        let text = "attributetype ( 1.2.3.4 NAME 'custom' SYNTAX 1.3.6.1.4.1.1466.115.121.1.15 )";
        let standard = SchemaDefinition::standard().unwrap();
        let a = SchemaDefinition::parse(text).unwrap();
        let schema = Schema::merge([standard.clone(), a.clone(), a]).unwrap();
        assert!(schema.attribute_type("custom").is_some());

        let other = SchemaDefinition::parse(
            "attributetype ( 1.2.3.4 NAME 'custom' SYNTAX 1.3.6.1.4.1.1466.115.121.1.27 )",
        )
        .unwrap();
        let conflict = Schema::merge([
            standard,
            SchemaDefinition::parse(text).unwrap(),
            other,
        ]);
        assert!(matches!(conflict, Err(DirectoryError::SchemaConflict(_))));
    }

    #[test]
    fn test_merge_ignores_description() {
        let rfc4519 = SchemaDefinition::parse(
            "attributetype ( 2.5.4.3 NAME ( 'cn' 'commonName' )\n  DESC 'RFC4519: common name(s) for which the entity is known by'\n  SUP name )\n\nobjectclass ( 2.5.6.6 NAME 'person'\n  DESC 'RFC2256: a person'\n  SUP top STRUCTURAL\n  MUST ( sn $ cn )\n  MAY ( userPassword $ telephoneNumber $ seeAlso $ description ) )\n",
        )
        .unwrap();
        let standard = SchemaDefinition::standard().unwrap();
        let schema = Schema::merge([standard.clone(), rfc4519]).unwrap();
        assert!(schema.is_subtype_of("commonName", "name"));

        let redefined = SchemaDefinition::parse(
            "attributetype ( 2.5.4.3 NAME ( 'cn' 'commonName' ) DESC 'common name' SUP name SINGLE-VALUE )",
        )
        .unwrap();
        assert!(matches!(
            Schema::merge([standard, redefined]),
            Err(DirectoryError::SchemaConflict(_))
        ));
    }

    #[test]
    fn test_merge_rejects_dangling_reference() {
        let def = SchemaDefinition::parse(
            "objectclass ( 1.2.3.5 NAME 'broken' SUP top STRUCTURAL MUST missingAttr )",
        )
        .unwrap();
        let result = Schema::merge([SchemaDefinition::standard().unwrap(), def]);
        assert!(matches!(result, Err(DirectoryError::Schema(_))));
    }

    #[test]
    fn test_validate_person() {
        let schema = Schema::standard().unwrap();
        assert!(schema.validate(&person("John")).is_ok());
    }

    #[test]
    fn test_validate_missing_must() {
        let schema = Schema::standard().unwrap();
        let entry = Entry::new(Dn::parse("cn=x,dc=example,dc=com").unwrap())
            .with_attribute("objectClass", ["person"])
            .with_attribute("cn", ["x"]);
        assert!(matches!(
            schema.validate(&entry),
            Err(DirectoryError::ObjectClassViolation(_))
        ));
    }

    #[test]
    fn test_validate_undefined_attribute_and_class() {
        let schema = Schema::standard().unwrap();
        let entry = person("John").with_attribute("shoeSize", ["42"]);
        assert!(matches!(
            schema.validate(&entry),
            Err(DirectoryError::UndefinedAttributeType(_))
        ));
        let entry = person("John").with_attribute("objectClass", ["martian"]);
        assert!(matches!(
            schema.validate(&entry),
            Err(DirectoryError::ObjectClassViolation(_))
        ));
        let entry = Entry::new(Dn::parse("cn=x,dc=com").unwrap()).with_attribute("cn", ["x"]);
        assert!(matches!(
            schema.validate(&entry),
            Err(DirectoryError::ObjectClassViolation(_))
        ));
    }

    #[test]
    fn test_validate_not_allowed_unless_extensible() {
        let schema = Schema::standard().unwrap();
        let entry = person("John").with_attribute("mail", ["john@example.com"]);
        assert!(matches!(
            schema.validate(&entry),
            Err(DirectoryError::ObjectClassViolation(_))
        ));
        let entry = entry.with_attribute("objectClass", ["extensibleObject"]);
        assert!(schema.validate(&entry).is_ok());
    }

    #[test]
    fn test_validate_single_value() {
        let schema = Schema::standard().unwrap();
        let entry = Entry::new(Dn::parse("dc=example,dc=com").unwrap())
            .with_attribute("objectClass", ["top", "domain"])
            .with_attribute("dc", ["example", "other"]);
        assert!(matches!(
            schema.validate(&entry),
            Err(DirectoryError::ConstraintViolation(_))
        ));
    }

    #[test]
    fn test_structural_enforcement_is_optional() {
        let entry = person("John").with_attribute("objectClass", ["organizationalUnit"]).with_attribute("ou", ["x"]);
        let lax = Schema::standard().unwrap();
        assert!(lax.validate(&entry).is_ok());

        let strict = Schema::standard().unwrap().with_options(SchemaOptions {
            enforce_single_structural: true,
            enforce_syntax: true,
        });
        assert!(matches!(
            strict.validate(&entry),
            Err(DirectoryError::ObjectClassViolation(_))
        ));
        let chain = person("Jane").with_attribute("objectClass", ["organizationalPerson", "inetOrgPerson"]);
        assert!(strict.validate(&chain).is_ok());
    }

    #[test]
    fn test_syntax_compliance() {
        let schema = Schema::standard().unwrap();
        let account = |uid_number: &str| {
            Entry::new(Dn::parse("uid=jdoe,dc=example,dc=com").unwrap())
                .with_attribute("objectClass", ["account", "posixAccount"])
                .with_attribute("uid", ["jdoe"])
                .with_attribute("cn", ["John Doe"])
                .with_attribute("uidNumber", [uid_number])
                .with_attribute("gidNumber", ["100"])
                .with_attribute("homeDirectory", ["/home/jdoe"])
        };
        assert!(schema.validate(&account("1000")).is_ok());
        assert!(matches!(
            schema.validate(&account("lots")),
            Err(DirectoryError::InvalidAttributeSyntax(_))
        ));
        let lax = Schema::standard().unwrap().with_options(SchemaOptions {
            enforce_single_structural: false,
            enforce_syntax: false,
        });
        assert!(lax.validate(&account("lots")).is_ok());
    }

    #[test]
    fn test_syntax_checks() {
        assert!(AttributeSyntax::Boolean.accepts(b"TRUE"));
        assert!(!AttributeSyntax::Boolean.accepts(b"yes"));
        assert!(AttributeSyntax::Integer.accepts(b"-42"));
        assert!(!AttributeSyntax::Integer.accepts(b"4x"));
        assert!(AttributeSyntax::DistinguishedName.accepts(b"cn=a,dc=b"));
        assert!(!AttributeSyntax::DistinguishedName.accepts(b"garbage"));
        assert!(AttributeSyntax::GeneralizedTime.accepts(b"20240101120000Z"));
        assert!(AttributeSyntax::GeneralizedTime.accepts(b"202401011200+0100"));
        assert!(!AttributeSyntax::GeneralizedTime.accepts(b"2024"));
        assert!(AttributeSyntax::Ia5String.accepts(b"user@example.com"));
        assert!(!AttributeSyntax::Ia5String.accepts("ünïcode".as_bytes()));
        assert!(AttributeSyntax::CountryString.accepts(b"DE"));
        assert!(!AttributeSyntax::CountryString.accepts(b"DEU"));
        assert!(AttributeSyntax::Oid.accepts(b"2.5.4.3"));
        assert!(AttributeSyntax::Oid.accepts(b"person"));
        assert!(!AttributeSyntax::DirectoryString.accepts(b""));
        assert!(AttributeSyntax::Binary.accepts(&[0xff, 0x00]));
    }

    #[test]
    fn test_matching_rules() {
        assert!(MatchingRule::CaseIgnore.equal(b"John  Smith", b"john smith"));
        assert!(!MatchingRule::CaseExact.equal(b"John", b"john"));
        assert!(!MatchingRule::Octet.equal(b"secret", b"SECRET"));
        assert!(MatchingRule::Integer.equal(b"0042", b"42"));
        assert!(MatchingRule::DistinguishedName.equal(b"CN=A, DC=B", b"cn=a,dc=b"));
        assert!(MatchingRule::TelephoneNumber.equal(b"+1 555-0100", b"+15550100"));
        assert_eq!(MatchingRule::Integer.compare(b"9", b"10"), Ordering::Less);
        assert_eq!(MatchingRule::CaseIgnore.compare(b"b", b"A"), Ordering::Greater);
        assert_eq!(MatchingRule::CaseIgnore.normalize_substring(b"John  "), b"john ".to_vec());
        assert_eq!(MatchingRule::CaseExact.normalize_substring(b" A\t B"), b" A B".to_vec());
        assert_eq!(MatchingRule::TelephoneNumber.normalize_substring(b"555 "), b"555".to_vec());
    }
}
