//! Distinguished names (RFC 4514 string form).
//!
//! A `Dn` keeps the attribute names and values as written so it can be echoed
//! back to clients; identity, ordering and tree placement use the normalized
//! form only.

use crate::error::{DirectoryError, DirectoryResult};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// One `attribute=value` assertion of an RDN. The value is unescaped.
#[derive(Debug, Clone)]
pub struct Ava {
    pub attr: String,
    pub value: String,
}

impl Ava {
    pub fn new(attr: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            attr: attr.into(),
            value: value.into(),
        }
    }

    fn normalized(&self) -> String {
        format!(
            "{}={}",
            self.attr.trim().to_ascii_lowercase(),
            escape_value(&normalize_value(&self.value))
        )
    }
}

/// Relative distinguished name: one or more AVAs joined by `+`.
#[derive(Debug, Clone)]
pub struct Rdn {
    avas: Vec<Ava>,
}

impl Rdn {
    pub fn new(attr: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            avas: vec![Ava::new(attr, value)],
        }
    }

    pub fn from_avas(avas: Vec<Ava>) -> DirectoryResult<Self> {
        if avas.is_empty() {
            return Err(DirectoryError::InvalidDn("empty RDN".to_string()));
        }
        Ok(Self { avas })
    }

    /// Parse a single RDN such as `cn=John Smith` or `cn=a+uid=b`.
    pub fn parse(input: &str) -> DirectoryResult<Self> {
        let mut dn = Dn::parse(input)?;
        match (dn.rdns.pop(), dn.rdns.is_empty()) {
            (Some(rdn), true) => Ok(rdn),
            _ => Err(DirectoryError::InvalidDn(format!(
                "expected a single RDN, got '{}'",
                input
            ))),
        }
    }

    pub fn avas(&self) -> &[Ava] {
        &self.avas
    }

    /// Normalized key of this RDN; multi-valued RDNs sort their AVAs.
    pub fn normalized(&self) -> String {
        let mut parts: Vec<String> = self.avas.iter().map(Ava::normalized).collect();
        parts.sort();
        parts.join("+")
    }
}

impl PartialEq for Rdn {
    fn eq(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }
}

impl Eq for Rdn {}

impl fmt::Display for Rdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, ava) in self.avas.iter().enumerate() {
            if i > 0 {
                f.write_str("+")?;
            }
            write!(f, "{}={}", ava.attr, escape_value(&ava.value))?;
        }
        Ok(())
    }
}

/// Normalized string form of a DN. Two DNs name the same entry iff their
/// normalized forms are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NormalizedDn(String);

impl NormalizedDn {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NormalizedDn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Position of one DN relative to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnRelation {
    Equal,
    /// The first DN is a strict ancestor of the second.
    Ancestor,
    /// The first DN is a strict descendant of the second.
    Descendant,
    Unrelated,
}

/// Distinguished name, leaf RDN first.
#[derive(Debug, Clone, Default)]
pub struct Dn {
    rdns: Vec<Rdn>,
}

impl Dn {
    /// The empty DN (root DSE).
    pub fn root() -> Self {
        Self { rdns: Vec::new() }
    }

    pub fn from_rdns(rdns: Vec<Rdn>) -> Self {
        Self { rdns }
    }

    pub fn parse(input: &str) -> DirectoryResult<Self> {
        DnParser::new(input).parse()
    }

    pub fn is_root(&self) -> bool {
        self.rdns.is_empty()
    }

    pub fn rdns(&self) -> &[Rdn] {
        &self.rdns
    }

    /// Leaf RDN, `None` for the root DN.
    pub fn rdn(&self) -> Option<&Rdn> {
        self.rdns.first()
    }

    pub fn depth(&self) -> usize {
        self.rdns.len()
    }

    /// Parent DN; `None` for the root DN.
    pub fn parent(&self) -> Option<Dn> {
        if self.rdns.is_empty() {
            None
        } else {
            Some(Dn {
                rdns: self.rdns[1..].to_vec(),
            })
        }
    }

    pub fn child(&self, rdn: Rdn) -> Dn {
        let mut rdns = Vec::with_capacity(self.rdns.len() + 1);
        rdns.push(rdn);
        rdns.extend(self.rdns.iter().cloned());
        Dn { rdns }
    }

    pub fn normalize(&self) -> NormalizedDn {
        NormalizedDn(self.normalized_rdns().join(","))
    }

    /// Normalized RDN keys, leaf first.
    pub fn normalized_rdns(&self) -> Vec<String> {
        self.rdns.iter().map(Rdn::normalized).collect()
    }

    pub fn compare(&self, other: &Dn) -> DnRelation {
        let a = self.normalized_rdns();
        let b = other.normalized_rdns();
        match a.len().cmp(&b.len()) {
            Ordering::Equal if a == b => DnRelation::Equal,
            Ordering::Less if b[b.len() - a.len()..] == a[..] => DnRelation::Ancestor,
            Ordering::Greater if a[a.len() - b.len()..] == b[..] => DnRelation::Descendant,
            _ => DnRelation::Unrelated,
        }
    }

    /// Strict descendant test.
    pub fn is_descendant_of(&self, ancestor: &Dn) -> bool {
        self.compare(ancestor) == DnRelation::Descendant
    }

    pub fn is_within(&self, base: &Dn) -> bool {
        matches!(self.compare(base), DnRelation::Equal | DnRelation::Descendant)
    }

    /// RDNs below `ancestor`, ordered from just under the ancestor down to the leaf.
    pub fn rdns_below(&self, ancestor: &Dn) -> Option<Vec<Rdn>> {
        if !self.is_within(ancestor) {
            return None;
        }
        let count = self.rdns.len() - ancestor.rdns.len();
        Some(self.rdns[..count].iter().rev().cloned().collect())
    }

    /// Replace the `old_base` suffix with `new_base`. `self` must be within `old_base`.
    pub fn rebase(&self, old_base: &Dn, new_base: &Dn) -> Option<Dn> {
        if !self.is_within(old_base) {
            return None;
        }
        let count = self.rdns.len() - old_base.rdns.len();
        let mut rdns: Vec<Rdn> = self.rdns[..count].to_vec();
        rdns.extend(new_base.rdns.iter().cloned());
        Some(Dn { rdns })
    }
}

impl PartialEq for Dn {
    fn eq(&self, other: &Self) -> bool {
        self.normalize() == other.normalize()
    }
}

impl Eq for Dn {}

impl Hash for Dn {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalize().hash(state);
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, rdn) in self.rdns.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", rdn)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Dn {
    type Err = DirectoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Dn::parse(s)
    }
}

/// Case-fold a DN attribute value and collapse whitespace runs.
pub(crate) fn normalize_value(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// RFC 4514 section 2.4 escaping.
pub(crate) fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let last = value.chars().count().saturating_sub(1);
    for (i, c) in value.chars().enumerate() {
        match c {
            '"' | '+' | ',' | ';' | '<' | '>' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            '#' if i == 0 => out.push_str("\\#"),
            ' ' if i == 0 || i == last => out.push_str("\\ "),
            '\0' => out.push_str("\\00"),
            _ => out.push(c),
        }
    }
    out
}

struct DnParser<'a> {
    input: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl<'a> DnParser<'a> {
    fn new(input: &'a str) -> Self {
        let mut chars: Vec<char> = input.trim_start().chars().collect();
        // Trailing whitespace is dropped unless the last one is escaped.
        while let Some(&last) = chars.last() {
            let backslashes = chars[..chars.len() - 1]
                .iter()
                .rev()
                .take_while(|&&c| c == '\\')
                .count();
            if !last.is_whitespace() || backslashes % 2 == 1 {
                break;
            }
            chars.pop();
        }
        Self {
            input,
            chars,
            pos: 0,
        }
    }

    fn error(&self, message: &str) -> DirectoryError {
        DirectoryError::InvalidDn(format!("{} in '{}'", message, self.input))
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_spaces(&mut self) {
        while self.peek() == Some(' ') {
            self.pos += 1;
        }
    }

    fn parse(mut self) -> DirectoryResult<Dn> {
        if self.chars.is_empty() {
            return Ok(Dn::root());
        }
        let mut rdns = Vec::new();
        let mut avas = Vec::new();
        loop {
            avas.push(self.parse_ava()?);
            match self.peek() {
                None => {
                    rdns.push(Rdn { avas });
                    break;
                }
                Some('+') => {
                    self.pos += 1;
                }
                Some(',') | Some(';') => {
                    self.pos += 1;
                    rdns.push(Rdn {
                        avas: std::mem::take(&mut avas),
                    });
                    self.skip_spaces();
                    if self.peek().is_none() {
                        return Err(self.error("trailing RDN separator"));
                    }
                }
                Some(c) => return Err(self.error(&format!("unexpected character '{}'", c))),
            }
        }
        Ok(Dn { rdns })
    }

    fn parse_ava(&mut self) -> DirectoryResult<Ava> {
        self.skip_spaces();
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == '=' {
                break;
            }
            if matches!(c, ',' | ';' | '+') {
                return Err(self.error("missing '=' in RDN"));
            }
            self.pos += 1;
        }
        if self.peek() != Some('=') {
            return Err(self.error("missing '=' in RDN"));
        }
        let attr: String = self.chars[start..self.pos].iter().collect();
        let attr = attr.trim().to_string();
        if attr.is_empty() {
            return Err(self.error("empty attribute type"));
        }
        if !attr
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
        {
            return Err(self.error(&format!("invalid attribute type '{}'", attr)));
        }
        self.pos += 1;
        self.skip_spaces();
        let value = match self.peek() {
            Some('"') => self.parse_quoted_value()?,
            Some('#') => self.parse_hex_value()?,
            _ => self.parse_plain_value()?,
        };
        Ok(Ava { attr, value })
    }

    fn parse_quoted_value(&mut self) -> DirectoryResult<String> {
        self.pos += 1;
        let mut bytes = Vec::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unbalanced quotes")),
                Some('"') => {
                    self.pos += 1;
                    break;
                }
                Some('\\') => self.parse_escape(&mut bytes)?,
                Some(c) => {
                    push_char(&mut bytes, c);
                    self.pos += 1;
                }
            }
        }
        self.skip_spaces();
        if let Some(c) = self.peek() {
            if !matches!(c, ',' | ';' | '+') {
                return Err(self.error("unexpected text after quoted value"));
            }
        }
        String::from_utf8(bytes).map_err(|_| self.error("value is not valid UTF-8"))
    }

    fn parse_hex_value(&mut self) -> DirectoryResult<String> {
        let start = self.pos;
        self.pos += 1;
        while let Some(c) = self.peek() {
            if !c.is_ascii_hexdigit() {
                break;
            }
            self.pos += 1;
        }
        let value: String = self.chars[start..self.pos].iter().collect();
        if value.len() < 3 || value.len() % 2 == 0 {
            return Err(self.error("malformed hex value"));
        }
        self.skip_spaces();
        Ok(value)
    }

    fn parse_plain_value(&mut self) -> DirectoryResult<String> {
        let mut bytes = Vec::new();
        let mut significant = 0;
        while let Some(c) = self.peek() {
            match c {
                ',' | ';' | '+' => break,
                '"' => return Err(self.error("unbalanced quotes")),
                '\\' => {
                    self.parse_escape(&mut bytes)?;
                    significant = bytes.len();
                }
                _ => {
                    push_char(&mut bytes, c);
                    self.pos += 1;
                    if c != ' ' {
                        significant = bytes.len();
                    }
                }
            }
        }
        bytes.truncate(significant);
        String::from_utf8(bytes).map_err(|_| self.error("value is not valid UTF-8"))
    }

    fn parse_escape(&mut self, bytes: &mut Vec<u8>) -> DirectoryResult<()> {
        self.pos += 1;
        let c = self.peek().ok_or_else(|| self.error("dangling escape"))?;
        if c.is_ascii_hexdigit() {
            let next = self
                .chars
                .get(self.pos + 1)
                .copied()
                .filter(|n| n.is_ascii_hexdigit())
                .ok_or_else(|| self.error("invalid hex escape"))?;
            let hex: String = [c, next].iter().collect();
            let byte = u8::from_str_radix(&hex, 16).map_err(|_| self.error("invalid hex escape"))?;
            bytes.push(byte);
            self.pos += 2;
        } else {
            push_char(bytes, c);
            self.pos += 1;
        }
        Ok(())
    }
}

fn push_char(bytes: &mut Vec<u8>, c: char) {
    let mut buf = [0u8; 4];
    bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_dn() {
        let dn = Dn::parse("cn=admin,dc=example,dc=com").unwrap();
        assert_eq!(dn.depth(), 3);
        assert_eq!(dn.rdn().unwrap().avas()[0].attr, "cn");
        assert_eq!(dn.rdn().unwrap().avas()[0].value, "admin");
        assert_eq!(dn.to_string(), "cn=admin,dc=example,dc=com");
    }

    #[test]
    fn test_parse_empty_is_root() {
        let dn = Dn::parse("").unwrap();
        assert!(dn.is_root());
        assert!(dn.parent().is_none());
        assert_eq!(dn.normalize().as_str(), "");
    }

    #[test]
    fn test_normalization_ignores_case_and_spaces() {
        let a = Dn::parse("CN=Admin , DC=Example,  dc=COM").unwrap();
        let b = Dn::parse("cn=admin,dc=example,dc=com").unwrap();
        assert_eq!(a.normalize(), b.normalize());
        assert_eq!(a, b);
        // Original spelling is kept for display.
        assert_eq!(a.to_string(), "CN=Admin,DC=Example,dc=COM");
    }

    #[test]
    fn test_multi_valued_rdn_order_insensitive() {
        let a = Dn::parse("cn=John+uid=jsmith,dc=example,dc=com").unwrap();
        let b = Dn::parse("uid=jsmith+cn=John,dc=example,dc=com").unwrap();
        assert_eq!(a.normalize(), b.normalize());
        assert_eq!(a.rdn().unwrap().avas().len(), 2);
    }

    #[test]
    fn test_escaped_and_quoted_values() {
        let dn = Dn::parse(r"cn=Smith\, John,dc=example,dc=com").unwrap();
        assert_eq!(dn.rdn().unwrap().avas()[0].value, "Smith, John");
        assert_eq!(dn.depth(), 3);
        assert_eq!(dn.to_string(), r"cn=Smith\, John,dc=example,dc=com");

        let quoted = Dn::parse(r#"cn="Smith, John",dc=example,dc=com"#).unwrap();
        assert_eq!(quoted, dn);

        let hex = Dn::parse(r"cn=Smith\2C John,dc=example,dc=com").unwrap();
        assert_eq!(hex, dn);
    }

    #[test]
    fn test_escaped_utf8_hex_pairs() {
        let dn = Dn::parse(r"cn=Lu\C4\8Di\C4\87,dc=example,dc=com").unwrap();
        assert_eq!(dn.rdn().unwrap().avas()[0].value, "Lučić");
    }

    #[test]
    fn test_trailing_escaped_space_is_kept() {
        let dn = Dn::parse(r"cn=abc\ ,dc=com").unwrap();
        assert_eq!(dn.rdn().unwrap().avas()[0].value, "abc ");
        let dn = Dn::parse("cn=abc   ,dc=com").unwrap();
        assert_eq!(dn.rdn().unwrap().avas()[0].value, "abc");

        let dn = Dn::parse(r"cn=admin,dc=com\ ").unwrap();
        assert_eq!(dn.rdns()[1].avas()[0].value, "com ");
        let dn = Dn::parse("  cn=admin,dc=com \n").unwrap();
        assert_eq!(dn.rdns()[1].avas()[0].value, "com");
        assert!(Dn::parse(r"cn=admin,dc=com\\ ").is_ok());
    }

    #[test]
    fn test_hex_string_value() {
        let dn = Dn::parse("1.3.6.1.4.1.1466.0=#04024869,dc=com").unwrap();
        assert_eq!(dn.rdn().unwrap().avas()[0].value, "#04024869");
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(Dn::parse("cn"), Err(DirectoryError::InvalidDn(_))));
        assert!(Dn::parse("cn=a,dc").is_err());
        assert!(Dn::parse("=value,dc=com").is_err());
        assert!(Dn::parse(r#"cn="unterminated,dc=com"#).is_err());
        assert!(Dn::parse(r"cn=abc\").is_err());
        assert!(Dn::parse("cn=a,").is_err());
        assert!(Dn::parse("cn=a,,dc=com").is_err());
        assert!(Dn::parse(r"cn=bad\zzescape").is_ok());
        assert!(Dn::parse(r"cn=bad\4").is_err());
    }

    #[test]
    fn test_parent_and_child() {
        let dn = Dn::parse("cn=admin,ou=people,dc=example,dc=com").unwrap();
        let parent = dn.parent().unwrap();
        assert_eq!(parent.to_string(), "ou=people,dc=example,dc=com");
        let child = parent.child(Rdn::new("cn", "admin"));
        assert_eq!(child, dn);
        let top = Dn::parse("dc=com").unwrap();
        assert!(top.parent().unwrap().is_root());
    }

    #[test]
    fn test_compare_relations() {
        let base = Dn::parse("dc=example,dc=com").unwrap();
        let leaf = Dn::parse("cn=admin,ou=people,dc=example,dc=com").unwrap();
        let other = Dn::parse("dc=other,dc=com").unwrap();
        assert_eq!(base.compare(&leaf), DnRelation::Ancestor);
        assert_eq!(leaf.compare(&base), DnRelation::Descendant);
        assert_eq!(base.compare(&Dn::parse("DC=Example,DC=Com").unwrap()), DnRelation::Equal);
        assert_eq!(base.compare(&other), DnRelation::Unrelated);
        assert!(leaf.is_descendant_of(&base));
        assert!(!base.is_descendant_of(&base));
        assert!(base.is_within(&base));
        assert_eq!(Dn::root().compare(&base), DnRelation::Ancestor);
    }

    #[test]
    fn test_rdns_below() {
        let base = Dn::parse("dc=example,dc=com").unwrap();
        let leaf = Dn::parse("cn=admin,ou=people,dc=example,dc=com").unwrap();
        let below = leaf.rdns_below(&base).unwrap();
        assert_eq!(below.len(), 2);
        assert_eq!(below[0].normalized(), "ou=people");
        assert_eq!(below[1].normalized(), "cn=admin");
        assert!(base.rdns_below(&leaf).is_none());
    }

    #[test]
    fn test_rebase() {
        let dn = Dn::parse("cn=a,ou=old,dc=example,dc=com").unwrap();
        let old = Dn::parse("ou=old,dc=example,dc=com").unwrap();
        let new = Dn::parse("ou=new,dc=example,dc=com").unwrap();
        assert_eq!(dn.rebase(&old, &new).unwrap().to_string(), "cn=a,ou=new,dc=example,dc=com");
    }

    #[test]
    fn test_rdn_parse_requires_single_component() {
        assert!(Rdn::parse("cn=new").is_ok());
        assert!(Rdn::parse("cn=new,dc=com").is_err());
        assert!(Rdn::parse("").is_err());
    }

    #[test]
    fn test_escape_value() {
        assert_eq!(escape_value("a,b"), r"a\,b");
        assert_eq!(escape_value("#x"), r"\#x");
        assert_eq!(escape_value(" x "), r"\ x\ ");
        assert_eq!(escape_value("plain"), "plain");
    }
}
