//! Search filters: RFC 4515 string parsing, rendering and evaluation.

use crate::entry::Entry;
use crate::error::{DirectoryError, DirectoryResult};
use crate::schema::{MatchingRule, Schema};
use std::cmp::Ordering;
use std::fmt;

/// Nesting limit for `&`, `|` and `!`, shared with the BER decoder.
pub(crate) const MAX_FILTER_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubstringFilter {
    pub attribute: String,
    pub initial: Option<Vec<u8>>,
    pub any: Vec<Vec<u8>>,
    pub final_value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensibleFilter {
    pub rule: Option<String>,
    pub attribute: Option<String>,
    pub value: Vec<u8>,
    pub dn_attributes: bool,
}

/// Boolean expression over attribute value assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// `(&)` with no members is absolute true.
    And(Vec<Filter>),
    /// `(|)` with no members is absolute false.
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality(String, Vec<u8>),
    Substrings(SubstringFilter),
    GreaterOrEqual(String, Vec<u8>),
    LessOrEqual(String, Vec<u8>),
    Present(String),
    Approx(String, Vec<u8>),
    Extensible(ExtensibleFilter),
}

impl Filter {
    /// Parse an RFC 4515 filter. Outer parentheses are optional.
    pub fn parse(text: &str) -> DirectoryResult<Filter> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(DirectoryError::InvalidFilter("empty filter".to_string()));
        }
        let wrapped;
        let input = if trimmed.starts_with('(') {
            trimmed
        } else {
            wrapped = format!("({})", trimmed);
            &wrapped
        };
        let mut parser = FilterParser {
            input,
            bytes: input.as_bytes(),
            pos: 0,
        };
        let filter = parser.parse_filter(0)?;
        if parser.pos != parser.bytes.len() {
            return Err(parser.error("trailing characters after filter"));
        }
        Ok(filter)
    }

    /// The filter that matches every entry, `(objectClass=*)`.
    pub fn match_all() -> Filter {
        Filter::Present("objectClass".to_string())
    }

    /// Evaluate against an entry. Pure and total.
    pub fn matches(&self, entry: &Entry, schema: &Schema) -> bool {
        match self {
            Filter::And(filters) => filters.iter().all(|f| f.matches(entry, schema)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(entry, schema)),
            Filter::Not(filter) => !filter.matches(entry, schema),
            Filter::Present(attr) => entry
                .attributes()
                .any(|a| schema.is_subtype_of(&a.name, attr)),
            Filter::Equality(attr, value) => {
                let rule = schema.matching_rule(attr);
                values_of(entry, attr, schema)
                    .into_iter()
                    .any(|v| rule.equal(v, value))
            }
            Filter::GreaterOrEqual(attr, value) => {
                let rule = schema.matching_rule(attr);
                values_of(entry, attr, schema)
                    .into_iter()
                    .any(|v| rule.compare(v, value) != Ordering::Less)
            }
            Filter::LessOrEqual(attr, value) => {
                let rule = schema.matching_rule(attr);
                values_of(entry, attr, schema)
                    .into_iter()
                    .any(|v| rule.compare(v, value) != Ordering::Greater)
            }
            Filter::Approx(attr, value) => {
                let wanted = approximate(value);
                values_of(entry, attr, schema)
                    .into_iter()
                    .any(|v| approximate(v) == wanted)
            }
            Filter::Substrings(sub) => {
                let rule = substring_rule(schema.matching_rule(&sub.attribute));
                values_of(entry, &sub.attribute, schema)
                    .into_iter()
                    .any(|v| sub.matches_value(rule, v))
            }
            Filter::Extensible(ext) => ext.matches(entry, schema),
        }
    }
}

impl SubstringFilter {
    fn matches_value(&self, rule: MatchingRule, value: &[u8]) -> bool {
        let value = rule.normalize(value);
        let mut pos = 0;
        if let Some(initial) = &self.initial {
            let initial = rule.normalize_substring(initial);
            let initial = initial.trim_ascii_start();
            if !value.starts_with(initial) {
                return false;
            }
            pos = initial.len();
        }
        for any in &self.any {
            let any = rule.normalize_substring(any);
            match find(&value[pos..], &any) {
                Some(offset) => pos += offset + any.len(),
                None => return false,
            }
        }
        match &self.final_value {
            Some(final_value) => {
                let final_value = rule.normalize_substring(final_value);
                let final_value = final_value.trim_ascii_end();
                value.len() - pos >= final_value.len() && value.ends_with(final_value)
            }
            None => true,
        }
    }
}

impl ExtensibleFilter {
    fn matches(&self, entry: &Entry, schema: &Schema) -> bool {
        let rule = match &self.rule {
            Some(name) => match MatchingRule::from_equality(name) {
                Some(rule) => rule,
                None => return false,
            },
            None => match &self.attribute {
                Some(attr) => schema.matching_rule(attr),
                None => return false,
            },
        };
        let attribute_match = match &self.attribute {
            Some(attr) => values_of(entry, attr, schema)
                .into_iter()
                .any(|v| rule.equal(v, &self.value)),
            None => entry
                .attributes()
                .flat_map(|a| a.values.iter())
                .any(|v| rule.equal(v, &self.value)),
        };
        if attribute_match {
            return true;
        }
        if !self.dn_attributes {
            return false;
        }
        entry.dn().rdns().iter().flat_map(|rdn| rdn.avas()).any(|ava| {
            let attr_ok = self
                .attribute
                .as_deref()
                .map_or(true, |attr| schema.is_subtype_of(&ava.attr, attr));
            attr_ok && rule.equal(ava.value.as_bytes(), &self.value)
        })
    }
}

/// Values of `attr` and its subtypes.
fn values_of<'a>(entry: &'a Entry, attr: &str, schema: &Schema) -> Vec<&'a [u8]> {
    entry
        .attributes()
        .filter(|a| schema.is_subtype_of(&a.name, attr))
        .flat_map(|a| a.values.iter().map(Vec::as_slice))
        .collect()
}

fn substring_rule(rule: MatchingRule) -> MatchingRule {
    match rule {
        MatchingRule::CaseExact
        | MatchingRule::Octet
        | MatchingRule::NumericString
        | MatchingRule::TelephoneNumber => rule,
        _ => MatchingRule::CaseIgnore,
    }
}

/// Case, whitespace and punctuation are insignificant for `~=`.
fn approximate(value: &[u8]) -> String {
    String::from_utf8_lossy(value)
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

struct FilterParser<'a> {
    input: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl FilterParser<'_> {
    fn error(&self, message: &str) -> DirectoryError {
        DirectoryError::InvalidFilter(format!("{} at offset {} in '{}'", message, self.pos, self.input))
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn expect(&mut self, byte: u8) -> DirectoryResult<()> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", byte as char)))
        }
    }

    fn parse_filter(&mut self, depth: usize) -> DirectoryResult<Filter> {
        if depth > MAX_FILTER_DEPTH {
            return Err(self.error("filter nested too deeply"));
        }
        self.expect(b'(')?;
        let filter = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                Filter::And(self.parse_list(depth)?)
            }
            Some(b'|') => {
                self.pos += 1;
                Filter::Or(self.parse_list(depth)?)
            }
            Some(b'!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.parse_filter(depth + 1)?))
            }
            Some(_) => self.parse_item()?,
            None => return Err(self.error("unexpected end of filter")),
        };
        self.expect(b')')?;
        Ok(filter)
    }

    fn parse_list(&mut self, depth: usize) -> DirectoryResult<Vec<Filter>> {
        let mut filters = Vec::new();
        while self.peek() == Some(b'(') {
            filters.push(self.parse_filter(depth + 1)?);
        }
        Ok(filters)
    }

    fn parse_item(&mut self) -> DirectoryResult<Filter> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b == b')' {
                break;
            }
            if b == b'(' {
                return Err(self.error("unescaped '(' in filter value"));
            }
            self.pos += 1;
        }
        let item = &self.input[start..self.pos];
        let eq = item
            .find('=')
            .ok_or_else(|| self.error("missing '=' in filter item"))?;
        let (lhs, raw_value) = (&item[..eq], &item[eq + 1..]);

        if let Some(attr) = lhs.strip_suffix('~') {
            return Ok(Filter::Approx(self.attribute(attr)?, self.unescape(raw_value)?));
        }
        if let Some(attr) = lhs.strip_suffix('>') {
            return Ok(Filter::GreaterOrEqual(self.attribute(attr)?, self.unescape(raw_value)?));
        }
        if let Some(attr) = lhs.strip_suffix('<') {
            return Ok(Filter::LessOrEqual(self.attribute(attr)?, self.unescape(raw_value)?));
        }
        if let Some(descr) = lhs.strip_suffix(':') {
            return self.parse_extensible(descr, raw_value);
        }

        let attribute = self.attribute(lhs)?;
        if raw_value == "*" {
            return Ok(Filter::Present(attribute));
        }
        if !raw_value.contains('*') {
            return Ok(Filter::Equality(attribute, self.unescape(raw_value)?));
        }
        let parts: Vec<&str> = raw_value.split('*').collect();
        let last = parts.len() - 1;
        let mut sub = SubstringFilter {
            attribute,
            initial: None,
            any: Vec::new(),
            final_value: None,
        };
        for (i, part) in parts.iter().enumerate() {
            if part.is_empty() {
                if i != 0 && i != last {
                    return Err(self.error("empty substring component"));
                }
                continue;
            }
            let value = self.unescape(part)?;
            if i == 0 {
                sub.initial = Some(value);
            } else if i == last {
                sub.final_value = Some(value);
            } else {
                sub.any.push(value);
            }
        }
        Ok(Filter::Substrings(sub))
    }

    fn parse_extensible(&self, descr: &str, raw_value: &str) -> DirectoryResult<Filter> {
        let mut parts = descr.split(':');
        let attribute = match parts.next() {
            Some("") | None => None,
            Some(attr) => Some(self.attribute(attr)?),
        };
        let mut dn_attributes = false;
        let mut rule = None;
        for part in parts {
            if part.eq_ignore_ascii_case("dn") && rule.is_none() && !dn_attributes {
                dn_attributes = true;
            } else if rule.is_none() && !part.is_empty() {
                rule = Some(part.to_string());
            } else {
                return Err(self.error("malformed extensible match"));
            }
        }
        if attribute.is_none() && rule.is_none() {
            return Err(self.error("extensible match needs an attribute or a rule"));
        }
        Ok(Filter::Extensible(ExtensibleFilter {
            rule,
            attribute,
            value: self.unescape(raw_value)?,
            dn_attributes,
        }))
    }

    fn attribute(&self, attr: &str) -> DirectoryResult<String> {
        let attr = attr.trim();
        if attr.is_empty() {
            return Err(self.error("empty attribute description"));
        }
        if !attr
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | ';' | '.' | '_'))
        {
            return Err(self.error(&format!("invalid attribute description '{}'", attr)));
        }
        Ok(attr.to_string())
    }

    fn unescape(&self, raw: &str) -> DirectoryResult<Vec<u8>> {
        let bytes = raw.as_bytes();
        let mut out = Vec::with_capacity(bytes.len());
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'\\' {
                let hex = bytes
                    .get(i + 1..i + 3)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| self.error("invalid escape in filter value"))?;
                out.push(hex);
                i += 3;
            } else {
                out.push(bytes[i]);
                i += 1;
            }
        }
        Ok(out)
    }
}

fn escape_value(value: &[u8]) -> String {
    let mut out = String::with_capacity(value.len());
    for &b in value {
        match b {
            b'*' | b'(' | b')' | b'\\' | 0 => out.push_str(&format!("\\{:02x}", b)),
            b if b.is_ascii() => out.push(b as char),
            b => out.push_str(&format!("\\{:02x}", b)),
        }
    }
    out
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::And(filters) => {
                f.write_str("(&")?;
                for filter in filters {
                    write!(f, "{}", filter)?;
                }
                f.write_str(")")
            }
            Filter::Or(filters) => {
                f.write_str("(|")?;
                for filter in filters {
                    write!(f, "{}", filter)?;
                }
                f.write_str(")")
            }
            Filter::Not(filter) => write!(f, "(!{})", filter),
            Filter::Equality(attr, value) => write!(f, "({}={})", attr, escape_value(value)),
            Filter::GreaterOrEqual(attr, value) => write!(f, "({}>={})", attr, escape_value(value)),
            Filter::LessOrEqual(attr, value) => write!(f, "({}<={})", attr, escape_value(value)),
            Filter::Approx(attr, value) => write!(f, "({}~={})", attr, escape_value(value)),
            Filter::Present(attr) => write!(f, "({}=*)", attr),
            Filter::Substrings(sub) => {
                write!(f, "({}=", sub.attribute)?;
                if let Some(initial) = &sub.initial {
                    f.write_str(&escape_value(initial))?;
                }
                f.write_str("*")?;
                for any in &sub.any {
                    write!(f, "{}*", escape_value(any))?;
                }
                if let Some(final_value) = &sub.final_value {
                    f.write_str(&escape_value(final_value))?;
                }
                f.write_str(")")
            }
            Filter::Extensible(ext) => {
                f.write_str("(")?;
                if let Some(attr) = &ext.attribute {
                    f.write_str(attr)?;
                }
                if ext.dn_attributes {
                    f.write_str(":dn")?;
                }
                if let Some(rule) = &ext.rule {
                    write!(f, ":{}", rule)?;
                }
                write!(f, ":={})", escape_value(&ext.value))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dn::Dn;

    fn schema() -> Schema {
        Schema::standard().unwrap()
    }

    fn person(cn: &str) -> Entry {
        Entry::new(Dn::parse(&format!("cn={},ou=people,dc=example,dc=com", cn)).unwrap())
            .with_attribute("objectClass", ["top", "person"])
            .with_attribute("cn", [cn])
            .with_attribute("sn", ["Smith"])
    }

    #[test]
    fn test_parse_simple_forms() {
        assert_eq!(
            Filter::parse("(cn=admin)").unwrap(),
            Filter::Equality("cn".into(), b"admin".to_vec())
        );
        assert_eq!(Filter::parse("cn=admin").unwrap(), Filter::parse("(cn=admin)").unwrap());
        assert_eq!(Filter::parse("(mail=*)").unwrap(), Filter::Present("mail".into()));
        assert!(matches!(Filter::parse("(uidNumber>=100)").unwrap(), Filter::GreaterOrEqual(..)));
        assert!(matches!(Filter::parse("(uidNumber<=100)").unwrap(), Filter::LessOrEqual(..)));
        assert!(matches!(Filter::parse("(cn~=jon)").unwrap(), Filter::Approx(..)));
        assert_eq!(Filter::parse("(&)").unwrap(), Filter::And(vec![]));
        assert_eq!(Filter::parse("(|)").unwrap(), Filter::Or(vec![]));
    }

    #[test]
    fn test_parse_substrings() {
        let Filter::Substrings(sub) = Filter::parse("(cn=Jo*n*Sm*th)").unwrap() else {
            panic!("expected substrings");
        };
        assert_eq!(sub.initial, Some(b"Jo".to_vec()));
        assert_eq!(sub.any, vec![b"n".to_vec(), b"Sm".to_vec()]);
        assert_eq!(sub.final_value, Some(b"th".to_vec()));

        let Filter::Substrings(sub) = Filter::parse("(cn=*Smith)").unwrap() else {
            panic!("expected substrings");
        };
        assert_eq!(sub.initial, None);
        assert_eq!(sub.final_value, Some(b"Smith".to_vec()));
    }

    #[test]
    fn test_parse_escapes() {
        assert_eq!(
            Filter::parse(r"(cn=a\2ab\28c\29)").unwrap(),
            Filter::Equality("cn".into(), b"a*b(c)".to_vec())
        );
        assert!(Filter::parse(r"(cn=bad\zz)").is_err());
    }

    #[test]
    fn test_parse_extensible() {
        let Filter::Extensible(ext) = Filter::parse("(ou:dn:caseExactMatch:=people)").unwrap() else {
            panic!("expected extensible");
        };
        assert_eq!(ext.attribute.as_deref(), Some("ou"));
        assert!(ext.dn_attributes);
        assert_eq!(ext.rule.as_deref(), Some("caseExactMatch"));
        assert!(Filter::parse("(:caseIgnoreMatch:=x)").is_ok());
        assert!(Filter::parse("(:=x)").is_err());
    }

    #[test]
    fn test_parse_errors() {
        for bad in ["", "(", "(cn=a", "(cn)", "((cn=a))", "(cn=a))", "(=a)", "(c n=a)", "(cn=a(b)", "(cn=a**b)"] {
            assert!(
                matches!(Filter::parse(bad), Err(DirectoryError::InvalidFilter(_))),
                "{} should not parse",
                bad
            );
        }
    }

    #[test]
    fn test_parse_nesting_limit() {
        let nested = |depth: usize| format!("{}(cn=a){}", "(!".repeat(depth), ")".repeat(depth));
        assert!(Filter::parse(&nested(MAX_FILTER_DEPTH)).is_ok());
        assert!(matches!(
            Filter::parse(&nested(MAX_FILTER_DEPTH + 1)),
            Err(DirectoryError::InvalidFilter(_))
        ));
        assert!(matches!(
            Filter::parse(&nested(200_000)),
            Err(DirectoryError::InvalidFilter(_))
        ));
        let ands = format!("{}(cn=a){}", "(&".repeat(100), ")".repeat(100));
        assert!(Filter::parse(&ands).is_err());
    }

    #[test]
    fn test_display_renders_rfc4515() {
        for text in [
            "(&(objectClass=person)(cn=John*))",
            "(|(sn=Smith)(!(cn=Jane)))",
            "(cn=*oh*)",
            "(uidNumber>=1000)",
            r"(cn=a\2ab)",
            "(ou:dn:caseIgnoreMatch:=people)",
        ] {
            assert_eq!(Filter::parse(text).unwrap().to_string(), text);
        }
    }

    #[test]
    fn test_and_substring_match() {
        let schema = schema();
        let filter = Filter::parse("(&(objectClass=person)(cn=John*))").unwrap();
        assert!(filter.matches(&person("John Smith"), &schema));
        assert!(!filter.matches(&person("Jane Smith"), &schema));
    }

    #[test]
    fn test_absolute_true_and_false() {
        let schema = schema();
        let entry = person("John Smith");
        assert!(Filter::parse("(&)").unwrap().matches(&entry, &schema));
        assert!(!Filter::parse("(|)").unwrap().matches(&entry, &schema));
    }

    #[test]
    fn test_absent_attribute_is_false() {
        let schema = schema();
        let entry = person("John Smith");
        assert!(!Filter::parse("(mail=john@example.com)").unwrap().matches(&entry, &schema));
        assert!(!Filter::parse("(mail=*)").unwrap().matches(&entry, &schema));
        assert!(!Filter::parse("(mail>=a)").unwrap().matches(&entry, &schema));
        assert!(Filter::parse("(!(mail=*))").unwrap().matches(&entry, &schema));
    }

    #[test]
    fn test_equality_uses_matching_rule() {
        let schema = schema();
        let entry = person("John Smith").with_attribute("userPassword", ["Secret"]);
        assert!(Filter::parse("(CN=JOHN  SMITH)").unwrap().matches(&entry, &schema));
        assert!(Filter::parse("(userPassword=Secret)").unwrap().matches(&entry, &schema));
        assert!(!Filter::parse("(userPassword=secret)").unwrap().matches(&entry, &schema));
        // Supertype assertions see subtypes.
        assert!(Filter::parse("(name=john smith)").unwrap().matches(&entry, &schema));
        assert!(Filter::parse("(commonName=John Smith)").unwrap().matches(&entry, &schema));
    }

    #[test]
    fn test_integer_ordering() {
        let schema = schema();
        let entry = Entry::new(Dn::parse("uid=a,dc=example,dc=com").unwrap())
            .with_attribute("uidNumber", ["1000"]);
        assert!(Filter::parse("(uidNumber>=999)").unwrap().matches(&entry, &schema));
        assert!(!Filter::parse("(uidNumber>=10000)").unwrap().matches(&entry, &schema));
        assert!(Filter::parse("(uidNumber<=1000)").unwrap().matches(&entry, &schema));
        assert!(Filter::parse("(uidNumber=01000)").unwrap().matches(&entry, &schema));
    }

    #[test]
    fn test_approximate_match() {
        let schema = schema();
        let entry = person("John O'Smith");
        assert!(Filter::parse("(cn~=john osmith)").unwrap().matches(&entry, &schema));
        assert!(!Filter::parse("(cn~=jane)").unwrap().matches(&entry, &schema));
    }

    #[test]
    fn test_substring_any_order() {
        let schema = schema();
        let entry = person("John Smith");
        assert!(Filter::parse("(cn=*oh*mi*)").unwrap().matches(&entry, &schema));
        assert!(!Filter::parse("(cn=*mi*oh*)").unwrap().matches(&entry, &schema));
        assert!(!Filter::parse("(cn=John*hn Smith)").unwrap().matches(&entry, &schema));
    }

    #[test]
    fn test_substring_keeps_edge_spaces() {
        let schema = schema();
        let john = person("John Smith");
        let johnny = person("Johnny");
        let initial = Filter::parse("(cn=John *)").unwrap();
        assert!(initial.matches(&john, &schema));
        assert!(!initial.matches(&johnny, &schema));
        let any = Filter::parse("(cn=* smi*)").unwrap();
        assert!(any.matches(&john, &schema));
        assert!(!any.matches(&person("Johnsmith"), &schema));
        assert!(Filter::parse("(cn=john   *)").unwrap().matches(&john, &schema));
        assert!(Filter::parse("(cn=*n Smith)").unwrap().matches(&john, &schema));
    }

    #[test]
    fn test_extensible_dn_attributes() {
        let schema = schema();
        let entry = person("John Smith");
        assert!(!Filter::parse("(ou=people)").unwrap().matches(&entry, &schema));
        assert!(Filter::parse("(ou:dn:=people)").unwrap().matches(&entry, &schema));
        assert!(Filter::parse("(sn:caseExactMatch:=Smith)").unwrap().matches(&entry, &schema));
        assert!(!Filter::parse("(sn:caseExactMatch:=smith)").unwrap().matches(&entry, &schema));
        assert!(!Filter::parse("(sn:unknownMatch:=Smith)").unwrap().matches(&entry, &schema));
    }
}
