//! Directory entries and modifications.

use crate::dn::Dn;
use base64::Engine;

const LDIF_LINE_WIDTH: usize = 76;

/// Kind of change in a Modify request (RFC 4511 section 4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModificationOp {
    Add,
    Delete,
    Replace,
}

impl TryFrom<u8> for ModificationOp {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ModificationOp::Add),
            1 => Ok(ModificationOp::Delete),
            2 => Ok(ModificationOp::Replace),
            _ => Err(format!("Invalid modification operation: {}", value)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modification {
    pub op: ModificationOp,
    pub attribute: String,
    pub values: Vec<Vec<u8>>,
}

impl Modification {
    pub fn new<I, V>(op: ModificationOp, attribute: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: AsRef<[u8]>,
    {
        Self {
            op,
            attribute: attribute.to_string(),
            values: values.into_iter().map(|v| v.as_ref().to_vec()).collect(),
        }
    }
}

/// A named, multi-valued attribute. Values keep insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub values: Vec<Vec<u8>>,
}

impl Attribute {
    pub fn new(name: impl Into<String>, values: Vec<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    pub fn contains(&self, value: &[u8]) -> bool {
        self.values.iter().any(|v| v == value)
    }

    fn same_values(&self, other: &Attribute) -> bool {
        self.values.len() == other.values.len() && self.values.iter().all(|v| other.contains(v))
    }
}

/// A directory entry. Attribute lookup is case-insensitive.
#[derive(Debug, Clone)]
pub struct Entry {
    dn: Dn,
    attributes: Vec<Attribute>,
}

impl Entry {
    pub fn new(dn: Dn) -> Self {
        Self {
            dn,
            attributes: Vec::new(),
        }
    }

    /// Builder form of [`Entry::add_value`].
    pub fn with_attribute<I, V>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: AsRef<[u8]>,
    {
        for value in values {
            self.add_value(name, value.as_ref().to_vec());
        }
        self
    }

    pub fn dn(&self) -> &Dn {
        &self.dn
    }

    pub fn set_dn(&mut self, dn: Dn) {
        self.dn = dn;
    }

    pub fn attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Attribute> {
        self.attributes
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Values of `name`, empty when absent.
    pub fn values(&self, name: &str) -> &[Vec<u8>] {
        self.get(name).map(|a| a.values.as_slice()).unwrap_or(&[])
    }

    pub fn first_value_str(&self, name: &str) -> Option<&str> {
        self.values(name)
            .first()
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Add one value; returns false when the exact value was already present.
    pub fn add_value(&mut self, name: &str, value: Vec<u8>) -> bool {
        match self
            .attributes
            .iter_mut()
            .find(|a| a.name.eq_ignore_ascii_case(name))
        {
            Some(attribute) => {
                if attribute.contains(&value) {
                    false
                } else {
                    attribute.values.push(value);
                    true
                }
            }
            None => {
                self.attributes.push(Attribute::new(name, vec![value]));
                true
            }
        }
    }

    /// Replace all values of `name`; an empty list removes the attribute.
    pub fn set_values(&mut self, name: &str, values: Vec<Vec<u8>>) {
        self.remove_attribute(name);
        for value in values {
            self.add_value(name, value);
        }
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<Attribute> {
        let idx = self
            .attributes
            .iter()
            .position(|a| a.name.eq_ignore_ascii_case(name))?;
        Some(self.attributes.remove(idx))
    }

    /// Remove the values of `name` selected by `matches`; drops the attribute
    /// when no value is left. Returns how many values were removed.
    pub fn remove_values_where<F>(&mut self, name: &str, mut matches: F) -> usize
    where
        F: FnMut(&[u8]) -> bool,
    {
        let Some(idx) = self
            .attributes
            .iter()
            .position(|a| a.name.eq_ignore_ascii_case(name))
        else {
            return 0;
        };
        let attribute = &mut self.attributes[idx];
        let before = attribute.values.len();
        attribute.values.retain(|v| !matches(v));
        let removed = before - attribute.values.len();
        if attribute.values.is_empty() {
            self.attributes.remove(idx);
        }
        removed
    }

    /// Values of `objectClass` as strings.
    pub fn object_classes(&self) -> Vec<String> {
        self.values("objectClass")
            .iter()
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .collect()
    }

    pub fn has_object_class(&self, name: &str) -> bool {
        self.object_classes()
            .iter()
            .any(|oc| oc.eq_ignore_ascii_case(name))
    }

    /// Render as one LDIF content record (RFC 2849), without a trailing blank line.
    pub fn to_ldif(&self) -> String {
        let mut out = String::new();
        push_ldif_line(&mut out, "dn", self.dn.to_string().as_bytes());
        for attribute in &self.attributes {
            for value in &attribute.values {
                push_ldif_line(&mut out, &attribute.name, value);
            }
        }
        out
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.dn == other.dn
            && self.attributes.len() == other.attributes.len()
            && self.attributes.iter().all(|a| {
                other
                    .get(&a.name)
                    .is_some_and(|b| a.same_values(b))
            })
    }
}

impl Eq for Entry {}

/// SAFE-STRING per RFC 2849; anything else is base64 encoded.
fn is_ldif_safe(value: &[u8]) -> bool {
    match value.first() {
        None => true,
        Some(b' ') | Some(b':') | Some(b'<') => false,
        Some(_) => {
            value.last() != Some(&b' ')
                && value
                    .iter()
                    .all(|&b| b.is_ascii() && b != 0 && b != b'\n' && b != b'\r')
        }
    }
}

fn push_ldif_line(out: &mut String, name: &str, value: &[u8]) {
    let line = if is_ldif_safe(value) {
        format!("{}: {}", name, String::from_utf8_lossy(value))
    } else {
        format!(
            "{}:: {}",
            name,
            base64::engine::general_purpose::STANDARD.encode(value)
        )
    };
    // Fold long lines; the content is ASCII so byte offsets are char offsets.
    let mut rest = line.as_str();
    let mut first = true;
    while !rest.is_empty() {
        let width = if first { LDIF_LINE_WIDTH } else { LDIF_LINE_WIDTH - 1 };
        let (chunk, tail) = rest.split_at(width.min(rest.len()));
        if !first {
            out.push(' ');
        }
        out.push_str(chunk);
        out.push('\n');
        rest = tail;
        first = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Entry {
        Entry::new(Dn::parse("cn=John Smith,ou=people,dc=example,dc=com").unwrap())
            .with_attribute("objectClass", ["top", "person"])
            .with_attribute("cn", ["John Smith"])
            .with_attribute("sn", ["Smith"])
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let entry = sample();
        assert_eq!(entry.values("CN"), &[b"John Smith".to_vec()]);
        assert!(entry.has_attribute("objectclass"));
        assert_eq!(entry.first_value_str("sn"), Some("Smith"));
        assert!(entry.values("mail").is_empty());
    }

    #[test]
    fn test_duplicate_values_not_stored() {
        let mut entry = sample();
        assert!(!entry.add_value("cn", b"John Smith".to_vec()));
        assert!(entry.add_value("cn", b"Johnny".to_vec()));
        assert_eq!(entry.values("cn").len(), 2);
    }

    #[test]
    fn test_remove_values() {
        let mut entry = sample().with_attribute("description", ["a", "b"]);
        assert_eq!(entry.remove_values_where("description", |v| v == b"a"), 1);
        assert_eq!(entry.values("description").len(), 1);
        assert_eq!(entry.remove_values_where("description", |_| true), 1);
        assert!(!entry.has_attribute("description"));
        assert_eq!(entry.remove_values_where("missing", |_| true), 0);
    }

    #[test]
    fn test_set_values_replaces() {
        let mut entry = sample();
        entry.set_values("sn", vec![b"Doe".to_vec()]);
        assert_eq!(entry.first_value_str("sn"), Some("Doe"));
        entry.set_values("sn", Vec::new());
        assert!(!entry.has_attribute("sn"));
    }

    #[test]
    fn test_object_classes() {
        let entry = sample();
        assert_eq!(entry.object_classes(), vec!["top", "person"]);
        assert!(entry.has_object_class("PERSON"));
    }

    #[test]
    fn test_equality_ignores_order() {
        let a = sample();
        let b = Entry::new(Dn::parse("CN=John Smith,OU=People,DC=Example,DC=Com").unwrap())
            .with_attribute("sn", ["Smith"])
            .with_attribute("cn", ["John Smith"])
            .with_attribute("objectClass", ["person", "top"]);
        assert_eq!(a, b);
        let c = sample().with_attribute("description", ["x"]);
        assert_ne!(a, c);
    }

    #[test]
    fn test_to_ldif() {
        let entry = sample()
            .with_attribute("description", [" leading space"])
            .with_attribute("userPassword", [[0xffu8, 0x00]]);
        let ldif = entry.to_ldif();
        assert!(ldif.starts_with("dn: cn=John Smith,ou=people,dc=example,dc=com\n"));
        assert!(ldif.contains("objectClass: top\n"));
        assert!(ldif.contains("description:: IGxlYWRpbmcgc3BhY2U=\n"));
        assert!(ldif.contains("userPassword:: /wA=\n"));
    }

    #[test]
    fn test_to_ldif_folds_long_lines() {
        let long = "x".repeat(200);
        let entry = sample().with_attribute("description", [long.as_str()]);
        let ldif = entry.to_ldif();
        assert!(ldif.lines().all(|l| l.len() <= LDIF_LINE_WIDTH));
        assert!(ldif.lines().any(|l| l.starts_with(' ')));
    }

    #[test]
    fn test_modification_op_from_wire() {
        assert_eq!(ModificationOp::try_from(0).unwrap(), ModificationOp::Add);
        assert_eq!(ModificationOp::try_from(2).unwrap(), ModificationOp::Replace);
        assert!(ModificationOp::try_from(7).is_err());
    }
}
