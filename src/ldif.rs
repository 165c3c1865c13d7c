//! LDIF (RFC 2849) content records for seeding and export.

use crate::dn::Dn;
use crate::entry::Entry;
use crate::error::{DirectoryError, DirectoryResult};
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Placeholder replaced with the configured root DN before parsing.
pub const BASE_DN_PLACEHOLDER: &str = "${ldapBaseDn}";

/// What a bulk import does with a record that fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportPolicy {
    /// Reject the whole import and leave the store untouched.
    #[default]
    Abort,
    /// Load the valid records and report the rest.
    SkipInvalid,
}

/// One parsed entry and the line its `dn:` appeared on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdifRecord {
    pub line: usize,
    pub entry: Entry,
}

pub fn substitute_base_dn(text: &str, root_dn: &str) -> String {
    text.replace(BASE_DN_PLACEHOLDER, root_dn)
}

/// Parse every record; fails on the first malformed one.
pub fn parse(text: &str) -> DirectoryResult<Vec<LdifRecord>> {
    parse_records(text).into_iter().collect()
}

/// Parse records independently so a caller can skip the malformed ones.
pub fn parse_records(text: &str) -> Vec<DirectoryResult<LdifRecord>> {
    let mut results = Vec::new();
    let mut first = true;
    for block in record_blocks(text) {
        let mut lines = block.as_slice();
        if first {
            first = false;
            if let Some((_, line)) = lines.first() {
                if line.to_ascii_lowercase().starts_with("version:") {
                    lines = &lines[1..];
                    if lines.is_empty() {
                        continue;
                    }
                }
            }
        }
        results.push(parse_record(lines));
    }
    results
}

/// Unfolded logical lines grouped into blank-line separated records.
fn record_blocks(text: &str) -> Vec<Vec<(usize, String)>> {
    let mut blocks = Vec::new();
    let mut current: Vec<(usize, String)> = Vec::new();
    let mut in_comment = false;
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim_end_matches('\r');
        if line.trim().is_empty() {
            if !current.is_empty() {
                blocks.push(std::mem::take(&mut current));
            }
            in_comment = false;
            continue;
        }
        if let Some(cont) = line.strip_prefix(' ') {
            if in_comment {
                continue;
            }
            if let Some((_, last)) = current.last_mut() {
                last.push_str(cont);
                continue;
            }
        }
        if line.starts_with('#') {
            in_comment = true;
            continue;
        }
        in_comment = false;
        current.push((idx + 1, line.to_string()));
    }
    if !current.is_empty() {
        blocks.push(current);
    }
    blocks
}

fn ldif_error(line: usize, message: impl Into<String>) -> DirectoryError {
    DirectoryError::Ldif {
        line,
        message: message.into(),
    }
}

fn split_line(line_no: usize, line: &str) -> DirectoryResult<(String, Vec<u8>)> {
    let colon = line
        .find(':')
        .ok_or_else(|| ldif_error(line_no, format!("missing ':' in '{}'", line)))?;
    let name = line[..colon].trim();
    if name.is_empty() {
        return Err(ldif_error(line_no, "empty attribute name"));
    }
    let rest = &line[colon + 1..];
    let value = if let Some(encoded) = rest.strip_prefix(':') {
        base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| ldif_error(line_no, format!("invalid base64 value: {}", e)))?
    } else if rest.starts_with('<') {
        return Err(ldif_error(line_no, "URL values are not supported"));
    } else {
        rest.trim_start_matches(' ').as_bytes().to_vec()
    };
    Ok((name.to_string(), value))
}

fn parse_record(lines: &[(usize, String)]) -> DirectoryResult<LdifRecord> {
    let Some((dn_line, first)) = lines.first() else {
        return Err(ldif_error(0, "empty record"));
    };
    let (name, value) = split_line(*dn_line, first)?;
    if !name.eq_ignore_ascii_case("dn") {
        return Err(ldif_error(*dn_line, format!("record must start with 'dn:', found '{}'", name)));
    }
    let dn_text = String::from_utf8(value).map_err(|_| ldif_error(*dn_line, "DN is not UTF-8"))?;
    let dn = Dn::parse(&dn_text).map_err(|e| ldif_error(*dn_line, e.to_string()))?;

    let mut entry = Entry::new(dn);
    for (line_no, line) in &lines[1..] {
        let (name, value) = split_line(*line_no, line)?;
        if name.eq_ignore_ascii_case("changetype") {
            if value.eq_ignore_ascii_case(b"add") {
                continue;
            }
            return Err(ldif_error(
                *line_no,
                format!("unsupported changetype '{}'", String::from_utf8_lossy(&value)),
            ));
        }
        if name.eq_ignore_ascii_case("control") {
            return Err(ldif_error(*line_no, "controls are not supported"));
        }
        entry.add_value(&name, value);
    }
    Ok(LdifRecord {
        line: *dn_line,
        entry,
    })
}

/// Render entries as an LDIF document.
pub fn to_ldif<'a, I>(entries: I) -> String
where
    I: IntoIterator<Item = &'a Entry>,
{
    let mut out = String::from("version: 1\n");
    for entry in entries {
        out.push('\n');
        out.push_str(&entry.to_ldif());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: &str = "\
version: 1

# root
dn: ${ldapBaseDn}
objectClass: top
objectClass: domain
dc: example

dn: cn=admin,${ldapBaseDn}
objectClass: top
objectClass: person
cn: admin
sn: Administrator
description: a long description that is
  folded over two lines
userPassword:: c2VjcmV0
";

    #[test]
    fn test_substitute_base_dn() {
        let text = substitute_base_dn(SEED, "dc=example,dc=com");
        assert!(!text.contains(BASE_DN_PLACEHOLDER));
        assert!(text.contains("dn: cn=admin,dc=example,dc=com"));
    }

    #[test]
    fn test_parse_records() {
        let records = parse(&substitute_base_dn(SEED, "dc=example,dc=com")).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].line, 4);
        assert_eq!(records[0].entry.dn().to_string(), "dc=example,dc=com");
        let admin = &records[1].entry;
        assert_eq!(records[1].line, 9);
        assert_eq!(admin.values("objectClass").len(), 2);
        assert_eq!(
            admin.first_value_str("description"),
            Some("a long description that is folded over two lines")
        );
        assert_eq!(admin.values("userPassword"), &[b"secret".to_vec()]);
    }

    #[test]
    fn test_errors_carry_line_numbers() {
        let text = "dn: dc=example,dc=com\nobjectClass: top\n\ndn: broken\ncn: x\n";
        let results = parse_records(text);
        assert!(results[0].is_ok());
        match &results[1] {
            Err(DirectoryError::Ldif { line, .. }) => assert_eq!(*line, 4),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(parse(text), Err(DirectoryError::Ldif { line: 4, .. })));
    }

    #[test]
    fn test_record_must_start_with_dn() {
        let err = parse("cn: x\nsn: y\n").unwrap_err();
        assert!(matches!(err, DirectoryError::Ldif { line: 1, .. }));
        assert!(parse("dn: cn=x,dc=com\nnocolon\n").is_err());
        assert!(parse("dn: cn=x,dc=com\nchangetype: delete\n").is_err());
        assert!(parse("dn: cn=x,dc=com\njpegPhoto:< file:///tmp/x.jpg\n").is_err());
    }

    #[test]
    fn test_changetype_add_is_accepted() {
        let records = parse("dn: cn=x,dc=com\nchangetype: add\ncn: x\n").unwrap();
        assert!(!records[0].entry.has_attribute("changetype"));
    }

    #[test]
    fn test_export_round_trips() {
        let records = parse(&substitute_base_dn(SEED, "dc=example,dc=com")).unwrap();
        let text = to_ldif(records.iter().map(|r| &r.entry));
        let again = parse(&text).unwrap();
        assert_eq!(again.len(), records.len());
        assert_eq!(again[1].entry, records[1].entry);
    }

    #[test]
    fn test_import_policy_deserializes() {
        let policy: ImportPolicy = serde_yaml::from_str("skip_invalid").unwrap();
        assert_eq!(policy, ImportPolicy::SkipInvalid);
        assert_eq!(ImportPolicy::default(), ImportPolicy::Abort);
    }
}
