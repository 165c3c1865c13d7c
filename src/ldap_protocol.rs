// LDAP protocol handling with BER encoding/decoding
// Implements the LDAPv3 message subset served by the directory (RFC 4511)

use crate::entry::{Attribute, Modification, ModificationOp};
use crate::error::ResultCode;
use crate::filter::{ExtensibleFilter, Filter, SubstringFilter, MAX_FILTER_DEPTH};
use crate::ldap_handler::{Authentication, Request, Response, ResultEntry, SearchRequest};
use crate::store::SearchScope;
use anyhow::{bail, Context, Result};


// LDAP Control (request)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub ctype: String,
    pub critical: bool,
    pub value: Option<Vec<u8>>,
}

// LDAP Message structure
#[derive(Debug, Clone)]
pub struct LdapMessage {
    pub message_id: i32,
    pub protocol_op: ProtocolOp,
    pub controls: Option<Vec<Control>>,
}

#[derive(Debug, Clone)]
pub enum ProtocolOp {
    /// An operation executed by a session.
    Request(Request),
    AbandonRequest(i32),
    ExtendedRequest(ExtendedRequest),
    BindResponse(LdapResult),
    SearchResultEntry(ResultEntry),
    SearchResultDone(LdapResult),
    ModifyResponse(LdapResult),
    AddResponse(LdapResult),
    DelResponse(LdapResult),
    ModifyDNResponse(LdapResult),
    CompareResponse(LdapResult),
    ExtendedResponse(ExtendedResponse),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedRequest {
    pub request_name: String,
    pub request_value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedResponse {
    pub result: LdapResult,
    pub response_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapResult {
    pub result_code: ResultCode,
    pub matched_dn: String,
    pub diagnostic_message: String,
}

impl LdapResult {
    pub fn new(result_code: ResultCode, diagnostic_message: &str) -> Self {
        Self {
            result_code,
            matched_dn: String::new(),
            diagnostic_message: diagnostic_message.to_string(),
        }
    }
}

impl From<&Response> for LdapResult {
    fn from(response: &Response) -> Self {
        Self {
            result_code: response.result_code,
            matched_dn: response.matched_dn.clone(),
            diagnostic_message: response.diagnostic_message.clone(),
        }
    }
}

// BER parsing utilities. Every constructed element gets its own bounded reader.
pub(crate) struct BerReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BerReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn peek_tag(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn read_tag(&mut self) -> Result<u8> {
        let tag = self.peek_tag().context("BER truncated: missing tag")?;
        self.pos += 1;
        Ok(tag)
    }

    fn read_length(&mut self) -> Result<usize> {
        let first_byte = self.read_tag().context("BER truncated: missing length")?;
        if (first_byte & 0x80) == 0 {
            // Short form
            return Ok(first_byte as usize);
        }
        let length_bytes = (first_byte & 0x7F) as usize;
        if length_bytes == 0 {
            bail!("Indefinite length not supported");
        }
        if length_bytes > 4 {
            bail!("Length too large: {} bytes", length_bytes);
        }
        let bytes = self.read_bytes(length_bytes)?;
        Ok(bytes.iter().fold(0usize, |acc, &b| (acc << 8) | b as usize))
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            bail!("BER truncated: need {} bytes, {} remaining", n, self.remaining());
        }
        let data = self.data;
        let bytes = &data[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    /// One TLV: tag and contents.
    fn read_element(&mut self) -> Result<(u8, &'a [u8])> {
        let tag = self.read_tag()?;
        let length = self.read_length()?;
        Ok((tag, self.read_bytes(length)?))
    }

    fn read_expected(&mut self, expected: u8, what: &str) -> Result<&'a [u8]> {
        let (tag, contents) = self.read_element()?;
        if tag != expected {
            bail!("Expected {} (0x{:02X}), got: 0x{:02X}", what, expected, tag);
        }
        Ok(contents)
    }

    fn read_sequence(&mut self) -> Result<BerReader<'a>> {
        Ok(BerReader::new(self.read_expected(0x30, "SEQUENCE")?))
    }

    /// SET OF; some clients send SEQUENCE OF instead.
    fn read_set(&mut self) -> Result<BerReader<'a>> {
        let (tag, contents) = self.read_element()?;
        if tag != 0x31 && tag != 0x30 {
            bail!("Expected SET tag, got: 0x{:02X}", tag);
        }
        Ok(BerReader::new(contents))
    }

    fn read_integer(&mut self) -> Result<i32> {
        decode_integer(self.read_expected(0x02, "INTEGER")?)
    }

    fn read_octet_string(&mut self) -> Result<Vec<u8>> {
        Ok(self.read_expected(0x04, "OCTET STRING")?.to_vec())
    }

    fn read_string(&mut self) -> Result<String> {
        decode_string(self.read_expected(0x04, "OCTET STRING")?)
    }

    fn read_enumerated(&mut self) -> Result<u8> {
        let value = decode_integer(self.read_expected(0x0A, "ENUMERATED")?)?;
        u8::try_from(value).with_context(|| format!("Enumerated value out of range: {}", value))
    }

    fn read_boolean(&mut self) -> Result<bool> {
        let contents = self.read_expected(0x01, "BOOLEAN")?;
        if contents.len() != 1 {
            bail!("Boolean value must be 1 byte, got: {}", contents.len());
        }
        Ok(contents[0] != 0)
    }

    fn expect_end(&self, what: &str) -> Result<()> {
        if !self.is_empty() {
            bail!("{} has {} trailing bytes", what, self.remaining());
        }
        Ok(())
    }
}

fn decode_integer(bytes: &[u8]) -> Result<i32> {
    if bytes.is_empty() {
        bail!("Empty INTEGER");
    }
    // Allow one leading zero octet in front of a 4-byte magnitude.
    let bytes = if bytes.len() == 5 && bytes[0] == 0 && bytes[1] & 0x80 != 0 {
        &bytes[1..]
    } else {
        bytes
    };
    if bytes.len() > 4 {
        bail!("Integer too large: {} bytes", bytes.len());
    }
    let init: i64 = if bytes[0] & 0x80 != 0 { -1 } else { 0 };
    let value = bytes.iter().fold(init, |acc, &b| (acc << 8) | b as i64);
    i32::try_from(value).with_context(|| format!("Integer out of range: {}", value))
}

fn decode_string(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec()).context("Invalid UTF-8 string")
}

// BER encoding utilities
#[derive(Default)]
pub struct BerWriter {
    buffer: Vec<u8>,
}

impl BerWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_tag(&mut self, tag: u8) {
        self.buffer.push(tag);
    }

    fn write_length(&mut self, length: usize) {
        if length < 128 {
            // Short form
            self.buffer.push(length as u8);
        } else {
            // Long form
            let bytes: Vec<u8> = length
                .to_be_bytes()
                .into_iter()
                .skip_while(|&b| b == 0)
                .collect();
            self.buffer.push(0x80 | bytes.len() as u8);
            self.buffer.extend_from_slice(&bytes);
        }
    }

    pub fn write_element(&mut self, tag: u8, contents: &[u8]) {
        self.write_tag(tag);
        self.write_length(contents.len());
        self.buffer.extend_from_slice(contents);
    }

    /// Constructed element whose contents are written by `build`.
    pub fn write_constructed<F>(&mut self, tag: u8, build: F)
    where
        F: FnOnce(&mut BerWriter),
    {
        let mut inner = BerWriter::new();
        build(&mut inner);
        self.write_element(tag, &inner.buffer);
    }

    pub fn write_sequence<F>(&mut self, build: F)
    where
        F: FnOnce(&mut BerWriter),
    {
        self.write_constructed(0x30, build);
    }

    pub fn write_integer(&mut self, value: i32) {
        let bytes = value.to_be_bytes();
        // Minimal two's complement: drop redundant leading sign octets.
        let mut start = 0;
        while start < 3 {
            let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
                || (bytes[start] == 0xFF && bytes[start + 1] & 0x80 != 0);
            if !redundant {
                break;
            }
            start += 1;
        }
        self.write_element(0x02, &bytes[start..]);
    }

    pub fn write_octet_string(&mut self, data: &[u8]) {
        self.write_element(0x04, data);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_octet_string(s.as_bytes());
    }

    pub fn write_boolean(&mut self, value: bool) {
        self.write_element(0x01, &[if value { 0xFF } else { 0x00 }]);
    }

    pub fn write_enumerated(&mut self, value: u8) {
        if value & 0x80 != 0 {
            self.write_element(0x0A, &[0x00, value]);
        } else {
            self.write_element(0x0A, &[value]);
        }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buffer
    }
}

// LDAP protocol tag constants
pub const LDAP_TAG_BIND_REQUEST: u8 = 0x60;
pub const LDAP_TAG_BIND_RESPONSE: u8 = 0x61;
pub const LDAP_TAG_UNBIND_REQUEST: u8 = 0x42;
pub const LDAP_TAG_SEARCH_REQUEST: u8 = 0x63;
pub const LDAP_TAG_SEARCH_RESULT_ENTRY: u8 = 0x64;
pub const LDAP_TAG_SEARCH_RESULT_DONE: u8 = 0x65;
pub const LDAP_TAG_MODIFY_REQUEST: u8 = 0x66;
pub const LDAP_TAG_MODIFY_RESPONSE: u8 = 0x67;
pub const LDAP_TAG_ADD_REQUEST: u8 = 0x68;
pub const LDAP_TAG_ADD_RESPONSE: u8 = 0x69;
pub const LDAP_TAG_DEL_REQUEST: u8 = 0x4A;
pub const LDAP_TAG_DEL_RESPONSE: u8 = 0x6B;
pub const LDAP_TAG_MODIFY_DN_REQUEST: u8 = 0x6C;
pub const LDAP_TAG_MODIFY_DN_RESPONSE: u8 = 0x6D;
pub const LDAP_TAG_COMPARE_REQUEST: u8 = 0x6E;
pub const LDAP_TAG_COMPARE_RESPONSE: u8 = 0x6F;
pub const LDAP_TAG_ABANDON_REQUEST: u8 = 0x50;
pub const LDAP_TAG_EXTENDED_REQUEST: u8 = 0x77;
pub const LDAP_TAG_EXTENDED_RESPONSE: u8 = 0x78;

/// Context [0] IMPLICIT SEQUENCE OF control
const LDAP_CONTEXT_CONTROLS: u8 = 0xA0;

// Filter CHOICE tags
const FILTER_AND: u8 = 0xA0;
const FILTER_OR: u8 = 0xA1;
const FILTER_NOT: u8 = 0xA2;
const FILTER_EQUALITY: u8 = 0xA3;
const FILTER_SUBSTRINGS: u8 = 0xA4;
const FILTER_GREATER_OR_EQUAL: u8 = 0xA5;
const FILTER_LESS_OR_EQUAL: u8 = 0xA6;
const FILTER_PRESENT: u8 = 0x87;
const FILTER_APPROX: u8 = 0xA8;
const FILTER_EXTENSIBLE: u8 = 0xA9;

/// Parse only the LDAP message header (SEQUENCE, messageID, protocolOp tag).
/// Returns (message_id, request_tag) for building error responses when full parse fails.
pub fn parse_ldap_message_header(data: &[u8]) -> Result<(i32, u8)> {
    let mut reader = BerReader::new(data);
    let tag = reader.read_tag()?;
    if tag != 0x30 {
        bail!("Expected LDAPMessage SEQUENCE, got: 0x{:02X}", tag);
    }
    reader.read_length()?;
    let message_id = reader.read_integer()?;
    let tag = reader.read_tag()?;
    Ok((message_id, tag))
}

pub fn parse_ldap_message(data: &[u8]) -> Result<LdapMessage> {
    let mut outer = BerReader::new(data);

    // LDAPMessage ::= SEQUENCE { messageID, protocolOp, controls [0] OPTIONAL }
    let mut reader = outer.read_sequence()?;
    outer.expect_end("LDAPMessage")?;

    let message_id = reader.read_integer()?;
    if message_id < 0 {
        bail!("Negative message ID: {}", message_id);
    }

    let (tag, body) = reader.read_element()?;
    let mut body_reader = BerReader::new(body);
    let protocol_op = match tag {
        LDAP_TAG_BIND_REQUEST => ProtocolOp::Request(parse_bind_request(&mut body_reader)?),
        LDAP_TAG_UNBIND_REQUEST => ProtocolOp::Request(Request::Unbind),
        LDAP_TAG_SEARCH_REQUEST => ProtocolOp::Request(parse_search_request(&mut body_reader)?),
        LDAP_TAG_MODIFY_REQUEST => ProtocolOp::Request(parse_modify_request(&mut body_reader)?),
        LDAP_TAG_ADD_REQUEST => ProtocolOp::Request(parse_add_request(&mut body_reader)?),
        // DelRequest ::= [APPLICATION 10] LDAPDN (primitive)
        LDAP_TAG_DEL_REQUEST => ProtocolOp::Request(Request::Delete {
            dn: decode_string(body)?,
        }),
        LDAP_TAG_MODIFY_DN_REQUEST => {
            ProtocolOp::Request(parse_modify_dn_request(&mut body_reader)?)
        }
        LDAP_TAG_COMPARE_REQUEST => ProtocolOp::Request(parse_compare_request(&mut body_reader)?),
        // AbandonRequest ::= [APPLICATION 16] MessageID (primitive)
        LDAP_TAG_ABANDON_REQUEST => ProtocolOp::AbandonRequest(decode_integer(body)?),
        LDAP_TAG_EXTENDED_REQUEST => {
            ProtocolOp::ExtendedRequest(parse_extended_request(&mut body_reader)?)
        }
        _ => bail!("Unsupported LDAP operation tag: 0x{:02X}", tag),
    };

    let controls = match reader.peek_tag() {
        Some(LDAP_CONTEXT_CONTROLS) => {
            let contents = reader.read_expected(LDAP_CONTEXT_CONTROLS, "controls")?;
            Some(parse_controls(contents)?)
        }
        Some(other) => bail!("Unexpected element after protocolOp: 0x{:02X}", other),
        None => None,
    };

    Ok(LdapMessage {
        message_id,
        protocol_op,
        controls,
    })
}

/// Parse controls: SEQUENCE OF Control, each Control ::= SEQUENCE { type, critical DEFAULT FALSE, value OPTIONAL }
fn parse_controls(data: &[u8]) -> Result<Vec<Control>> {
    let mut reader = BerReader::new(data);
    let mut controls = Vec::new();
    while !reader.is_empty() {
        let mut control = reader.read_sequence()?;
        let ctype = control.read_string()?;
        let critical = if control.peek_tag() == Some(0x01) {
            control.read_boolean()?
        } else {
            false
        };
        let value = if control.peek_tag() == Some(0x04) {
            Some(control.read_octet_string()?)
        } else {
            None
        };
        control.expect_end("Control")?;
        controls.push(Control {
            ctype,
            critical,
            value,
        });
    }
    Ok(controls)
}

fn parse_bind_request(reader: &mut BerReader) -> Result<Request> {
    let version = reader.read_integer()?;
    let name = reader.read_string()?;

    // Authentication: RFC 4511 simple is [0] IMPLICIT OCTET STRING (0x80), but clients send various tags (0x41, 0x61, 0xD0, etc.).
    // Treat anything that is not SASL (0xA3) as simple bind.
    let (auth_tag, contents) = reader.read_element()?;
    let authentication = if auth_tag == 0xA3 {
        let mut sasl = BerReader::new(contents);
        let mechanism = sasl.read_string()?;
        let credentials = if sasl.is_empty() {
            None
        } else {
            Some(sasl.read_octet_string()?)
        };
        Authentication::Sasl {
            mechanism,
            credentials,
        }
    } else {
        Authentication::Simple(contents.to_vec())
    };
    reader.expect_end("BindRequest")?;

    Ok(Request::Bind {
        // Out-of-range versions are rejected by the session.
        version: u8::try_from(version).unwrap_or(0),
        name,
        authentication,
    })
}

fn parse_search_request(reader: &mut BerReader) -> Result<Request> {
    let base = reader.read_string()?;
    let scope = SearchScope::try_from(reader.read_enumerated()?)?;
    let deref_aliases = reader.read_enumerated()?;
    if deref_aliases > 3 {
        bail!("Invalid derefAliases: {}", deref_aliases);
    }
    let size_limit = reader.read_integer()?;
    let time_limit = reader.read_integer()?;
    if size_limit < 0 || time_limit < 0 {
        bail!("Negative search limit");
    }
    let types_only = reader.read_boolean()?;
    let filter = parse_filter(reader, 0)?;

    let mut attrs = reader.read_sequence()?;
    let mut attributes = Vec::new();
    while !attrs.is_empty() {
        attributes.push(attrs.read_string()?);
    }
    reader.expect_end("SearchRequest")?;

    Ok(Request::Search(SearchRequest {
        base,
        scope,
        size_limit: size_limit as usize,
        time_limit: time_limit as u64,
        types_only,
        filter,
        attributes,
    }))
}

/// Filter ::= CHOICE { and [0], or [1], not [2], equalityMatch [3], substrings [4],
/// greaterOrEqual [5], lessOrEqual [6], present [7], approxMatch [8], extensibleMatch [9] }
fn parse_filter(reader: &mut BerReader, depth: usize) -> Result<Filter> {
    if depth > MAX_FILTER_DEPTH {
        bail!("Filter nested too deeply");
    }
    let (tag, contents) = reader.read_element()?;
    let mut inner = BerReader::new(contents);
    let filter = match tag {
        FILTER_AND | FILTER_OR => {
            let mut members = Vec::new();
            while !inner.is_empty() {
                members.push(parse_filter(&mut inner, depth + 1)?);
            }
            if tag == FILTER_AND {
                Filter::And(members)
            } else {
                Filter::Or(members)
            }
        }
        FILTER_NOT => {
            let member = parse_filter(&mut inner, depth + 1)?;
            inner.expect_end("not filter")?;
            Filter::Not(Box::new(member))
        }
        FILTER_EQUALITY | FILTER_GREATER_OR_EQUAL | FILTER_LESS_OR_EQUAL | FILTER_APPROX => {
            let attribute = inner.read_string()?;
            let value = inner.read_octet_string()?;
            inner.expect_end("attribute value assertion")?;
            match tag {
                FILTER_EQUALITY => Filter::Equality(attribute, value),
                FILTER_GREATER_OR_EQUAL => Filter::GreaterOrEqual(attribute, value),
                FILTER_LESS_OR_EQUAL => Filter::LessOrEqual(attribute, value),
                _ => Filter::Approx(attribute, value),
            }
        }
        FILTER_SUBSTRINGS => {
            let attribute = inner.read_string()?;
            let mut parts = inner.read_sequence()?;
            let mut substrings = SubstringFilter {
                attribute,
                initial: None,
                any: Vec::new(),
                final_value: None,
            };
            let mut seen_any = false;
            while !parts.is_empty() {
                let (part_tag, value) = parts.read_element()?;
                match part_tag {
                    0x80 if substrings.initial.is_none()
                        && !seen_any
                        && substrings.final_value.is_none() =>
                    {
                        substrings.initial = Some(value.to_vec())
                    }
                    0x81 if substrings.final_value.is_none() => {
                        seen_any = true;
                        substrings.any.push(value.to_vec())
                    }
                    0x82 if substrings.final_value.is_none() => {
                        substrings.final_value = Some(value.to_vec())
                    }
                    _ => bail!("Misplaced substring component 0x{:02X}", part_tag),
                }
            }
            if substrings.initial.is_none()
                && substrings.any.is_empty()
                && substrings.final_value.is_none()
            {
                bail!("Substring filter without components");
            }
            Filter::Substrings(substrings)
        }
        FILTER_PRESENT => Filter::Present(decode_string(contents)?),
        FILTER_EXTENSIBLE => {
            let mut extensible = ExtensibleFilter {
                rule: None,
                attribute: None,
                value: Vec::new(),
                dn_attributes: false,
            };
            let mut has_value = false;
            while !inner.is_empty() {
                let (part_tag, value) = inner.read_element()?;
                match part_tag {
                    0x81 => extensible.rule = Some(decode_string(value)?),
                    0x82 => extensible.attribute = Some(decode_string(value)?),
                    0x83 => {
                        extensible.value = value.to_vec();
                        has_value = true;
                    }
                    0x84 => extensible.dn_attributes = value.first().is_some_and(|b| *b != 0),
                    _ => bail!("Unexpected extensible match component 0x{:02X}", part_tag),
                }
            }
            if !has_value || (extensible.rule.is_none() && extensible.attribute.is_none()) {
                bail!("Extensible match needs a value and a rule or type");
            }
            Filter::Extensible(extensible)
        }
        _ => bail!("Unknown filter tag: 0x{:02X}", tag),
    };
    Ok(filter)
}

fn parse_modify_request(reader: &mut BerReader) -> Result<Request> {
    let dn = reader.read_string()?;
    let mut changes_reader = reader.read_sequence()?;
    let mut changes = Vec::new();
    while !changes_reader.is_empty() {
        let mut change = changes_reader.read_sequence()?;
        let operation = change.read_enumerated()?;
        let op = ModificationOp::try_from(operation).map_err(anyhow::Error::msg)?;
        let attribute = parse_attribute(&mut change)?;
        change.expect_end("change")?;
        changes.push(Modification {
            op,
            attribute: attribute.name,
            values: attribute.values,
        });
    }
    reader.expect_end("ModifyRequest")?;
    Ok(Request::Modify { dn, changes })
}

fn parse_add_request(reader: &mut BerReader) -> Result<Request> {
    let dn = reader.read_string()?;
    let mut attrs = reader.read_sequence()?;
    let mut attributes = Vec::new();
    while !attrs.is_empty() {
        let attribute = parse_attribute(&mut attrs)?;
        attributes.push((attribute.name, attribute.values));
    }
    reader.expect_end("AddRequest")?;
    Ok(Request::Add { dn, attributes })
}

/// ModifyDNRequest ::= [APPLICATION 12] SEQUENCE { entry, newrdn, deleteoldrdn, newSuperior [0] OPTIONAL }
fn parse_modify_dn_request(reader: &mut BerReader) -> Result<Request> {
    let dn = reader.read_string()?;
    let new_rdn = reader.read_string()?;
    let delete_old_rdn = reader.read_boolean()?;
    let new_superior = if reader.is_empty() {
        None
    } else {
        Some(decode_string(reader.read_expected(0x80, "newSuperior")?)?)
    };
    reader.expect_end("ModifyDNRequest")?;
    Ok(Request::ModifyDn {
        dn,
        new_rdn,
        delete_old_rdn,
        new_superior,
    })
}

/// CompareRequest ::= [APPLICATION 14] SEQUENCE { entry, ava AttributeValueAssertion }
fn parse_compare_request(reader: &mut BerReader) -> Result<Request> {
    let dn = reader.read_string()?;
    let mut ava = reader.read_sequence()?;
    let attribute = ava.read_string()?;
    let value = ava.read_octet_string()?;
    ava.expect_end("AttributeValueAssertion")?;
    reader.expect_end("CompareRequest")?;
    Ok(Request::Compare {
        dn,
        attribute,
        value,
    })
}

/// ExtendedRequest ::= [APPLICATION 23] SEQUENCE { requestName [0], requestValue [1] OPTIONAL }
fn parse_extended_request(reader: &mut BerReader) -> Result<ExtendedRequest> {
    let request_name = decode_string(reader.read_expected(0x80, "requestName")?)?;
    let request_value = if reader.is_empty() {
        None
    } else {
        Some(reader.read_expected(0x81, "requestValue")?.to_vec())
    };
    reader.expect_end("ExtendedRequest")?;
    Ok(ExtendedRequest {
        request_name,
        request_value,
    })
}

/// PartialAttribute ::= SEQUENCE { type, vals SET OF value }
fn parse_attribute(reader: &mut BerReader) -> Result<Attribute> {
    let mut seq = reader.read_sequence()?;
    let name = seq.read_string()?;
    let mut vals = seq.read_set()?;
    let mut values = Vec::new();
    while !vals.is_empty() {
        values.push(vals.read_octet_string()?);
    }
    seq.expect_end("attribute")?;
    Ok(Attribute::new(name, values))
}

/// Response tag answering a request tag. None for requests without a response.
pub fn response_tag_for_request(request_tag: u8) -> Option<u8> {
    match request_tag {
        LDAP_TAG_BIND_REQUEST => Some(LDAP_TAG_BIND_RESPONSE),
        LDAP_TAG_SEARCH_REQUEST => Some(LDAP_TAG_SEARCH_RESULT_DONE),
        LDAP_TAG_MODIFY_REQUEST => Some(LDAP_TAG_MODIFY_RESPONSE),
        LDAP_TAG_ADD_REQUEST => Some(LDAP_TAG_ADD_RESPONSE),
        LDAP_TAG_DEL_REQUEST => Some(LDAP_TAG_DEL_RESPONSE),
        LDAP_TAG_MODIFY_DN_REQUEST => Some(LDAP_TAG_MODIFY_DN_RESPONSE),
        LDAP_TAG_COMPARE_REQUEST => Some(LDAP_TAG_COMPARE_RESPONSE),
        LDAP_TAG_EXTENDED_REQUEST => Some(LDAP_TAG_EXTENDED_RESPONSE),
        _ => None,
    }
}

/// Application tag of a session request.
pub fn request_tag(request: &Request) -> u8 {
    match request {
        Request::Bind { .. } => LDAP_TAG_BIND_REQUEST,
        Request::Unbind => LDAP_TAG_UNBIND_REQUEST,
        Request::Add { .. } => LDAP_TAG_ADD_REQUEST,
        Request::Delete { .. } => LDAP_TAG_DEL_REQUEST,
        Request::Modify { .. } => LDAP_TAG_MODIFY_REQUEST,
        Request::ModifyDn { .. } => LDAP_TAG_MODIFY_DN_REQUEST,
        Request::Compare { .. } => LDAP_TAG_COMPARE_REQUEST,
        Request::Search(_) => LDAP_TAG_SEARCH_REQUEST,
    }
}

/// Protocol ops answering a request: search entries first, then the result.
pub fn response_ops(request_tag: u8, response: Response) -> Vec<ProtocolOp> {
    let result = LdapResult::from(&response);
    let done = match request_tag {
        LDAP_TAG_BIND_REQUEST => ProtocolOp::BindResponse(result),
        LDAP_TAG_SEARCH_REQUEST => ProtocolOp::SearchResultDone(result),
        LDAP_TAG_MODIFY_REQUEST => ProtocolOp::ModifyResponse(result),
        LDAP_TAG_ADD_REQUEST => ProtocolOp::AddResponse(result),
        LDAP_TAG_DEL_REQUEST => ProtocolOp::DelResponse(result),
        LDAP_TAG_MODIFY_DN_REQUEST => ProtocolOp::ModifyDNResponse(result),
        LDAP_TAG_COMPARE_REQUEST => ProtocolOp::CompareResponse(result),
        _ => return Vec::new(),
    };
    let mut ops: Vec<ProtocolOp> = response
        .entries
        .into_iter()
        .map(ProtocolOp::SearchResultEntry)
        .collect();
    ops.push(done);
    ops
}

pub fn encode_ldap_message(message: &LdapMessage) -> Result<Vec<u8>> {
    let op = &message.protocol_op;
    let (tag, result) = match op {
        ProtocolOp::BindResponse(r) => (LDAP_TAG_BIND_RESPONSE, r),
        ProtocolOp::SearchResultDone(r) => (LDAP_TAG_SEARCH_RESULT_DONE, r),
        ProtocolOp::ModifyResponse(r) => (LDAP_TAG_MODIFY_RESPONSE, r),
        ProtocolOp::AddResponse(r) => (LDAP_TAG_ADD_RESPONSE, r),
        ProtocolOp::DelResponse(r) => (LDAP_TAG_DEL_RESPONSE, r),
        ProtocolOp::ModifyDNResponse(r) => (LDAP_TAG_MODIFY_DN_RESPONSE, r),
        ProtocolOp::CompareResponse(r) => (LDAP_TAG_COMPARE_RESPONSE, r),
        ProtocolOp::ExtendedResponse(r) => (LDAP_TAG_EXTENDED_RESPONSE, &r.result),
        ProtocolOp::SearchResultEntry(entry) => {
            let mut writer = BerWriter::new();
            writer.write_sequence(|w| {
                w.write_integer(message.message_id);
                encode_search_result_entry(w, entry);
            });
            return Ok(writer.into_vec());
        }
        _ => bail!("Cannot encode request operation"),
    };
    let mut writer = BerWriter::new();
    writer.write_sequence(|w| {
        w.write_integer(message.message_id);
        w.write_constructed(tag, |w| {
            encode_result(w, result);
            if let ProtocolOp::ExtendedResponse(ExtendedResponse {
                response_name: Some(name),
                ..
            }) = op
            {
                // responseName [10]
                w.write_element(0x8A, name.as_bytes());
            }
        });
    });
    Ok(writer.into_vec())
}

fn encode_result(writer: &mut BerWriter, result: &LdapResult) {
    writer.write_enumerated(result.result_code.code());
    writer.write_string(&result.matched_dn);
    writer.write_string(&result.diagnostic_message);
}

fn encode_search_result_entry(writer: &mut BerWriter, entry: &ResultEntry) {
    writer.write_constructed(LDAP_TAG_SEARCH_RESULT_ENTRY, |w| {
        w.write_string(&entry.dn);
        w.write_sequence(|w| {
            for attr in &entry.attributes {
                encode_attribute(w, attr);
            }
        });
    });
}

fn encode_attribute(writer: &mut BerWriter, attr: &Attribute) {
    writer.write_sequence(|w| {
        w.write_string(&attr.name);
        w.write_constructed(0x31, |w| {
            for value in &attr.values {
                w.write_octet_string(value);
            }
        });
    });
}
