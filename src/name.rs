//! Certificate subject and issuer names.

use crate::errors::{Error, Result};
use const_oid::ObjectIdentifier;
use core::fmt;
use der::{
    asn1::{Any, SetOfVec},
    Encode, Tag, Tagged,
};
use x509_cert::{
    attr::AttributeTypeAndValue,
    name::{Name, RdnSequence, RelativeDistinguishedName},
};

/// Distinguished-name attributes understood by the signing policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    /// `countryName` (`C`)
    Country,
    /// `stateOrProvinceName` (`ST`)
    State,
    /// `localityName` (`L`)
    Locality,
    /// `organizationName` (`O`)
    Organization,
    /// `organizationalUnitName` (`OU`)
    OrganizationalUnit,
    /// `commonName` (`CN`)
    CommonName,
    /// `emailAddress`
    Email,
}

impl Field {
    /// Every field, in the order OpenSSL prints them.
    pub const ALL: [Field; 7] = [
        Field::Country,
        Field::State,
        Field::Locality,
        Field::Organization,
        Field::OrganizationalUnit,
        Field::CommonName,
        Field::Email,
    ];

    /// Long name as used in `.cnf` policy sections.
    pub fn long_name(self) -> &'static str {
        match self {
            Field::Country => "countryName",
            Field::State => "stateOrProvinceName",
            Field::Locality => "localityName",
            Field::Organization => "organizationName",
            Field::OrganizationalUnit => "organizationalUnitName",
            Field::CommonName => "commonName",
            Field::Email => "emailAddress",
        }
    }

    /// Short name as used in oneline subjects.
    pub fn short_name(self) -> &'static str {
        match self {
            Field::Country => "C",
            Field::State => "ST",
            Field::Locality => "L",
            Field::Organization => "O",
            Field::OrganizationalUnit => "OU",
            Field::CommonName => "CN",
            Field::Email => "emailAddress",
        }
    }

    /// Attribute type OID.
    pub fn oid(self) -> ObjectIdentifier {
        match self {
            Field::Country => ObjectIdentifier::new_unwrap("2.5.4.6"),
            Field::State => ObjectIdentifier::new_unwrap("2.5.4.8"),
            Field::Locality => ObjectIdentifier::new_unwrap("2.5.4.7"),
            Field::Organization => ObjectIdentifier::new_unwrap("2.5.4.10"),
            Field::OrganizationalUnit => ObjectIdentifier::new_unwrap("2.5.4.11"),
            Field::CommonName => ObjectIdentifier::new_unwrap("2.5.4.3"),
            Field::Email => ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.1"),
        }
    }

    /// Resolve a long or short field name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|f| f.long_name() == name || f.short_name() == name)
    }

    fn from_oid(oid: &ObjectIdentifier) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.oid() == *oid)
    }

    fn value_tag(self) -> Tag {
        match self {
            Field::Country => Tag::PrintableString,
            Field::Email => Tag::Ia5String,
            _ => Tag::Utf8String,
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.long_name())
    }
}

/// One RDN value of a [`DistinguishedName`].
#[derive(Clone, Debug, PartialEq, Eq)]
enum Attribute {
    Known(Field, String),
    /// Attribute type outside [`Field`], kept as encoded.
    Opaque(AttributeTypeAndValue),
}

/// Ordered set of subject attributes.
///
/// Attribute order is significant: it is the order the RDNs appear in the
/// encoded name. Attribute types other than the known [`Field`]s are carried
/// unchanged so that a preserving policy can re-emit them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DistinguishedName {
    attrs: Vec<Attribute>,
}

impl DistinguishedName {
    /// Empty name.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `field`, replacing any previous value in place.
    pub fn with(mut self, field: Field, value: impl Into<String>) -> Self {
        self.set(field, value);
        self
    }

    /// Set `field`, replacing any previous value in place.
    pub fn set(&mut self, field: Field, value: impl Into<String>) {
        let value = value.into();
        match self.known_mut(field) {
            Some(slot) => *slot = value,
            None => self.attrs.push(Attribute::Known(field, value)),
        }
    }

    /// Append an attribute of a type outside [`Field`].
    pub fn push_opaque(&mut self, atv: AttributeTypeAndValue) {
        self.attrs.push(Attribute::Opaque(atv));
    }

    /// Drop `field`, returning its value.
    pub fn remove(&mut self, field: Field) -> Option<String> {
        let idx = self
            .attrs
            .iter()
            .position(|a| matches!(a, Attribute::Known(f, _) if *f == field))?;
        match self.attrs.remove(idx) {
            Attribute::Known(_, value) => Some(value),
            Attribute::Opaque(_) => None,
        }
    }

    /// Value of `field`, if present.
    pub fn get(&self, field: Field) -> Option<&str> {
        self.iter().find(|(f, _)| *f == field).map(|(_, v)| v)
    }

    /// `CN` value.
    pub fn common_name(&self) -> Option<&str> {
        self.get(Field::CommonName)
    }

    /// Known attributes in encoding order.
    pub fn iter(&self) -> impl Iterator<Item = (Field, &str)> {
        self.attrs.iter().filter_map(|a| match a {
            Attribute::Known(f, v) => Some((*f, v.as_str())),
            Attribute::Opaque(_) => None,
        })
    }

    /// Attributes of types outside [`Field`], in encoding order.
    pub fn opaque(&self) -> impl Iterator<Item = &AttributeTypeAndValue> {
        self.attrs.iter().filter_map(|a| match a {
            Attribute::Opaque(atv) => Some(atv),
            Attribute::Known(..) => None,
        })
    }

    /// True when no attribute is set.
    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    fn known_mut(&mut self, field: Field) -> Option<&mut String> {
        self.attrs.iter_mut().find_map(|a| match a {
            Attribute::Known(f, v) if *f == field => Some(v),
            _ => None,
        })
    }

    /// Encode as an X.509 name, one attribute per RDN.
    pub fn to_name(&self) -> Result<Name> {
        let mut rdns = Vec::with_capacity(self.attrs.len());
        for attr in &self.attrs {
            let atv = match attr {
                Attribute::Known(field, value) => AttributeTypeAndValue {
                    oid: field.oid(),
                    value: Any::new(field.value_tag(), value.as_bytes())?,
                },
                Attribute::Opaque(atv) => atv.clone(),
            };
            rdns.push(RelativeDistinguishedName(SetOfVec::try_from(vec![atv])?));
        }
        Ok(RdnSequence(rdns))
    }

    /// Decode an X.509 name. Known fields must carry a directory string;
    /// anything else is kept opaque.
    pub fn from_name(name: &Name) -> Result<Self> {
        let mut dn = Self::new();
        for rdn in name.0.iter() {
            for atv in rdn.0.iter() {
                match Field::from_oid(&atv.oid) {
                    Some(field) => {
                        let value = decode_string(field, &atv.value)?;
                        dn.attrs.push(Attribute::Known(field, value));
                    }
                    None => dn.push_opaque(atv.clone()),
                }
            }
        }
        Ok(dn)
    }

    /// Parse OpenSSL oneline form, e.g. `/C=US/O=Example/CN=host`.
    pub fn parse_oneline(s: &str) -> Result<Self> {
        let body = s
            .strip_prefix('/')
            .ok_or_else(|| Error::InvalidRequest(format!("subject `{s}` must start with `/`")))?;
        let mut dn = Self::new();
        if body.is_empty() {
            return Ok(dn);
        }
        for part in split_unescaped(body) {
            let (key, value) = part.split_once('=').ok_or_else(|| {
                Error::InvalidRequest(format!("subject component `{part}` lacks `=`"))
            })?;
            let field = Field::from_name(key)
                .ok_or_else(|| Error::InvalidRequest(format!("unknown subject field `{key}`")))?;
            dn.attrs
                .push(Attribute::Known(field, value.replace("\\/", "/")));
        }
        Ok(dn)
    }
}

/// Oneline form as written to the CA database.
impl fmt::Display for DistinguishedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for attr in &self.attrs {
            match attr {
                Attribute::Known(field, value) => {
                    write!(f, "/{}={}", field.short_name(), value.replace('/', "\\/"))?
                }
                Attribute::Opaque(atv) => {
                    write!(f, "/{}=#", atv.oid)?;
                    for byte in atv.value.to_der().map_err(|_| fmt::Error)? {
                        write!(f, "{byte:02X}")?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn decode_string(field: Field, value: &Any) -> Result<String> {
    let bytes = value.value();
    let invalid = |reason: &str| {
        Error::InvalidRequest(format!("subject attribute {field} {reason}"))
    };
    match value.tag() {
        Tag::Utf8String | Tag::PrintableString | Tag::Ia5String | Tag::VisibleString => {
            core::str::from_utf8(bytes)
                .map(str::to_owned)
                .map_err(|_| invalid("is not valid text"))
        }
        // T.61 is read as Latin-1, as OpenSSL does.
        Tag::TeletexString => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
        Tag::BmpString => {
            if bytes.len() % 2 != 0 {
                return Err(invalid("has an odd-length BMPString"));
            }
            let units = bytes
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]));
            char::decode_utf16(units)
                .collect::<core::result::Result<String, _>>()
                .map_err(|_| invalid("is not valid UTF-16"))
        }
        other => Err(invalid(&format!("has non-string type {other}"))),
    }
}

fn split_unescaped(body: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut prev = None;
    for (i, c) in body.char_indices() {
        if c == '/' && prev != Some('\\') {
            parts.push(&body[start..i]);
            start = i + 1;
        }
        prev = Some(c);
    }
    parts.push(&body[start..]);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use der::{Decode, Encode};

    fn sample() -> DistinguishedName {
        DistinguishedName::new()
            .with(Field::Country, "US")
            .with(Field::Organization, "Vector")
            .with(Field::CommonName, "localhost")
    }

    #[test]
    fn field_names() {
        assert_eq!(Field::from_name("CN"), Some(Field::CommonName));
        assert_eq!(Field::from_name("stateOrProvinceName"), Some(Field::State));
        assert_eq!(Field::from_name("serialNumber"), None);
    }

    #[test]
    fn x509_name_preserves_order_and_values() {
        let dn = sample();
        let der = dn.to_name().unwrap().to_der().unwrap();
        let decoded = DistinguishedName::from_name(&Name::from_der(&der).unwrap()).unwrap();
        assert_eq!(decoded, dn);
    }

    #[test]
    fn country_is_printable_string() {
        let name = sample().to_name().unwrap();
        assert_eq!(name.0[0].0.iter().next().unwrap().value.tag(), Tag::PrintableString);
        assert_eq!(name.0[2].0.iter().next().unwrap().value.tag(), Tag::Utf8String);
    }

    #[test]
    fn set_replaces_in_place() {
        let dn = sample().with(Field::Country, "DE");
        assert_eq!(dn.to_string(), "/C=DE/O=Vector/CN=localhost");
    }

    #[test]
    fn remove_field() {
        let mut dn = sample().with(Field::Email, "ops@example.com");
        assert_eq!(dn.remove(Field::Email).as_deref(), Some("ops@example.com"));
        assert_eq!(dn.remove(Field::Email), None);
        assert_eq!(dn, sample());
    }

    fn domain_component(value: &str) -> AttributeTypeAndValue {
        AttributeTypeAndValue {
            oid: ObjectIdentifier::new_unwrap("0.9.2342.19200300.100.1.25"),
            value: Any::new(Tag::Ia5String, value.as_bytes()).unwrap(),
        }
    }

    #[test]
    fn unknown_attributes_are_carried_opaque() {
        let mut dn = DistinguishedName::new();
        dn.push_opaque(domain_component("com"));
        dn.set(Field::CommonName, "host");

        let der = dn.to_name().unwrap().to_der().unwrap();
        let decoded = DistinguishedName::from_name(&Name::from_der(&der).unwrap()).unwrap();
        assert_eq!(decoded, dn);
        assert_eq!(decoded.common_name(), Some("host"));
        assert_eq!(decoded.iter().count(), 1);
        assert_eq!(decoded.opaque().next(), Some(&domain_component("com")));
        assert_eq!(
            decoded.to_string(),
            "/0.9.2342.19200300.100.1.25=#1603636F6D/CN=host"
        );
    }

    fn single(field: Field, value: Any) -> Name {
        let atv = AttributeTypeAndValue {
            oid: field.oid(),
            value,
        };
        RdnSequence(vec![RelativeDistinguishedName(
            SetOfVec::try_from(vec![atv]).unwrap(),
        )])
    }

    #[test]
    fn legacy_string_types() {
        let bmp = "h\u{e9}te".encode_utf16().flat_map(u16::to_be_bytes).collect::<Vec<u8>>();
        let name = single(Field::CommonName, Any::new(Tag::BmpString, bmp).unwrap());
        let dn = DistinguishedName::from_name(&name).unwrap();
        assert_eq!(dn.common_name(), Some("h\u{e9}te"));

        let name = single(
            Field::Organization,
            Any::new(Tag::TeletexString, b"Caf\xe9".as_slice()).unwrap(),
        );
        let dn = DistinguishedName::from_name(&name).unwrap();
        assert_eq!(dn.get(Field::Organization), Some("Caf\u{e9}"));

        let name = single(Field::CommonName, Any::new(Tag::BmpString, vec![0, 0x68, 0]).unwrap());
        assert!(matches!(
            DistinguishedName::from_name(&name),
            Err(Error::InvalidRequest(_))
        ));

        let name = single(Field::CommonName, Any::new(Tag::Integer, vec![1]).unwrap());
        assert!(matches!(
            DistinguishedName::from_name(&name),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn oneline_form() {
        let dn = sample().with(Field::OrganizationalUnit, "a/b");
        let line = dn.to_string();
        assert_eq!(line, "/C=US/O=Vector/CN=localhost/OU=a\\/b");
        assert_eq!(DistinguishedName::parse_oneline(&line).unwrap(), dn);
        assert!(DistinguishedName::parse_oneline("CN=x").is_err());
        assert!(DistinguishedName::parse_oneline("/XX=1").is_err());
        assert!(DistinguishedName::parse_oneline("/").unwrap().is_empty());
    }
}
