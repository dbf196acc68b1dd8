//! Subject policy applied to certificate requests.

use crate::{
    cnf::Section,
    errors::{Error, Result},
    name::{DistinguishedName, Field},
};
use core::str::FromStr;

/// How strictly a DN field is required.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Requirement {
    /// May be absent.
    Optional,
    /// Must be present and non-empty.
    Supplied,
    /// Must be present and equal to the CA certificate's value.
    Match,
}

impl FromStr for Requirement {
    type Err = String;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        match s {
            "optional" => Ok(Requirement::Optional),
            "supplied" => Ok(Requirement::Supplied),
            "match" => Ok(Requirement::Match),
            other => Err(format!("unknown policy requirement `{other}`")),
        }
    }
}

/// Ordered mapping from DN field to [`Requirement`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyRuleSet {
    name: String,
    rules: Vec<(Field, Requirement)>,
}

impl PolicyRuleSet {
    /// Build a rule set from explicit rules.
    pub fn new(name: impl Into<String>, rules: Vec<(Field, Requirement)>) -> Self {
        Self {
            name: name.into(),
            rules,
        }
    }

    /// Read a policy section such as `[policy_anything]`.
    pub fn from_section(section: &Section) -> Result<Self> {
        let mut rules: Vec<(Field, Requirement)> = Vec::new();
        for (key, value) in section.entries() {
            let invalid = |reason: String| Error::InvalidSetting {
                section: section.name().to_owned(),
                key: key.to_owned(),
                reason,
            };
            let field =
                Field::from_name(key).ok_or_else(|| invalid("unknown DN field".to_owned()))?;
            let requirement = value.parse::<Requirement>().map_err(invalid)?;
            match rules.iter_mut().find(|(f, _)| *f == field) {
                Some(rule) => rule.1 = requirement,
                None => rules.push((field, requirement)),
            }
        }
        Ok(Self {
            name: section.name().to_owned(),
            rules,
        })
    }

    /// Section name the rules were read from.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requirement for `field`, `None` if the policy does not mention it.
    pub fn requirement(&self, field: Field) -> Option<Requirement> {
        self.rules
            .iter()
            .find(|(f, _)| *f == field)
            .map(|(_, r)| *r)
    }

    /// Check `subject` against the rules and return the subject to place in
    /// the issued certificate.
    ///
    /// With `preserve` the request subject is returned unchanged, including
    /// attributes of unknown type; otherwise only fields named by the policy
    /// are kept, in policy order.
    pub fn apply(
        &self,
        subject: &DistinguishedName,
        ca_subject: &DistinguishedName,
        preserve: bool,
    ) -> Result<DistinguishedName> {
        let mut issued = DistinguishedName::new();

        for &(field, requirement) in &self.rules {
            let value = subject.get(field).filter(|v| !v.is_empty());
            match (requirement, value) {
                (Requirement::Supplied, None) => {
                    return Err(Error::PolicyViolation {
                        field: field.long_name().to_owned(),
                        reason: format!("is required by [{}] but was not supplied", self.name),
                    });
                }
                (Requirement::Match, _) => {
                    let expected = ca_subject.get(field);
                    if value.is_none() || value != expected {
                        return Err(Error::PolicyViolation {
                            field: field.long_name().to_owned(),
                            reason: format!(
                                "must match the CA value {:?}, got {:?}",
                                expected.unwrap_or_default(),
                                value.unwrap_or_default()
                            ),
                        });
                    }
                }
                _ => {}
            }
            if let Some(v) = value {
                issued.set(field, v);
            }
        }

        if preserve {
            return Ok(subject.clone());
        }

        for (field, _) in subject.iter() {
            if self.requirement(field).is_none() {
                tracing::debug!(%field, policy = %self.name, "dropping field not named by policy");
            }
        }
        for atv in subject.opaque() {
            tracing::debug!(oid = %atv.oid, policy = %self.name, "dropping field not named by policy");
        }
        Ok(issued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cnf::Conf;
    use const_oid::ObjectIdentifier;
    use der::{asn1::Any, Tag};
    use x509_cert::attr::AttributeTypeAndValue;

    fn anything() -> PolicyRuleSet {
        let conf = Conf::parse(include_str!("../fixtures/ca/openssl.cnf")).unwrap();
        PolicyRuleSet::from_section(conf.section("policy_anything").unwrap()).unwrap()
    }

    fn ca_subject() -> DistinguishedName {
        DistinguishedName::new()
            .with(Field::Country, "US")
            .with(Field::Organization, "Vector")
            .with(Field::CommonName, "Vector CA")
    }

    #[test]
    fn reads_fixture_policy() {
        let policy = anything();
        assert_eq!(policy.name(), "policy_anything");
        assert_eq!(policy.requirement(Field::CommonName), Some(Requirement::Supplied));
        assert_eq!(policy.requirement(Field::Country), Some(Requirement::Optional));
    }

    #[test]
    fn missing_common_name_is_a_violation() {
        let subject = DistinguishedName::new().with(Field::Organization, "Vector");
        match anything().apply(&subject, &ca_subject(), false) {
            Err(Error::PolicyViolation { field, .. }) => assert_eq!(field, "commonName"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn empty_common_name_is_a_violation() {
        let subject = DistinguishedName::new().with(Field::CommonName, "");
        assert!(matches!(
            anything().apply(&subject, &ca_subject(), false),
            Err(Error::PolicyViolation { .. })
        ));
    }

    #[test]
    fn issued_subject_follows_policy_order() {
        let subject = DistinguishedName::new()
            .with(Field::CommonName, "localhost")
            .with(Field::Country, "US");
        let issued = anything().apply(&subject, &ca_subject(), false).unwrap();
        assert_eq!(issued.to_string(), "/C=US/CN=localhost");

        let preserved = anything().apply(&subject, &ca_subject(), true).unwrap();
        assert_eq!(preserved, subject);
    }

    #[test]
    fn fields_outside_policy_are_dropped() {
        let policy = PolicyRuleSet::new(
            "policy_cn_only",
            vec![(Field::CommonName, Requirement::Supplied)],
        );
        let subject = DistinguishedName::new()
            .with(Field::Locality, "Nowhere")
            .with(Field::CommonName, "host");
        let issued = policy.apply(&subject, &ca_subject(), false).unwrap();
        assert_eq!(issued.to_string(), "/CN=host");
    }

    #[test]
    fn unknown_attribute_types_follow_preserve() {
        let mut subject = DistinguishedName::new();
        subject.push_opaque(AttributeTypeAndValue {
            oid: ObjectIdentifier::new_unwrap("2.5.4.5"),
            value: Any::new(Tag::PrintableString, b"1234".as_slice()).unwrap(),
        });
        subject.set(Field::CommonName, "host");

        let issued = anything().apply(&subject, &ca_subject(), false).unwrap();
        assert_eq!(issued.opaque().count(), 0);
        assert_eq!(issued.to_string(), "/CN=host");

        let preserved = anything().apply(&subject, &ca_subject(), true).unwrap();
        assert_eq!(preserved, subject);
    }

    #[test]
    fn match_requirement() {
        let policy = PolicyRuleSet::new(
            "policy_match",
            vec![
                (Field::Organization, Requirement::Match),
                (Field::CommonName, Requirement::Supplied),
            ],
        );
        let good = DistinguishedName::new()
            .with(Field::Organization, "Vector")
            .with(Field::CommonName, "host");
        assert!(policy.apply(&good, &ca_subject(), false).is_ok());

        let bad = good.clone().with(Field::Organization, "Other");
        assert!(matches!(
            policy.apply(&bad, &ca_subject(), false),
            Err(Error::PolicyViolation { .. })
        ));
    }

    #[test]
    fn rejects_unknown_requirement() {
        let conf = Conf::parse("[p]\ncommonName = sometimes\n").unwrap();
        assert!(matches!(
            PolicyRuleSet::from_section(conf.section("p").unwrap()),
            Err(Error::InvalidSetting { .. })
        ));
    }
}
