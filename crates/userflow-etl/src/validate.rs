//! Record validation
//!
//! [`validate`] is a pure function from one decoded JSON value to either a
//! typed [`UserRecord`] or the first rule it breaks. Rules run in a fixed
//! order: object shape, required fields, field types, the `validator` length
//! and range rules, and finally email syntax. Deliverability is never checked.

use serde_json::{Map, Value};
use thiserror::Error;
use validator::{Validate, ValidateEmail, ValidationErrors};

/// Youngest accepted age (inclusive)
pub const MIN_AGE: f64 = 10.0;

/// Oldest accepted age (inclusive)
pub const MAX_AGE: f64 = 65.0;

/// Fields every record must carry, in check order
pub const REQUIRED_FIELDS: [&str; 5] = ["id", "firstName", "email", "age", "company"];

const MAX_EMAIL_LEN: usize = 254;

/// A record that passed every rule
///
/// The typed fields are the core the pipeline relies on; `document` keeps the
/// complete original object, including fields this type does not model, so
/// nothing upstream sent is lost on the way to storage.
#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    pub id: i64,
    pub first_name: String,
    pub email: String,
    pub age: f64,
    pub department: String,
    pub document: Map<String, Value>,
}

impl UserRecord {
    /// Original object plus the derived department code
    pub fn into_enriched(self, department_code: &str) -> Map<String, Value> {
        let mut document = self.document;
        document.insert(
            "department_code".to_string(),
            Value::String(department_code.to_string()),
        );
        document
    }
}

/// Why an email address is syntactically unacceptable
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EmailError {
    #[error("The email address is not valid. It must have exactly one @-sign.")]
    AtSign,
    #[error("The email address is too long ({0} characters).")]
    TooLong(usize),
    #[error("The email address is not valid.")]
    Syntax,
    #[error("The part before the @-sign cannot start or end with a dot or contain two dots in a row.")]
    Dots,
    #[error("The part after the @-sign must contain a period.")]
    DomainWithoutPeriod,
}

/// First rule a record breaks; `Display` is the human-readable reason
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Schema error: record is not a JSON object")]
    NotAnObject,

    #[error("Schema error: '{0}' is a required property")]
    MissingField(&'static str),

    #[error("Schema error: '{field}' is not of type '{expected}'")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },

    #[error("Schema error: '{0}' should be non-empty")]
    EmptyString(&'static str),

    #[error("Schema error: {0} is less than the minimum of {min}", min = MIN_AGE)]
    AgeBelowMinimum(f64),

    #[error("Schema error: {0} is greater than the maximum of {max}", max = MAX_AGE)]
    AgeAboveMaximum(f64),

    #[error("Invalid email: {0}")]
    Email(#[from] EmailError),
}

impl ValidationError {
    /// Reason string stored alongside a rejected record
    pub fn reason(&self) -> String {
        self.to_string()
    }
}

/// Typed core fields, checked by the `validator` rules
#[derive(Debug, Validate)]
struct CoreFields {
    #[validate(length(min = 1))]
    first_name: String,

    #[validate(range(min = MIN_AGE, max = MAX_AGE))]
    age: f64,

    #[validate(length(min = 1))]
    department: String,
}

impl CoreFields {
    /// Map the failed rules back to the first one in check order
    fn first_failure(&self, errors: &ValidationErrors) -> ValidationError {
        let failed = errors.field_errors();
        if failed.contains_key("first_name") {
            ValidationError::EmptyString("firstName")
        } else if failed.contains_key("age") {
            if self.age < MIN_AGE {
                ValidationError::AgeBelowMinimum(self.age)
            } else {
                ValidationError::AgeAboveMaximum(self.age)
            }
        } else {
            ValidationError::EmptyString("department")
        }
    }
}

fn integer_field(obj: &Map<String, Value>, field: &'static str) -> Result<i64, ValidationError> {
    obj.get(field)
        .and_then(Value::as_i64)
        .ok_or(ValidationError::WrongType {
            field,
            expected: "integer",
        })
}

fn string_field<'a>(obj: &'a Map<String, Value>, field: &'static str) -> Result<&'a str, ValidationError> {
    obj.get(field)
        .and_then(Value::as_str)
        .ok_or(ValidationError::WrongType {
            field,
            expected: "string",
        })
}

/// Validate one decoded record
pub fn validate(value: &Value) -> Result<UserRecord, ValidationError> {
    let obj = value.as_object().ok_or(ValidationError::NotAnObject)?;

    if let Some(missing) = REQUIRED_FIELDS.iter().find(|f| !obj.contains_key(**f)) {
        return Err(ValidationError::MissingField(*missing));
    }

    let id = integer_field(obj, "id")?;
    let first_name = string_field(obj, "firstName")?;
    let email = string_field(obj, "email")?;
    let age = obj
        .get("age")
        .and_then(Value::as_f64)
        .ok_or(ValidationError::WrongType {
            field: "age",
            expected: "number",
        })?;

    let company = obj
        .get("company")
        .and_then(Value::as_object)
        .ok_or(ValidationError::WrongType {
            field: "company",
            expected: "object",
        })?;
    if !company.contains_key("department") {
        return Err(ValidationError::MissingField("department"));
    }
    let department = string_field(company, "department")?;

    let core = CoreFields {
        first_name: first_name.to_string(),
        age,
        department: department.to_string(),
    };
    if let Err(errors) = core.validate() {
        return Err(core.first_failure(&errors));
    }

    validate_email(email)?;

    Ok(UserRecord {
        id,
        first_name: core.first_name,
        email: email.to_string(),
        age: core.age,
        department: core.department,
        document: obj.clone(),
    })
}

/// Syntactic email check
///
/// `validator`'s HTML5 address rules, tightened to a dotted domain and a
/// local part without empty dot-atoms.
pub fn validate_email(email: &str) -> Result<(), EmailError> {
    let (local, domain) = match email.split_once('@') {
        Some((local, domain)) if !domain.contains('@') => (local, domain),
        _ => return Err(EmailError::AtSign),
    };

    let length = email.chars().count();
    if length > MAX_EMAIL_LEN {
        return Err(EmailError::TooLong(length));
    }

    if !email.validate_email() {
        return Err(EmailError::Syntax);
    }

    if local.split('.').any(str::is_empty) {
        return Err(EmailError::Dots);
    }
    if !domain.contains('.') {
        return Err(EmailError::DomainWithoutPeriod);
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn valid_record() -> Value {
        json!({
            "id": 1,
            "firstName": "Emily",
            "email": "emily.johnson@x.dummyjson.com",
            "age": 28,
            "company": {"department": "Engineering", "name": "Dooley"},
            "hair": {"color": "Brown"}
        })
    }

    #[test]
    fn test_valid_record_keeps_whole_document() {
        let record = validate(&valid_record()).unwrap();
        assert_eq!(record.id, 1);
        assert_eq!(record.first_name, "Emily");
        assert_eq!(record.department, "Engineering");
        assert_eq!(record.document.get("hair"), Some(&json!({"color": "Brown"})));

        let enriched = record.into_enriched("ENG");
        assert_eq!(enriched["department_code"], json!("ENG"));
    }

    #[test]
    fn test_bad_email_is_rejected_with_email_reason() {
        let record = json!({
            "id": 1, "firstName": "A", "email": "bad-email", "age": 30,
            "company": {"department": "Sales"}
        });
        let err = validate(&record).unwrap_err();
        assert_eq!(err, ValidationError::Email(EmailError::AtSign));
        assert!(err.reason().starts_with("Invalid email:"));
        assert!(err.reason().contains("@-sign"));
    }

    #[test]
    fn test_age_below_minimum() {
        let mut record = valid_record();
        record["age"] = json!(5);
        let err = validate(&record).unwrap_err();
        assert_eq!(err, ValidationError::AgeBelowMinimum(5.0));
        assert_eq!(err.reason(), "Schema error: 5 is less than the minimum of 10");
    }

    #[test]
    fn test_age_bounds_are_inclusive() {
        for age in [10, 65] {
            let mut record = valid_record();
            record["age"] = json!(age);
            assert!(validate(&record).is_ok(), "age {} should pass", age);
        }
        let mut record = valid_record();
        record["age"] = json!(65.5);
        assert!(matches!(validate(&record), Err(ValidationError::AgeAboveMaximum(_))));
    }

    #[test]
    fn test_missing_field_reported_in_order() {
        let record = json!({"firstName": "A", "age": 30});
        assert_eq!(validate(&record).unwrap_err(), ValidationError::MissingField("id"));

        let mut record = valid_record();
        record.as_object_mut().unwrap().remove("company");
        assert_eq!(
            validate(&record).unwrap_err().reason(),
            "Schema error: 'company' is a required property"
        );
    }

    #[test]
    fn test_type_and_emptiness_rules() {
        let mut record = valid_record();
        record["id"] = json!("1");
        assert!(matches!(
            validate(&record),
            Err(ValidationError::WrongType { field: "id", .. })
        ));

        let mut record = valid_record();
        record["firstName"] = json!("");
        assert_eq!(validate(&record).unwrap_err(), ValidationError::EmptyString("firstName"));

        let mut record = valid_record();
        record["company"] = json!({"name": "Dooley"});
        assert_eq!(validate(&record).unwrap_err(), ValidationError::MissingField("department"));

        assert_eq!(validate(&json!([1, 2])).unwrap_err(), ValidationError::NotAnObject);
    }

    #[test]
    fn test_schema_rules_run_before_email() {
        let record = json!({
            "id": 1, "firstName": "", "email": "bad-email", "age": 30,
            "company": {"department": "Sales"}
        });
        assert_eq!(validate(&record).unwrap_err(), ValidationError::EmptyString("firstName"));
    }

    #[test]
    fn test_email_syntax() {
        assert!(validate_email("a.b+tag@sub.example.co").is_ok());
        assert!(validate_email("emily.johnson@x.dummyjson.com").is_ok());
        assert_eq!(validate_email("a@@b.com"), Err(EmailError::AtSign));
        assert_eq!(validate_email("@b.com"), Err(EmailError::Syntax));
        assert_eq!(validate_email("a@"), Err(EmailError::Syntax));
        assert_eq!(validate_email("a b@b.com"), Err(EmailError::Syntax));
        assert_eq!(validate_email("a@-b.com"), Err(EmailError::Syntax));
        assert_eq!(validate_email("a..b@b.com"), Err(EmailError::Dots));
        assert_eq!(validate_email(".a@b.com"), Err(EmailError::Dots));
        assert_eq!(validate_email("a@localhost"), Err(EmailError::DomainWithoutPeriod));
        assert_eq!(
            validate_email(&format!("{}@b.com", "x".repeat(65))),
            Err(EmailError::Syntax)
        );
        assert!(matches!(
            validate_email(&format!("a@{}.com", "b".repeat(260))),
            Err(EmailError::TooLong(_))
        ));
    }

    #[test]
    fn test_core_field_rules_report_first_failure() {
        let mut record = valid_record();
        record["firstName"] = json!("");
        record["age"] = json!(99);
        assert_eq!(validate(&record).unwrap_err(), ValidationError::EmptyString("firstName"));

        let mut record = valid_record();
        record["age"] = json!(99);
        record["company"] = json!({"department": ""});
        assert_eq!(validate(&record).unwrap_err(), ValidationError::AgeAboveMaximum(99.0));

        let mut record = valid_record();
        record["company"] = json!({"department": ""});
        assert_eq!(
            validate(&record).unwrap_err().reason(),
            "Schema error: 'department' should be non-empty"
        );
    }

    fn arbitrary_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            (-100.0f64..100.0).prop_map(|n| json!(n)),
            ".{0,12}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 24, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::hash_map(
                    prop_oneof![
                        Just("id".to_string()),
                        Just("firstName".to_string()),
                        Just("email".to_string()),
                        Just("age".to_string()),
                        Just("company".to_string()),
                        Just("department".to_string()),
                        "[a-z]{1,6}",
                    ],
                    inner,
                    0..6
                )
                .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn validation_is_deterministic(value in arbitrary_json()) {
            let first = validate(&value);
            let second = validate(&value);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn accepted_ages_stay_in_bounds(age in -50i64..150) {
            let mut record = valid_record();
            record["age"] = json!(age);
            let accepted = validate(&record).is_ok();
            prop_assert_eq!(accepted, (10..=65).contains(&age));
        }
    }
}
